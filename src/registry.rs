//! The registry client contract and the Docker v2 wire manifest.
//!
//! The HTTP client itself lives outside this crate; implementations
//! are expected to handle the registry auth challenge (401 with
//! `Www-Authenticate` → token fetch → replay) transparently, so these
//! operations present an already-authenticated view.

use std::io::{Read, Write};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Media type of a v2 image manifest.
pub const MANIFEST_V2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Media type of an image config blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// Media type of a gzipped layer blob.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// A blob reference inside a wire manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestV2Layer {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// The Docker distribution manifest, schema version 2.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestV2 {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: ManifestV2Layer,
    pub layers: Vec<ManifestV2Layer>,
}

/// Operations the push/fetch orchestration needs from a registry.
pub trait RegistryClient: Send + Sync {
    fn get_manifest(&self, repository: &str, tag: &str) -> Result<ManifestV2>;

    fn put_manifest(&self, repository: &str, tag: &str, manifest: &ManifestV2) -> Result<()>;

    fn has_blob(&self, repository: &str, digest: &str) -> Result<bool>;

    /// Stream a blob into `dest`, returning the number of bytes
    /// written.
    fn download_blob(&self, repository: &str, digest: &str, dest: &mut dyn Write) -> Result<u64>;

    /// Upload `length` bytes from `src` under the given digest.
    fn upload_blob(
        &self,
        repository: &str,
        digest: &str,
        src: &mut dyn Read,
        length: u64,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_wire_form() -> Result<()> {
        let manifest = ManifestV2 {
            schema_version: 2,
            media_type: MANIFEST_V2_MEDIA_TYPE.to_string(),
            config: ManifestV2Layer {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                size: 754,
                digest: "sha256:54977ab597b345c2238ba28fe18aad751e5c59dc38b9393f6f349255f0daa7fc"
                    .to_string(),
            },
            layers: vec![ManifestV2Layer {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                size: 5462,
                digest: "sha256:ee02768e65e6fb2bb7058282338896282910f3560de3e0d6cd9b1d5985e8360d"
                    .to_string(),
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&manifest)?)?;
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(
            value["mediaType"],
            "application/vnd.docker.distribution.manifest.v2+json"
        );
        assert_eq!(value["config"]["size"], 754);
        assert_eq!(
            value["layers"][0]["digest"],
            "sha256:ee02768e65e6fb2bb7058282338896282910f3560de3e0d6cd9b1d5985e8360d"
        );

        let parsed: ManifestV2 = serde_json::from_value(value)?;
        assert_eq!(parsed, manifest);
        Ok(())
    }
}
