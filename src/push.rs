//! Push and fetch orchestration.
//!
//! A push resolves the source layer's base chain, serializes each
//! layer to a blob in the destination repository, composes the image
//! config, uploads every referenced blob and finally PUTs the v2
//! manifest. A fetch mirrors a remote image's manifest and blobs into
//! the local store, where it can serve as a push base.

use std::io::{BufReader, Seek, SeekFrom};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use cap_std_ext::cap_tempfile;
use fn_error_context::context;
use tracing::debug;

use crate::config::{join_layers, AddLayer, ImageConfig};
use crate::reference::ImageSpec;
use crate::registry::{
    ManifestV2, ManifestV2Layer, RegistryClient, CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE,
    MANIFEST_V2_MEDIA_TYPE,
};
use crate::store::{sha256_digest, Blob, BlobRef, ImageManifest, LayerOptions, LayerStore, StoredLayer};

/// Build the layer chain rooted at `source` and push it to `dest`.
///
/// The stored image manifest is written locally as well as pushed, and
/// returned to the caller.
#[context("Pushing {source} to {dest}")]
pub fn push(
    store: &LayerStore,
    registry: &dyn RegistryClient,
    source: &str,
    dest: &str,
    description: Option<&str>,
) -> Result<ImageManifest> {
    if source.is_empty() {
        bail!("source is required");
    }
    let dest_spec = ImageSpec::parse(dest)?;

    // Walk the base chain: a base without a slash names another layer,
    // anything else is an external image reference.
    let mut chain: Vec<(StoredLayer, LayerOptions)> = Vec::new();
    let mut name = source.to_string();
    let base_ref = loop {
        let layer = store
            .find_layer(&name)?
            .ok_or_else(|| anyhow!("layer {name:?} not found"))?;
        let options = layer.options()?;
        let base = options.base.clone();
        chain.push((layer, options));
        match base {
            Some(base) if !base.contains('/') => name = base,
            other => break other,
        }
    };
    // Collected derived-first; the manifest wants base-first.
    chain.reverse();

    let mut base_spec = None;
    let mut base_manifest = None;
    let mut base_config = None;
    if let Some(base) = base_ref {
        let spec = ImageSpec::parse(&base)?;
        let manifest = store
            .find_image_manifest(&spec.repository, &spec.tag)?
            .ok_or_else(|| anyhow!("base image {base:?} not found"))?;
        if manifest.config.digest.is_empty() {
            bail!("base image {base:?} did not have a valid manifest");
        }
        let config_blob = store
            .find_blob(&spec.repository, &manifest.config.digest)?
            .ok_or_else(|| anyhow!("config blob for base image {base:?} not found"))?;
        let config: ImageConfig = serde_json::from_reader(BufReader::new(config_blob.open()?))
            .with_context(|| {
                format!(
                    "Parsing config blob {}/{}",
                    spec.repository, manifest.config.digest
                )
            })?;
        base_spec = Some(spec);
        base_manifest = Some(manifest);
        base_config = Some(config);
    }

    // Serialize every layer in the chain into the destination
    // repository, capturing blob digests and diff IDs.
    let mut add_layers = Vec::new();
    for (layer, options) in &chain {
        let (blob, diff_id) = layer.build_tar(store, &dest_spec.repository)?;
        add_layers.push(AddLayer {
            blob,
            diff_id,
            options: options.clone(),
            description: description.map(|d| d.to_string()),
        });
    }

    let config = join_layers(base_config.as_ref(), &add_layers);
    let config_bytes =
        serde_json::to_vec(&config).context("Serializing image config")?;
    let config_digest = sha256_digest(&config_bytes)?;
    let config_blob = store
        .add_blob(&dest_spec.repository, &config_digest, config_bytes.as_slice())
        .context("Storing config blob")?;

    let mut manifest = ImageManifest {
        repository: String::new(),
        tag: String::new(),
        config: BlobRef {
            digest: config_blob.digest().to_string(),
            size: config_blob.size(),
        },
        layers: Vec::new(),
    };
    if let Some(base_manifest) = &base_manifest {
        manifest.layers.extend(base_manifest.layers.iter().cloned());
    }
    for add in &add_layers {
        manifest.layers.push(BlobRef {
            digest: add.blob.digest().to_string(),
            size: add.blob.size(),
        });
    }
    store.write_image_manifest(&dest_spec.repository, &dest_spec.tag, &mut manifest)?;

    // Resolve every referenced blob locally. Base layers live under
    // the base image's repository and are cross-copied.
    let base_count = base_manifest.as_ref().map(|m| m.layers.len()).unwrap_or(0);
    let mut uploads = vec![config_blob];
    for (i, layer_ref) in manifest.layers.iter().enumerate() {
        let repository = if i < base_count {
            &base_spec.as_ref().unwrap().repository
        } else {
            &dest_spec.repository
        };
        let blob = store
            .find_blob(repository, &layer_ref.digest)?
            .ok_or_else(|| {
                anyhow!("unable to find layer blob {repository} {}", layer_ref.digest)
            })?;
        uploads.push(blob);
    }
    upload_blobs(registry, &dest_spec.repository, &uploads)?;

    let wire = ManifestV2 {
        schema_version: 2,
        media_type: MANIFEST_V2_MEDIA_TYPE.to_string(),
        config: ManifestV2Layer {
            media_type: CONFIG_MEDIA_TYPE.to_string(),
            size: manifest.config.size,
            digest: manifest.config.digest.clone(),
        },
        layers: manifest
            .layers
            .iter()
            .map(|l| ManifestV2Layer {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                size: l.size,
                digest: l.digest.clone(),
            })
            .collect(),
    };
    registry
        .put_manifest(&dest_spec.repository, &dest_spec.tag, &wire)
        .context("Writing manifest")?;

    Ok(manifest)
}

/// Upload a batch of blobs concurrently. All uploads run to
/// completion; the first failure is returned once the batch has
/// drained.
fn upload_blobs(registry: &dyn RegistryClient, repository: &str, blobs: &[Blob]) -> Result<()> {
    let errors = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        for blob in blobs {
            let errors = &errors;
            scope.spawn(move || {
                if let Err(e) = upload_blob(registry, repository, blob) {
                    errors.lock().unwrap().push(e);
                }
            });
        }
    });
    let mut errors = errors.into_inner().unwrap();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.remove(0))
    }
}

#[context("Uploading blob {} to {repository}", blob.digest())]
fn upload_blob(registry: &dyn RegistryClient, repository: &str, blob: &Blob) -> Result<()> {
    if registry.has_blob(repository, blob.digest())? {
        debug!("registry already has blob {}", blob.digest());
        return Ok(());
    }
    let mut src = blob.open()?;
    registry.upload_blob(repository, blob.digest(), &mut src, blob.size())
}

/// Mirror a remote image into the store: its manifest, config blob and
/// layer blobs. Blobs already present locally are reused.
#[context("Fetching {source}")]
pub fn fetch(
    store: &LayerStore,
    registry: &dyn RegistryClient,
    source: &str,
) -> Result<ImageManifest> {
    let spec = ImageSpec::parse(source)?;
    let wire = registry
        .get_manifest(&spec.repository, &spec.tag)
        .context("Getting manifest")?;

    let config_blob = ensure_blob(store, registry, &spec.repository, &wire.config.digest)?;
    let mut manifest = ImageManifest {
        repository: String::new(),
        tag: String::new(),
        config: BlobRef {
            digest: config_blob.digest().to_string(),
            size: config_blob.size(),
        },
        layers: Vec::new(),
    };
    for layer in &wire.layers {
        let blob = ensure_blob(store, registry, &spec.repository, &layer.digest)?;
        manifest.layers.push(BlobRef {
            digest: blob.digest().to_string(),
            size: blob.size(),
        });
    }
    store.write_image_manifest(&spec.repository, &spec.tag, &mut manifest)?;
    Ok(manifest)
}

fn ensure_blob(
    store: &LayerStore,
    registry: &dyn RegistryClient,
    repository: &str,
    digest: &str,
) -> Result<Blob> {
    if let Some(blob) = store.find_blob(repository, digest)? {
        debug!("already have blob {digest}");
        return Ok(blob);
    }
    debug!("downloading blob {digest}");
    let mut tmpfile = cap_tempfile::TempFile::new(store.dir())?;
    let n = registry
        .download_blob(repository, digest, tmpfile.as_file_mut())
        .with_context(|| format!("Downloading blob {digest}"))?;
    debug!("downloaded blob {digest} size={n}");
    tmpfile.as_file_mut().seek(SeekFrom::Start(0))?;
    // add_blob re-hashes the bytes, so a corrupt download cannot land.
    store.add_blob(repository, digest, tmpfile.as_file_mut())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LayerOptions;
    use cap_std_ext::cap_std;
    use std::collections::HashMap;
    use std::io::{Read, Write};

    #[derive(Default)]
    struct FakeRegistry {
        manifests: Mutex<HashMap<(String, String), ManifestV2>>,
        blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
        fail_uploads: bool,
    }

    impl RegistryClient for FakeRegistry {
        fn get_manifest(&self, repository: &str, tag: &str) -> Result<ManifestV2> {
            self.manifests
                .lock()
                .unwrap()
                .get(&(repository.to_string(), tag.to_string()))
                .cloned()
                .ok_or_else(|| anyhow!("manifest unknown: {repository}:{tag}"))
        }

        fn put_manifest(&self, repository: &str, tag: &str, manifest: &ManifestV2) -> Result<()> {
            self.manifests
                .lock()
                .unwrap()
                .insert((repository.to_string(), tag.to_string()), manifest.clone());
            Ok(())
        }

        fn has_blob(&self, repository: &str, digest: &str) -> Result<bool> {
            Ok(self
                .blobs
                .lock()
                .unwrap()
                .contains_key(&(repository.to_string(), digest.to_string())))
        }

        fn download_blob(
            &self,
            repository: &str,
            digest: &str,
            dest: &mut dyn Write,
        ) -> Result<u64> {
            let blobs = self.blobs.lock().unwrap();
            let data = blobs
                .get(&(repository.to_string(), digest.to_string()))
                .ok_or_else(|| anyhow!("blob unknown: {digest}"))?;
            dest.write_all(data)?;
            Ok(data.len() as u64)
        }

        fn upload_blob(
            &self,
            repository: &str,
            digest: &str,
            src: &mut dyn Read,
            length: u64,
        ) -> Result<()> {
            if self.fail_uploads {
                bail!("upload rejected");
            }
            let mut data = Vec::new();
            src.read_to_end(&mut data)?;
            if data.len() as u64 != length {
                bail!("upload length mismatch: declared {length}, got {}", data.len());
            }
            self.blobs
                .lock()
                .unwrap()
                .insert((repository.to_string(), digest.to_string()), data);
            Ok(())
        }
    }

    fn test_store() -> Result<(cap_tempfile::TempDir, LayerStore)> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let store = LayerStore::new(&td)?;
        Ok((td, store))
    }

    /// Seed the store with an already-fetched base image and return
    /// (base layer digest, base diff_id).
    fn seed_base_image(store: &LayerStore) -> Result<(String, String)> {
        let layer_data = b"base layer data";
        let layer_digest = sha256_digest(layer_data)?;
        store.add_blob("library/alpine", &layer_digest, &layer_data[..])?;

        let base_diff = sha256_digest(b"uncompressed base layer")?;
        let config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            rootfs: crate::config::RootFs {
                kind: "layers".to_string(),
                diff_ids: vec![base_diff.clone()],
            },
            ..Default::default()
        };
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = sha256_digest(&config_bytes)?;
        store.add_blob("library/alpine", &config_digest, config_bytes.as_slice())?;

        let mut manifest = ImageManifest {
            repository: String::new(),
            tag: String::new(),
            config: BlobRef {
                digest: config_digest,
                size: config_bytes.len() as u64,
            },
            layers: vec![BlobRef {
                digest: layer_digest.clone(),
                size: layer_data.len() as u64,
            }],
        };
        store.write_image_manifest("library/alpine", "3", &mut manifest)?;
        Ok((layer_digest, base_diff))
    }

    #[test]
    fn push_layer_chain_with_base() -> Result<()> {
        let (_td, store) = test_store()?;
        let (base_digest, base_diff) = seed_base_image(&store)?;

        let a = store.create_layer(
            "a",
            LayerOptions {
                base: Some("docker://library/alpine:3".to_string()),
                cmd: Some(vec!["/usr/bin/app".to_string()]),
                ..Default::default()
            },
        )?;
        a.put_file("usr/bin/app", 0o755, &b"#!app"[..])?;

        let b = store.create_layer(
            "b",
            LayerOptions {
                base: Some("a".to_string()),
                env: [("PORT".to_string(), "8080".to_string())].into(),
                ..Default::default()
            },
        )?;
        b.put_file("etc/app.conf", 0o644, &b"port=8080\n"[..])?;

        let registry = FakeRegistry::default();
        let manifest = push(&store, &registry, "b", "docker://example.com/acme/app:1.0", None)?;

        // Base layers precede the new layers, in chain order.
        assert_eq!(manifest.repository, "acme/app");
        assert_eq!(manifest.tag, "1.0");
        assert_eq!(manifest.layers.len(), 3);
        assert_eq!(manifest.layers[0].digest, base_digest);

        // The wire manifest mirrors the stored one, with fixed media
        // types.
        let wire = registry
            .manifests
            .lock()
            .unwrap()
            .get(&("acme/app".to_string(), "1.0".to_string()))
            .cloned()
            .unwrap();
        assert_eq!(wire.schema_version, 2);
        assert_eq!(wire.media_type, MANIFEST_V2_MEDIA_TYPE);
        assert_eq!(wire.config.media_type, CONFIG_MEDIA_TYPE);
        assert_eq!(wire.config.digest, manifest.config.digest);
        let wire_digests: Vec<_> = wire.layers.iter().map(|l| l.digest.clone()).collect();
        let stored_digests: Vec<_> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
        assert_eq!(wire_digests, stored_digests);
        assert!(wire.layers.iter().all(|l| l.media_type == LAYER_MEDIA_TYPE));

        // Every referenced blob was uploaded to the destination
        // repository, including the cross-copied base layer.
        let blobs = registry.blobs.lock().unwrap();
        for digest in std::iter::once(&manifest.config.digest)
            .chain(stored_digests.iter())
        {
            assert!(
                blobs.contains_key(&("acme/app".to_string(), digest.clone())),
                "missing upload: {digest}"
            );
        }

        // The uploaded config lists diff IDs in base → derived order
        // and carries the folded-in options.
        let config_bytes = blobs
            .get(&("acme/app".to_string(), manifest.config.digest.clone()))
            .unwrap();
        let config: ImageConfig = serde_json::from_slice(config_bytes)?;
        assert_eq!(config.rootfs.diff_ids.len(), 3);
        assert_eq!(config.rootfs.diff_ids[0], base_diff);
        assert_eq!(config.config.cmd, vec!["/usr/bin/app"]);
        assert!(config.config.env.contains(&"PORT=8080".to_string()));
        assert_eq!(config.history.len(), 2);
        Ok(())
    }

    #[test]
    fn push_without_base() -> Result<()> {
        let (_td, store) = test_store()?;
        let layer = store.create_layer("solo", LayerOptions::default())?;
        layer.put_file("hello.txt", 0o644, &b"hi"[..])?;

        let registry = FakeRegistry::default();
        let manifest = push(&store, &registry, "solo", "docker://acme/solo:1", None)?;
        assert_eq!(manifest.layers.len(), 1);

        let blobs = registry.blobs.lock().unwrap();
        let config_bytes = blobs
            .get(&("acme/solo".to_string(), manifest.config.digest.clone()))
            .unwrap();
        let config: ImageConfig = serde_json::from_slice(config_bytes)?;
        assert_eq!(config.rootfs.diff_ids.len(), 1);
        assert_eq!(config.os, std::env::consts::OS);
        Ok(())
    }

    #[test]
    fn push_missing_layer_fails() -> Result<()> {
        let (_td, store) = test_store()?;
        let registry = FakeRegistry::default();
        let err = push(&store, &registry, "ghost", "docker://acme/app:1", None)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("not found"));
        Ok(())
    }

    #[test]
    fn push_surfaces_upload_failures() -> Result<()> {
        let (_td, store) = test_store()?;
        let layer = store.create_layer("solo", LayerOptions::default())?;
        layer.put_file("hello.txt", 0o644, &b"hi"[..])?;

        let registry = FakeRegistry {
            fail_uploads: true,
            ..Default::default()
        };
        let err = push(&store, &registry, "solo", "docker://acme/solo:1", None)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("upload rejected"));
        Ok(())
    }

    #[test]
    fn fetch_mirrors_manifest_and_blobs() -> Result<()> {
        let (_td, store) = test_store()?;
        let registry = FakeRegistry::default();

        let config_data = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let config_digest = sha256_digest(&config_data)?;
        let layer_data = b"remote layer".to_vec();
        let layer_digest = sha256_digest(&layer_data)?;
        {
            let mut blobs = registry.blobs.lock().unwrap();
            blobs.insert(
                ("library/busybox".to_string(), config_digest.clone()),
                config_data.clone(),
            );
            blobs.insert(
                ("library/busybox".to_string(), layer_digest.clone()),
                layer_data.clone(),
            );
        }
        registry.put_manifest(
            "library/busybox",
            "latest",
            &ManifestV2 {
                schema_version: 2,
                media_type: MANIFEST_V2_MEDIA_TYPE.to_string(),
                config: ManifestV2Layer {
                    media_type: CONFIG_MEDIA_TYPE.to_string(),
                    size: config_data.len() as u64,
                    digest: config_digest.clone(),
                },
                layers: vec![ManifestV2Layer {
                    media_type: LAYER_MEDIA_TYPE.to_string(),
                    size: layer_data.len() as u64,
                    digest: layer_digest.clone(),
                }],
            },
        )?;

        let manifest = fetch(&store, &registry, "docker://busybox")?;
        assert_eq!(manifest.repository, "library/busybox");
        assert_eq!(manifest.tag, "latest");
        assert_eq!(manifest.config.digest, config_digest);
        assert_eq!(manifest.layers[0].digest, layer_digest);

        // Blobs landed in the store and verify.
        assert!(store.find_blob("library/busybox", &config_digest)?.is_some());
        assert!(store.find_blob("library/busybox", &layer_digest)?.is_some());
        assert_eq!(store.fsck()?, 2);
        assert!(store
            .find_image_manifest("library/busybox", "latest")?
            .is_some());

        // A second fetch reuses the local blobs.
        fetch(&store, &registry, "docker://busybox")?;
        Ok(())
    }
}
