//! The Docker/OCI v1 image configuration.
//!
//! This is the JSON document a registry stores as the image's config
//! blob: runtime defaults plus the ordered list of layer diff IDs.
//! [`join_layers`] derives a new config from an optional base image
//! config and the layers being added on top of it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::{Blob, LayerOptions};

/// The image config wire form.
///
/// Field order matches the serialized key order of configs produced by
/// Docker itself; unknown keys in fetched base configs are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub architecture: String,
    pub config: ContainerConfig,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container: String,
    pub container_config: ContainerConfig,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    pub os: String,
    pub rootfs: RootFs,
}

/// Container runtime defaults carried by the config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    pub hostname: String,
    pub domainname: String,
    pub user: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub args_escaped: bool,
    pub image: String,
    pub volumes: Vec<String>,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub on_build: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

/// A freshly built layer being appended to an image: the stored blob,
/// its uncompressed digest and the layer's recorded options.
#[derive(Debug, Clone)]
pub struct AddLayer {
    pub blob: Blob,
    pub diff_id: String,
    pub options: LayerOptions,
    /// Description recorded in the image history.
    pub description: Option<String>,
}

/// Compose a new image config from an optional base config and the
/// added layers, ordered base to most-derived.
///
/// Layer options are folded into the runtime config in order: a
/// non-empty working directory or command overwrites the field, and
/// environment entries replace same-named variables. One history
/// record is appended per added layer, and every added diff ID lands
/// at the tail of `rootfs.diff_ids`.
pub fn join_layers(base: Option<&ImageConfig>, add_layers: &[AddLayer]) -> ImageConfig {
    let mut c = base.cloned().unwrap_or_else(|| ImageConfig {
        // Without a base, assume the host platform. Cross-builds must
        // supply a base image.
        architecture: host_architecture().to_string(),
        os: std::env::consts::OS.to_string(),
        ..Default::default()
    });

    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
    c.created = now.clone();

    for add in add_layers {
        if let Some(working_dir) = &add.options.working_dir {
            if !working_dir.is_empty() {
                c.config.working_dir = working_dir.clone();
            }
        }
        if let Some(cmd) = &add.options.cmd {
            c.config.cmd = cmd.clone();
        }
        for (key, value) in &add.options.env {
            set_env(&mut c.config.env, key, value);
        }
    }

    // Docker historically duplicates the config here.
    c.container_config = c.config.clone();

    for add in add_layers {
        let description = add.description.as_deref().unwrap_or("imagebuilder build");
        c.history.push(History {
            created: now.clone(),
            created_by: description.to_string(),
            empty_layer: false,
        });
    }

    c.rootfs.kind = "layers".to_string();
    for add in add_layers {
        c.rootfs.diff_ids.push(add.diff_id.clone());
    }
    c
}

fn set_env(env: &mut Vec<String>, key: &str, value: &str) {
    let entry = format!("{key}={value}");
    let prefix = format!("{key}=");
    match env.iter_mut().find(|e| e.starts_with(&prefix)) {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

fn host_architecture() -> &'static str {
    // Registries speak Docker's architecture names, not Rust's.
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
