//! `docker://` image references.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};

/// A parsed `docker://[host/]repo[:tag]` reference.
///
/// A missing tag defaults to `latest`. A single-component name is
/// prefixed with `library/`; two components form `owner/repo`; with
/// three the first names the registry host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Registry host, if the reference names one. URL schemes are the
    /// registry client's concern.
    pub host: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl ImageSpec {
    pub fn parse(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix("docker://") else {
            bail!("unknown scheme {s:?} - try e.g. docker://ubuntu:14.04");
        };

        let tokens: Vec<&str> = rest.split(':').collect();
        let (name, tag) = match tokens[..] {
            [name] => (name, "latest"),
            [name, tag] => (name, tag),
            _ => bail!("unknown docker image format {s:?}"),
        };
        if name.is_empty() || tag.is_empty() {
            bail!("unknown docker image format {s:?}");
        }

        let parts: Vec<&str> = name.split('/').collect();
        let (host, repository) = match parts[..] {
            [repo] => (None, format!("library/{repo}")),
            [owner, repo] => (None, format!("{owner}/{repo}")),
            [host, owner, repo] => (Some(host.to_string()), format!("{owner}/{repo}")),
            _ => bail!("unknown docker image format {s:?}"),
        };
        if repository.split('/').any(|p| p.is_empty()) {
            bail!("unknown docker image format {s:?}");
        }

        Ok(Self {
            host,
            repository,
            tag: tag.to_string(),
        })
    }
}

impl FromStr for ImageSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "docker://")?;
        if let Some(host) = &self.host {
            write!(f, "{host}/")?;
        }
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
