//! Stream archive contents and directory trees into a layer.
//!
//! All ingest goes through [`ByteSource`]s, so a tarball on disk, a
//! gzip-compressed stream and the xz payload of a Debian package all
//! take the same path into the tree.

use std::io::Read;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use fn_error_context::context;
use tracing::{debug, warn};

use crate::source::{ByteSource, BufferSource, GzipSource, OnceSource, XzSource};
use crate::tree::{directory_header, LayerBuilder};

/// Read tar records from `source` and project them into the layer
/// under `dest`.
///
/// Entry names are normalized by stripping a leading `./` component
/// and a trailing empty component; an entry whose remaining path is
/// empty is skipped. Regular file payloads are buffered in memory
/// because the tar reader is single-pass. Entry kinds other than
/// regular files and directories are skipped with a warning.
#[context("Ingesting tar {}", source.name())]
pub fn add_tar(layer: &mut LayerBuilder, dest: &[String], source: &dyn ByteSource) -> Result<()> {
    let reader = source.open()?;
    ingest_tar_stream(layer, dest, reader, source.name())
}

fn ingest_tar_stream(
    layer: &mut LayerBuilder,
    dest: &[String],
    reader: impl Read,
    name: &str,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry.with_context(|| format!("Reading tar file {name}"))?;
        let entry_name = {
            let path = entry.path()?;
            path.to_str()
                .with_context(|| format!("Non-UTF-8 tar entry in {name}: {path:?}"))?
                .to_string()
        };
        debug!("tar entry: {entry_name}");

        let mut components: Vec<&str> = entry_name.split('/').collect();
        if components.first() == Some(&".") {
            components.remove(0);
        }
        if components.last() == Some(&"") {
            components.pop();
        }
        if components.is_empty() {
            continue;
        }
        let mut path: Vec<String> = dest.to_vec();
        path.extend(components.iter().map(|c| c.to_string()));

        let header = entry.header().clone();
        let kind = header.entry_type();
        if kind.is_dir() {
            layer
                .mkdirp(&path, &header)
                .with_context(|| format!("Adding dir from {name}"))?;
        } else if kind.is_file() {
            let content = BufferSource::from_reader(&mut entry, format!("{name}:{entry_name}"))?;
            layer
                .add_entry(&path, Some(Box::new(content)), &header, false)
                .with_context(|| format!("Adding file from {name}"))?;
        } else {
            warn!("skipping unsupported tar entry type {:?}: {entry_name}", kind);
        }
    }
    Ok(())
}

/// Ingest the payload of a Debian package.
///
/// The outer archive is an ar archive; the `data.tar.xz` or
/// `data.tar.gz` member is decompressed and fed to [`add_tar`] without
/// buffering. Other members are drained so the ar reader stays
/// aligned. A package with no data member is an error.
#[context("Ingesting deb {}", source.name())]
pub fn add_deb(layer: &mut LayerBuilder, dest: &[String], source: &dyn ByteSource) -> Result<()> {
    let name = source.name().to_string();
    let reader = source.open()?;
    let mut archive = ar::Archive::new(reader);

    let mut found_data = false;
    while let Some(entry) = archive.next_entry() {
        let mut entry = entry.with_context(|| format!("Reading deb file {name}"))?;
        let member = String::from_utf8_lossy(entry.header().identifier()).into_owned();
        debug!("ar entry: {member}");

        match member.strip_suffix('/').unwrap_or(&member) {
            "data.tar.xz" => {
                found_data = true;
                let src = XzSource::new(OnceSource::new(&mut entry, name.clone()));
                add_tar(layer, dest, &src)?;
            }
            "data.tar.gz" => {
                found_data = true;
                let src = GzipSource::new(OnceSource::new(&mut entry, name.clone()));
                add_tar(layer, dest, &src)?;
            }
            _ => {
                std::io::copy(&mut entry, &mut std::io::sink())
                    .with_context(|| format!("Reading deb file entry {member}"))?;
            }
        }
    }

    if !found_data {
        bail!("unable to find data segment in {name}");
    }
    Ok(())
}

/// Recursively copy a source directory into the layer under `dest`.
///
/// Subdirectory entries are created up front so their contents can be
/// inserted, then re-stamped from filesystem metadata after the walk;
/// their modification times therefore reflect the state at scan time.
/// Symlinks are not supported and fail the ingest.
#[context("Ingesting directory tree {src}")]
pub fn add_directory(layer: &mut LayerBuilder, dest: &[String], src: &Utf8Path) -> Result<()> {
    let dir = Dir::open_ambient_dir(src, cap_std::ambient_authority())
        .with_context(|| format!("Opening {src}"))?;
    walk_tree(layer, &dir, src, dest)
}

fn walk_tree(
    layer: &mut LayerBuilder,
    dir: &Dir,
    src: &Utf8Path,
    dest: &[String],
) -> Result<()> {
    let mut entries = dir
        .entries()
        .with_context(|| format!("Reading source directory {src}"))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry
            .file_name()
            .into_string()
            .map_err(|n| anyhow::anyhow!("Non-UTF-8 file name in {src}: {n:?}"))?;
        let meta = entry.metadata()?;
        let child_src: Utf8PathBuf = src.join(&name);
        let mut child_dest = dest.to_vec();
        child_dest.push(name.clone());

        if meta.is_dir() {
            layer.mkdirp(&child_dest, &directory_header(0o755))?;
            let subdir = dir
                .open_dir(&name)
                .with_context(|| format!("Opening {child_src}"))?;
            walk_tree(layer, &subdir, &child_src, &child_dest)?;
            layer.add_file_entry(&child_dest, &child_src, &meta, true)?;
        } else {
            layer.add_file_entry(&child_dest, &child_src, &meta, false)?;
        }
    }
    Ok(())
}
