//! The on-disk layer store.
//!
//! The store is a plain directory tree owned through a capability
//! [`Dir`] handle:
//!
//! ```text
//! layers/<name>/metadata.json     serialized options
//! layers/<name>/rootfs/...        staged files for directory-style layers
//! blob/<repository>/<digest>      content-addressed blobs
//! image/<repository>/<tag>        stored image manifests (JSON)
//! ```
//!
//! Blobs are written through a temp file and only land under their
//! digest after the hash has been verified, so a crashed or corrupt
//! ingest never leaves a bad blob behind.

use std::collections::BTreeMap;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8Path;
use cap_std::fs::{Dir, DirBuilder, DirBuilderExt, OpenOptions, OpenOptionsExt};
use cap_std_ext::cap_std;
use cap_std_ext::cap_tempfile;
use cap_std_ext::dirext::CapStdExtDirExt;
use flate2::write::GzEncoder;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tree::{header_from_metadata, LayerBuilder};

/// Length of a `sha256:`-prefixed hex digest.
const DIGEST_LEN: usize = 71;

/// Runtime configuration recorded alongside a layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerOptions {
    /// Base layer name, or an external image reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LayerMetadata {
    #[serde(default)]
    options: LayerOptions,
}

/// A digest/size pair referencing a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub digest: String,
    pub size: u64,
}

/// The stored form of an image: its config blob and ordered layer
/// blobs (compressed digests, base first).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub repository: String,
    pub tag: String,
    pub config: BlobRef,
    #[serde(default)]
    pub layers: Vec<BlobRef>,
}

/// A blob present in the store.
#[derive(Debug, Clone)]
pub struct Blob {
    dir: Arc<Dir>,
    repository: String,
    digest: String,
    size: u64,
}

impl Blob {
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the blob's bytes for reading.
    pub fn open(&self) -> Result<std::fs::File> {
        self.dir
            .open(format!("blob/{}/{}", self.repository, self.digest))
            .map(|f| f.into_std())
            .map_err(Into::into)
    }
}

/// The content-addressed store rooted at a directory.
#[derive(Debug)]
pub struct LayerStore {
    dir: Arc<Dir>,
}

impl LayerStore {
    /// Open a store rooted at the target directory. Subdirectories are
    /// created on first use.
    #[context("Opening layer store")]
    pub fn new(dir: &Dir) -> Result<Self> {
        let dir = Arc::new(dir.try_clone()?);
        Ok(Self { dir })
    }

    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    /// Create a layer directory and write its metadata. Creating a
    /// layer that already exists re-writes its options.
    #[context("Creating layer {name}")]
    pub fn create_layer(&self, name: &str, options: LayerOptions) -> Result<StoredLayer> {
        single_filename(name)?;
        let path = format!("layers/{name}");
        self.dir.ensure_dir_with(&path, &dirbuilder())?;
        let layer = StoredLayer {
            name: name.to_string(),
            dir: self.dir.open_dir(&path)?,
        };
        layer.set_options(options)?;
        Ok(layer)
    }

    /// Look up a layer by name; absence is not an error.
    pub fn find_layer(&self, name: &str) -> Result<Option<StoredLayer>> {
        single_filename(name)?;
        let path = format!("layers/{name}");
        if !self.dir.try_exists(&path)? {
            return Ok(None);
        }
        Ok(Some(StoredLayer {
            name: name.to_string(),
            dir: self.dir.open_dir(&path)?,
        }))
    }

    /// Remove a layer directory and everything staged in it.
    #[context("Deleting layer {name}")]
    pub fn delete_layer(&self, name: &str) -> Result<()> {
        single_filename(name)?;
        let path = format!("layers/{name}");
        if !self.dir.try_exists(&path)? {
            bail!("layer {name:?} not found");
        }
        self.dir.remove_dir_all(&path)?;
        Ok(())
    }

    /// Stream `src` into the store under the declared digest, hashing
    /// as it is copied. A mismatch between the declared and computed
    /// digest aborts the ingest and leaves nothing behind.
    #[context("Adding blob {digest} to {repository}")]
    pub fn add_blob(&self, repository: &str, digest: &str, mut src: impl Read) -> Result<Blob> {
        validate_repository(repository)?;
        validate_digest(digest)?;
        let mut bw = BlobWriter::new(&self.dir)?;
        std::io::copy(&mut src, &mut bw)?;
        let (actual, size, target) = bw.finish()?;
        if actual != digest {
            // Dropping the temp file discards the partial write.
            bail!("digest does not match: declared {digest}, computed {actual}");
        }
        self.dir
            .ensure_dir_with(format!("blob/{repository}"), &dirbuilder())?;
        target.replace(format!("blob/{repository}/{digest}"))?;
        debug!("stored blob {repository}/{digest}");
        Ok(Blob {
            dir: Arc::clone(&self.dir),
            repository: repository.to_string(),
            digest: digest.to_string(),
            size,
        })
    }

    /// Look up a blob by digest; absence is not an error.
    pub fn find_blob(&self, repository: &str, digest: &str) -> Result<Option<Blob>> {
        validate_repository(repository)?;
        validate_digest(digest)?;
        let path = format!("blob/{repository}/{digest}");
        match self.dir.metadata(&path) {
            Ok(meta) => Ok(Some(Blob {
                dir: Arc::clone(&self.dir),
                repository: repository.to_string(),
                digest: digest.to_string(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading blob file {path}")),
        }
    }

    /// Persist an image manifest under `image/<repository>/<tag>`. The
    /// manifest's repository and tag fields are overwritten to match
    /// the path.
    #[context("Writing image manifest {repository}:{tag}")]
    pub fn write_image_manifest(
        &self,
        repository: &str,
        tag: &str,
        manifest: &mut ImageManifest,
    ) -> Result<()> {
        validate_repository(repository)?;
        single_filename(tag)?;
        manifest.repository = repository.to_string();
        manifest.tag = tag.to_string();
        self.dir
            .ensure_dir_with(format!("image/{repository}"), &dirbuilder())?;
        let data = serde_json::to_vec_pretty(manifest)?;
        self.dir
            .atomic_write(format!("image/{repository}/{tag}"), &data)?;
        Ok(())
    }

    /// Read back a stored image manifest; absence is not an error.
    pub fn find_image_manifest(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Option<ImageManifest>> {
        validate_repository(repository)?;
        single_filename(tag)?;
        let path = format!("image/{repository}/{tag}");
        let Some(f) = self.dir.open_optional(&path)? else {
            return Ok(None);
        };
        let manifest = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("Parsing image manifest {path}"))?;
        Ok(Some(manifest))
    }

    /// Serialize an in-memory layer tree to a gzipped tar blob in
    /// `repository`, returning the blob and the layer's diff ID.
    pub fn build_layer_blob(&self, repository: &str, layer: &LayerBuilder) -> Result<(Blob, String)> {
        self.build_blob(repository, |builder| layer.write_tar(builder))
    }

    /// The tar → gzip → sha256 fan-out. `emit` writes tar entries; the
    /// uncompressed stream is hashed for the diff ID while the
    /// compressed stream is hashed and spooled to a temp file, which is
    /// then re-ingested through [`Self::add_blob`] so the declared
    /// digest is verified against what was written.
    #[context("Building layer blob for {repository}")]
    fn build_blob<'s, F>(&'s self, repository: &str, emit: F) -> Result<(Blob, String)>
    where
        F: FnOnce(&mut tar::Builder<GzipLayerWriter<'s>>) -> Result<()>,
    {
        let writer = GzipLayerWriter::new(&self.dir)?;
        let mut builder = tar::Builder::new(writer);
        emit(&mut builder)?;
        // The tar stream must be finished before the gzip stream.
        let writer = builder.into_inner()?;
        let mut finished = writer.complete()?;
        finished.target.as_file_mut().seek(SeekFrom::Start(0))?;
        let blob = self.add_blob(repository, &finished.digest, finished.target.as_file_mut())?;
        Ok((blob, finished.diff_id))
    }

    /// Verify every blob in the store hashes to its file name.
    /// Returns the number of verified blobs.
    pub fn fsck(&self) -> Result<u32> {
        let mut verified = 0;
        let Some(blobroot) = self.dir.open_dir_optional("blob")? else {
            return Ok(0);
        };
        fsck_dir(&blobroot, &mut verified)?;
        Ok(verified)
    }
}

fn fsck_dir(dir: &Dir, verified: &mut u32) -> Result<()> {
    for ent in dir.entries()? {
        let ent = ent?;
        let ty = ent.file_type()?;
        if ty.is_dir() {
            fsck_dir(&ent.open_dir()?, verified)?;
            continue;
        }
        if !ty.is_file() {
            continue;
        }
        let name = ent.file_name();
        let Some(name) = name.to_str() else {
            bail!("Invalid blob name: {name:?}");
        };
        if validate_digest(name).is_err() {
            // Not a blob; ignore.
            continue;
        }
        let mut f = ent.open().map(BufReader::new)?;
        let mut digest = Hasher::new(MessageDigest::sha256())?;
        std::io::copy(&mut f, &mut digest)?;
        let found = format!("sha256:{}", hex::encode(digest.finish()?));
        if name != found {
            bail!("Expected blob digest {name} but found {found}");
        }
        *verified += 1;
    }
    Ok(())
}

/// A layer directory on disk.
#[derive(Debug)]
pub struct StoredLayer {
    name: String,
    dir: Dir,
}

impl StoredLayer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the layer's options; a layer without metadata has default
    /// options.
    pub fn options(&self) -> Result<LayerOptions> {
        let Some(f) = self.dir.open_optional("metadata.json")? else {
            return Ok(LayerOptions::default());
        };
        let meta: LayerMetadata = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("Parsing metadata for layer {}", self.name))?;
        Ok(meta.options)
    }

    #[context("Writing metadata for layer {}", self.name)]
    pub fn set_options(&self, options: LayerOptions) -> Result<()> {
        let meta = LayerMetadata { options };
        self.dir
            .atomic_write("metadata.json", serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }

    /// Stage a file under the layer's `rootfs/`, creating parent
    /// directories as needed. Returns the number of bytes written.
    #[context("Writing {dest} into layer {}", self.name)]
    pub fn put_file(&self, dest: &str, mode: u32, mut src: impl Read) -> Result<u64> {
        let dest = dest.trim_start_matches('/');
        validate_rel_path(dest)?;
        let path = format!("rootfs/{dest}");
        if let Some(parent) = Utf8Path::new(&path).parent() {
            self.dir.ensure_dir_with(parent, &dirbuilder())?;
        }
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true).mode(mode);
        let mut f = self.dir.open_with(&path, &opts)?;
        let n = std::io::copy(&mut src, &mut f)?;
        Ok(n)
    }

    /// Serialize the staged rootfs to a gzipped tar blob in
    /// `repository`, returning the blob and the layer's diff ID. A
    /// layer with nothing staged produces an empty tar.
    #[context("Building tar for layer {}", self.name)]
    pub fn build_tar(&self, store: &LayerStore, repository: &str) -> Result<(Blob, String)> {
        store.build_blob(repository, |builder| self.emit_rootfs(builder))
    }

    fn emit_rootfs<W: Write>(&self, builder: &mut tar::Builder<W>) -> Result<()> {
        let Some(rootfs) = self.dir.open_dir_optional("rootfs")? else {
            return Ok(());
        };
        emit_dir_to_tar(&rootfs, "", builder)
    }
}

fn emit_dir_to_tar<W: Write>(dir: &Dir, prefix: &str, builder: &mut tar::Builder<W>) -> Result<()> {
    let mut entries = dir.entries()?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry
            .file_name()
            .into_string()
            .map_err(|n| anyhow!("Non-UTF-8 file name in rootfs: {n:?}"))?;
        let meta = entry.metadata()?;
        let mut header = header_from_metadata(&meta)
            .with_context(|| format!("Building tar entry for {prefix}{name}"))?;
        if meta.is_dir() {
            let name = format!("{prefix}{name}/");
            builder.append_data(&mut header, &name, std::io::empty())?;
            emit_dir_to_tar(&entry.open_dir()?, &name, builder)?;
        } else {
            let mut f = entry.open()?;
            builder.append_data(&mut header, format!("{prefix}{name}"), &mut f)?;
        }
    }
    Ok(())
}

/// Hash-while-writing into a temp file; the caller decides where the
/// file lands once the digest is known.
struct BlobWriter<'a> {
    hash: Hasher,
    target: Option<cap_tempfile::TempFile<'a>>,
    size: u64,
}

impl<'a> BlobWriter<'a> {
    #[context("Creating blob writer")]
    fn new(dir: &'a Dir) -> Result<Self> {
        Ok(Self {
            hash: Hasher::new(MessageDigest::sha256())?,
            target: Some(cap_tempfile::TempFile::new(dir)?),
            size: 0,
        })
    }

    fn finish(mut self) -> Result<(String, u64, cap_tempfile::TempFile<'a>)> {
        let digest = format!("sha256:{}", hex::encode(self.hash.finish()?));
        let target = self.target.take().unwrap();
        Ok((digest, self.size, target))
    }
}

impl<'a> Write for BlobWriter<'a> {
    fn write(&mut self, srcbuf: &[u8]) -> std::io::Result<usize> {
        self.hash.update(srcbuf)?;
        self.target
            .as_mut()
            .unwrap()
            .as_file_mut()
            .write_all(srcbuf)?;
        self.size += srcbuf.len() as u64;
        Ok(srcbuf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Dual-digest gzip writer: hashes the uncompressed stream for the
/// diff ID while compressing into a temp file and hashing the
/// compressed bytes for the blob digest.
struct GzipLayerWriter<'a> {
    target: cap_tempfile::TempFile<'a>,
    compressed_hash: Hasher,
    uncompressed_hash: Hasher,
    compressor: GzEncoder<Vec<u8>>,
}

struct FinishedLayerTar<'a> {
    target: cap_tempfile::TempFile<'a>,
    digest: String,
    diff_id: String,
}

impl<'a> GzipLayerWriter<'a> {
    fn new(dir: &'a Dir) -> Result<Self> {
        Ok(Self {
            target: cap_tempfile::TempFile::new(dir)?,
            compressed_hash: Hasher::new(MessageDigest::sha256())?,
            uncompressed_hash: Hasher::new(MessageDigest::sha256())?,
            compressor: GzEncoder::new(Vec::with_capacity(8192), flate2::Compression::default()),
        })
    }

    /// Flush buffered data, finish the gzip stream and compute both
    /// digests.
    #[context("Completing layer")]
    fn complete(mut self) -> Result<FinishedLayerTar<'a>> {
        self.compressor.get_mut().clear();
        let buf = self.compressor.finish()?;
        self.compressed_hash.update(&buf)?;
        self.target.as_file_mut().write_all(&buf)?;
        let digest = format!("sha256:{}", hex::encode(self.compressed_hash.finish()?));
        let diff_id = format!("sha256:{}", hex::encode(self.uncompressed_hash.finish()?));
        Ok(FinishedLayerTar {
            target: self.target,
            digest,
            diff_id,
        })
    }
}

impl<'a> Write for GzipLayerWriter<'a> {
    fn write(&mut self, srcbuf: &[u8]) -> std::io::Result<usize> {
        self.uncompressed_hash.update(srcbuf)?;
        self.compressor.get_mut().clear();
        self.compressor.write_all(srcbuf)?;
        let compressed = self.compressor.get_ref().as_slice();
        self.compressed_hash.update(compressed)?;
        self.target.as_file_mut().write_all(compressed)?;
        Ok(srcbuf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.target.as_file_mut().flush()
    }
}

fn dirbuilder() -> DirBuilder {
    let mut db = DirBuilder::new();
    db.recursive(true).mode(0o755);
    db
}

/// Hash a byte slice to a `sha256:`-prefixed digest string.
pub fn sha256_digest(data: &[u8]) -> Result<String> {
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    hasher.update(data)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finish()?)))
}

// Names that become single path components must not smuggle in
// separators or dot segments.
fn single_filename(s: &str) -> Result<&str> {
    Utf8Path::new(s)
        .file_name()
        .filter(|f| *f == s)
        .ok_or_else(|| anyhow!("Invalid name {s:?}"))
}

fn validate_repository(repository: &str) -> Result<()> {
    if repository.is_empty() {
        bail!("repository is required");
    }
    for component in repository.split('/') {
        single_filename(component).with_context(|| format!("Invalid repository {repository:?}"))?;
    }
    Ok(())
}

fn validate_rel_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("path is required");
    }
    for component in path.split('/') {
        single_filename(component).with_context(|| format!("Invalid path {path:?}"))?;
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<()> {
    let hex_part = digest.strip_prefix("sha256:");
    match hex_part {
        Some(h)
            if digest.len() == DIGEST_LEN
                && h.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) =>
        {
            Ok(())
        }
        _ => bail!("Invalid digest {digest:?}"),
    }
}
