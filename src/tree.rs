//! The in-memory layer tree.
//!
//! A layer under construction is a hierarchical tree of tar entries
//! whose leaves reference lazily-openable [`ByteSource`]s. Ingest tasks
//! insert entries; [`LayerBuilder::write_tar`] serializes the tree as a
//! tar stream. Children are kept in a `BTreeMap`, so emission is sorted
//! by name and the resulting blob is reproducible for a given tree.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use camino::Utf8Path;
use cap_std::fs::MetadataExt;
use cap_std_ext::cap_std;
use fn_error_context::context;

use crate::source::{ByteSource, FileSource};
use crate::store::LayerOptions;

/// A boxed source, as stored in the tree.
pub type EntrySource = Box<dyn ByteSource + Send + Sync>;

/// A node in the layer tree.
///
/// A non-root entry's header name is the slash-joined path from the
/// root (directories gain a trailing `/` only at emission time).
pub struct LayerEntry {
    name: String,
    header: tar::Header,
    data: Option<EntrySource>,
    children: BTreeMap<String, LayerEntry>,
}

impl LayerEntry {
    fn new(name: String, header: tar::Header, data: Option<EntrySource>) -> Self {
        Self {
            name,
            header,
            data,
            children: BTreeMap::new(),
        }
    }

    /// Full path of this entry, relative to the layer root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tar metadata this entry will be emitted with.
    pub fn header(&self) -> &tar::Header {
        &self.header
    }

    pub fn is_dir(&self) -> bool {
        self.header.entry_type().is_dir()
    }

    fn find_child(&self, name: &str) -> Option<&LayerEntry> {
        self.children.get(name)
    }
}

/// A layer being assembled in memory.
///
/// Not thread-safe; a build session owns its builder exclusively.
pub struct LayerBuilder {
    id: String,
    /// Runtime configuration carried alongside the tree (working
    /// directory, command, environment, base reference).
    pub options: LayerOptions,
    root: LayerEntry,
}

impl LayerBuilder {
    /// Create an empty layer with the given identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            options: LayerOptions::default(),
            root: LayerEntry::new(String::new(), tar::Header::new_ustar(), None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Traverse from the root; an empty path refers to the root itself.
    pub fn find_entry<P: AsRef<str>>(&self, path: &[P]) -> Option<&LayerEntry> {
        let mut pos = &self.root;
        for component in path {
            pos = pos.find_child(component.as_ref())?;
        }
        Some(pos)
    }

    fn find_entry_mut<P: AsRef<str>>(&mut self, path: &[P]) -> Option<&mut LayerEntry> {
        let mut pos = &mut self.root;
        for component in path {
            pos = pos.children.get_mut(component.as_ref())?;
        }
        Some(pos)
    }

    pub fn exists<P: AsRef<str>>(&self, path: &[P]) -> bool {
        self.find_entry(path).is_some()
    }

    /// Open the file entry at `path` for reading.
    pub fn open<P: AsRef<str>>(&self, path: &[P]) -> Result<Box<dyn Read + '_>> {
        let entry = self
            .find_entry(path)
            .ok_or_else(|| anyhow::anyhow!("entry not found: {}", join(path)))?;
        match &entry.data {
            Some(source) => source.open(),
            None => bail!("entry is not a file: {}", join(path)),
        }
    }

    /// Idempotent directory creation. The parent directories must
    /// already exist; archive walks guarantee this by inserting parents
    /// before their contents.
    pub fn mkdirp<P: AsRef<str>>(&mut self, path: &[P], header: &tar::Header) -> Result<()> {
        if self.find_entry(path).is_some() {
            return Ok(());
        }
        self.add_entry(path, None, header, false)
    }

    /// Insert an entry at `path` with the supplied tar metadata.
    ///
    /// The parent entry must exist. An existing entry at `path` is an
    /// error unless `replace` is set.
    pub fn add_entry<P: AsRef<str>>(
        &mut self,
        path: &[P],
        source: Option<EntrySource>,
        header: &tar::Header,
        replace: bool,
    ) -> Result<()> {
        let Some((filename, parent_path)) = path.split_last() else {
            bail!("cannot add an entry at the layer root");
        };
        let joined = join(path);
        let Some(parent) = self.find_entry_mut(parent_path) else {
            bail!("directory does not exist: {joined}");
        };
        let filename = filename.as_ref();
        if parent.children.contains_key(filename) && !replace {
            bail!("entry already exists with name: {joined}");
        }
        // A replaced directory keeps its children; only metadata and
        // payload are overwritten.
        let entry = parent
            .children
            .entry(filename.to_string())
            .or_insert_with(|| LayerEntry::new(String::new(), header.clone(), None));
        entry.name = joined;
        entry.header = header.clone();
        entry.data = source;
        Ok(())
    }

    /// Insert an entry for a filesystem object, deriving the tar header
    /// from its metadata. Symlinks are not supported.
    #[context("Adding {src_path}")]
    pub fn add_file_entry<P: AsRef<str>>(
        &mut self,
        path: &[P],
        src_path: &Utf8Path,
        meta: &cap_std::fs::Metadata,
        replace: bool,
    ) -> Result<()> {
        let header = header_from_metadata(meta)?;
        let source: Option<EntrySource> = if meta.is_dir() {
            None
        } else {
            Some(Box::new(FileSource::new(src_path)))
        };
        self.add_entry(path, source, &header, replace)
    }

    /// Emit every non-root entry as a tar record, parents before
    /// children, siblings in name order.
    pub fn write_tar<W: Write>(&self, w: &mut tar::Builder<W>) -> Result<()> {
        for child in self.root.children.values() {
            write_entry(child, w)?;
        }
        Ok(())
    }
}

fn write_entry<W: Write>(entry: &LayerEntry, w: &mut tar::Builder<W>) -> Result<()> {
    tracing::trace!("tar writing entry: {}", entry.name);
    let mut header = entry.header.clone();
    if let Some(source) = &entry.data {
        let size = header.size().unwrap_or(0);
        let reader = source
            .open()
            .with_context(|| format!("Writing tar entry {}", entry.name))?;
        let mut reader = CountingReader::new(reader);
        w.append_data(&mut header, &entry.name, &mut reader)
            .with_context(|| format!("Writing tar entry {}", entry.name))?;
        if reader.count != size {
            bail!(
                "file size mismatch for {} (header {size}, source {})",
                entry.name,
                reader.count
            );
        }
    } else {
        // Directory entries end in a slash, per ustar convention.
        let name = format!("{}/", entry.name);
        header.set_size(0);
        w.append_data(&mut header, &name, std::io::empty())
            .with_context(|| format!("Writing tar entry {name}"))?;
    }
    for child in entry.children.values() {
        write_entry(child, w)?;
    }
    Ok(())
}

fn join<P: AsRef<str>>(path: &[P]) -> String {
    path.iter()
        .map(|c| c.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Tar header for a filesystem object. Fails on symlinks and special
/// files rather than emitting a broken entry.
pub(crate) fn header_from_metadata(meta: &cap_std::fs::Metadata) -> Result<tar::Header> {
    let mut header = tar::Header::new_ustar();
    if meta.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
    } else if meta.is_file() {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
    } else if meta.file_type().is_symlink() {
        bail!("symlinks are not supported");
    } else {
        bail!("unsupported file type: {:?}", meta.file_type());
    }
    header.set_mode(meta.mode() & 0o7777);
    header.set_uid(meta.uid().into());
    header.set_gid(meta.gid().into());
    header.set_mtime(meta.mtime().max(0) as u64);
    Ok(header)
}

/// Synthetic directory header, default mode 0755.
pub fn directory_header(mode: u32) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(mode);
    header.set_size(0);
    header
}

/// Synthetic regular-file header, default mode 0644.
pub fn file_header(mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_size(size);
    header
}
