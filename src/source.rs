//! Lazily-openable byte streams.
//!
//! Everything that feeds a layer, whether a file on disk, a buffered
//! archive member or a decompressed sub-stream, is modeled as a
//! [`ByteSource`]:
//! a factory that hands out a fresh reader on each call, plus a
//! human-readable name for error messages. Ingest code composes sources
//! ("gzip of file", "xz of ar member") without caring what sits
//! underneath.

use std::io::Read;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// A named factory for byte streams.
///
/// Restartable sources may be opened any number of times and always
/// yield identical bytes; [`OnceSource`] fails on the second call.
pub trait ByteSource {
    /// Open a fresh reader over this source's bytes.
    fn open(&self) -> Result<Box<dyn Read + '_>>;

    /// A human-readable name for diagnostics.
    fn name(&self) -> &str;
}

/// A source backed by a file path, opened anew on each call.
#[derive(Debug)]
pub struct FileSource {
    path: Utf8PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Utf8Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
        }
    }
}

impl ByteSource for FileSource {
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        let f = std::fs::File::open(&self.path)
            .with_context(|| format!("Opening {}", self.path))?;
        Ok(Box::new(f))
    }

    fn name(&self) -> &str {
        self.path.as_str()
    }
}

/// A source holding its bytes in memory.
#[derive(Debug)]
pub struct BufferSource {
    data: Vec<u8>,
    name: String,
}

impl BufferSource {
    /// Wrap an owned byte buffer.
    pub fn from_vec(data: Vec<u8>, name: impl Into<String>) -> Self {
        Self {
            data,
            name: name.into(),
        }
    }

    /// Buffer the remainder of `src` into memory.
    ///
    /// Used to capture payloads from single-pass readers (a tar entry
    /// must be consumed before the next record is visited).
    pub fn from_reader(src: &mut impl Read, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut data = Vec::new();
        src.read_to_end(&mut data)
            .with_context(|| format!("Buffering data from {name}"))?;
        Ok(Self { data, name })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ByteSource for BufferSource {
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.data.as_slice()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A source wrapping an already-open stream; yields it exactly once.
///
/// Used to project a sub-stream of an archive reader (e.g. the
/// `data.tar.xz` member of an ar archive) into the generic pipeline
/// without buffering it.
pub struct OnceSource<R> {
    inner: Mutex<Option<R>>,
    name: String,
}

impl<R: Read> OnceSource<R> {
    pub fn new(inner: R, name: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Some(inner)),
            name: name.into(),
        }
    }
}

impl<R: Read> ByteSource for OnceSource<R> {
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        let r = self
            .inner
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("source {} can only be opened once", self.name))?;
        Ok(Box::new(r))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Gzip decompression of an inner source.
pub struct GzipSource<S> {
    inner: S,
}

impl<S: ByteSource> GzipSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: ByteSource> ByteSource for GzipSource<S> {
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        let f = self.inner.open()?;
        Ok(Box::new(flate2::read::GzDecoder::new(f)))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Xz decompression of an inner source.
pub struct XzSource<S> {
    inner: S,
}

impl<S: ByteSource> XzSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: ByteSource> ByteSource for XzSource<S> {
    fn open(&self) -> Result<Box<dyn Read + '_>> {
        let f = self.inner.open()?;
        Ok(Box::new(xz2::read::XzDecoder::new(f)))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
