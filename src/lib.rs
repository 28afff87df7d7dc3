//! # Build and push Docker/OCI v2 container images
//!
//! This library assembles container images from declarative inputs
//! (source directories, tarballs, Debian packages and base images
//! already fetched into a local store) and pushes the result to a
//! registry speaking the v2 distribution protocol.
//!
//! ## Dependency on cap-std
//!
//! The on-disk store makes use of [cap-std] to operate in a
//! capability-oriented fashion: all store I/O happens relative to a
//! [`cap_std::fs::Dir`] handle. This is a generally good idea when
//! operating in the container ecosystem, in particular when actively
//! processing tar streams.
//!
//! ## Getting started
//!
//! Open a store, assemble a layer and serialize it to a blob:
//!
//! ```rust,no_run
//! # use imagebuilder::cap_std;
//! # fn main() -> anyhow::Result<()> {
//! let d = cap_std::fs::Dir::open_ambient_dir("/var/lib/imagebuilder", cap_std::ambient_authority())?;
//! let store = imagebuilder::LayerStore::new(&d)?;
//! let mut layer = imagebuilder::LayerBuilder::new("demo");
//! let deb = imagebuilder::source::FileSource::new("memcached.deb");
//! imagebuilder::ingest::add_deb(&mut layer, &[], &deb)?;
//! let (blob, diff_id) = store.build_layer_blob("library/demo", &layer)?;
//! println!("{} ({diff_id})", blob.digest());
//! # Ok(())
//! # }
//! ```
//!
//! Pushing walks a chain of stored layers, composes the image config
//! and uploads blobs and manifest; see [`push::push`].
//!
//! [cap-std]: https://docs.rs/cap-std/

pub mod accounts;
pub mod config;
pub mod ingest;
pub mod push;
pub mod reference;
pub mod registry;
pub mod source;
pub mod store;
pub mod tree;

// Re-export our dependencies that are used as part of the public API.
pub use cap_std_ext::cap_std;

pub use reference::ImageSpec;
pub use source::ByteSource;
pub use store::{Blob, ImageManifest, LayerOptions, LayerStore, StoredLayer};
pub use tree::LayerBuilder;
