//! Persistent state for build containers.
//!
//! A build container is a Store container used as the working area while an
//! image is assembled. This crate owns the small JSON record that travels with
//! each of those containers and knows how to:
//!
//! - **Create** one (`new_builder`, `import_builder`)
//! - **Locate** one by name/ID or by a filesystem path that points at its
//!   mount or at a symlink to it (`open_builder`, `open_builder_by_path`)
//! - **Update** its pending image configuration (`ConfigUpdate`)
//! - **Save** it atomically next to the container (`Builder::save`)
//!
//! # Architecture
//!
//! ```text
//! bin/buildah ──── settings (TOML) ──── DirStore
//!     │                                    │
//!     ├── builder::resolve ───────────────┤ Store trait
//!     ├── update::ConfigUpdate             │
//!     └── builder::codec ─────────────────┘ container_directory(id)/buildah.json
//! ```
//!
//! The [`Store`] trait is the only way this crate touches container storage,
//! so everything above it can be driven by an in-memory fake in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use buildah::{open_builder, ConfigUpdate, DirStore};
//!
//! let store = DirStore::open("/var/lib/buildah/storage".as_ref())?;
//! let mut builder = open_builder(&store, "fedora-working-container")?;
//! let update = ConfigUpdate {
//!     os: Some("linux".into()),
//!     labels: Some(vec!["version=1".into()]),
//!     ..Default::default()
//! };
//! update.apply(&mut builder);
//! builder.save(&store)?;
//! ```

pub mod builder;
pub mod error;
pub mod settings;
pub mod store;
pub mod update;

pub use builder::resolve::{list_builders, open_builder, open_builder_any, open_builder_by_path};
pub use builder::{import_builder, new_builder, Builder, BuilderOptions, ImportOptions};
pub use error::{BuilderError, StoreError};
pub use store::dir::DirStore;
pub use store::{ContainerInfo, ContainerRequest, ImageInfo, Store};
pub use update::ConfigUpdate;

/// Name of this tool, used in help output and to identify working containers.
pub const PACKAGE: &str = "buildah";

/// Type tag stamped into every record this tool writes.
pub const CONTAINER_TYPE: &str = "buildah 0.0.0";

/// File name of the record inside a container's metadata directory.
pub const STATE_FILE: &str = "buildah.json";

/// Description used for the image history when none was given.
pub const DEFAULT_CREATED_BY: &str = "manual edits";
