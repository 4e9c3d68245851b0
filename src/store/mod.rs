//! The container storage contract consumed by build containers.
//!
//! Everything this crate needs from container storage goes through [`Store`]:
//! allocating containers, finding their private metadata directory,
//! enumerating them, and resolving images. [`dir::DirStore`] is the
//! directory-backed implementation the binary uses.

pub mod dir;
pub mod layer;

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::StoreError;

/// A container registered with a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Store-issued stable key.
    pub id: String,
    pub names: Vec<String>,
    /// ID of the image the container was created from, if any.
    pub image_id: Option<String>,
}

impl ContainerInfo {
    /// The human label for this container, falling back to the ID.
    pub fn name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.id)
    }
}

/// An image known to a store, with its configuration and manifest verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub names: Vec<String>,
    pub config: Vec<u8>,
    pub manifest: Vec<u8>,
}

/// Parameters for allocating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerRequest {
    /// Desired container name; it must not already be in use.
    pub name: String,
    /// Image to populate the container from; `None` starts from an empty root.
    pub image_id: Option<String>,
}

/// Container storage as seen by build containers.
///
/// Implementations serialize their own structural operations (creating and
/// deleting containers, mounting); callers add no locking around them.
pub trait Store {
    /// Allocate a container, returning its registration.
    fn create_container(&self, request: &ContainerRequest) -> Result<ContainerInfo, StoreError>;

    /// Remove a container and everything stored alongside it.
    fn delete_container(&self, id: &str) -> Result<(), StoreError>;

    /// Resolve a container name or ID. Unknown names fail with
    /// [`StoreError::UnknownContainer`].
    fn container(&self, name_or_id: &str) -> Result<ContainerInfo, StoreError>;

    /// All registered containers, in the store's own order.
    fn containers(&self) -> Result<Vec<ContainerInfo>, StoreError>;

    /// Directory reserved for this tool's private files about `id`.
    fn container_directory(&self, id: &str) -> Result<PathBuf, StoreError>;

    /// The tool-private metadata blob stored for `id`, if one was written.
    fn metadata(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.container_directory(id)?.join(crate::STATE_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(
                format!("reading container metadata '{}'", path.display()),
                e,
            )),
        }
    }

    /// Look an image up by name or ID; `Ok(None)` when it is not present.
    fn image(&self, name_or_id: &str) -> Result<Option<ImageInfo>, StoreError>;

    /// Fetch an image into the store. `registry` is prepended to `name` when
    /// the bare name cannot be resolved.
    fn pull_image(&self, name: &str, registry: Option<&str>) -> Result<ImageInfo, StoreError> {
        let _ = registry;
        Err(StoreError::PullUnsupported(name.to_string()))
    }

    /// Mount the container's root filesystem and return where it is.
    fn mount(&self, id: &str) -> Result<PathBuf, StoreError>;
}
