//! The build container record and the entry points that create one.
//!
//! A [`Builder`] is plain data: it never holds on to a store. Every operation
//! that touches storage takes the [`Store`] it should use.

pub mod codec;
pub mod resolve;
mod serde_fmt;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BuilderError, Result, StoreError};
use crate::store::{ContainerRequest, ImageInfo, Store};
use crate::{CONTAINER_TYPE, DEFAULT_CREATED_BY};

/// Marker identifying records written by this tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    fn missing() -> Self {
        TypeTag(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_ours(&self) -> bool {
        self.0 == CONTAINER_TYPE
    }
}

impl Default for TypeTag {
    fn default() -> Self {
        TypeTag(CONTAINER_TYPE.to_string())
    }
}

/// A container being used to build an image, plus the configuration updates
/// that will be applied to the image built from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    /// Identifies the record as ours. Not meant to be modified.
    #[serde(rename = "type", default = "TypeTag::missing")]
    pub(crate) type_tag: TypeTag,
    /// Source image name, if the container was created from one.
    #[serde(rename = "image", default, skip_serializing_if = "Option::is_none")]
    pub from_image: Option<String>,
    /// Source image configuration, verbatim.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "serde_fmt::base64_bytes"
    )]
    pub config: Vec<u8>,
    /// Source image manifest, verbatim.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "serde_fmt::base64_bytes"
    )]
    pub manifest: Vec<u8>,

    #[serde(rename = "container-name", default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    /// Store-issued ID of the backing container. Never changes after creation.
    #[serde(rename = "container-id", default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    /// Where the root filesystem was most recently mounted.
    #[serde(rename = "mountpoint", default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    /// Every place the root filesystem has been mounted, oldest first.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub mounts: Vec<String>,
    /// Symlinks to the current mount. Removed when the container is unmounted.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub links: Vec<String>,

    /// Key/value pairs for the image manifest.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub annotations: BTreeMap<String, String>,

    #[serde(rename = "created-by", default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(rename = "arch", default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub maintainer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "workingdir", default, skip_serializing_if = "String::is_empty")]
    pub workdir: String,
    /// `NAME=VALUE` entries, in the order given.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub env: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub cmd: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub entrypoint: Vec<String>,
    /// Port specs to expose.
    #[serde(
        default,
        skip_serializing_if = "BTreeSet::is_empty",
        serialize_with = "serde_fmt::serialize_port_set",
        deserialize_with = "serde_fmt::deserialize_port_set"
    )]
    pub expose: BTreeSet<String>,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub labels: BTreeMap<String, String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub volumes: Vec<String>,
    /// Build-time variables.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "serde_fmt::null_as_default"
    )]
    pub arg: BTreeMap<String, String>,
}

/// Options for [`new_builder`].
#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    /// Starting image. Empty or `"scratch"` starts from an empty root.
    pub from_image: String,
    /// Desired container name; generated from the image name when empty.
    pub container: String,
    /// Pull the image if it is not already in the store.
    pub pull_if_missing: bool,
    /// Pull the image even if it is already in the store.
    pub pull_always: bool,
    /// Prefix tried when the bare image name cannot be pulled.
    pub registry: Option<String>,
    /// Mount the container right away.
    pub mount: bool,
    /// Where to create a symlink to the mount point, if mounting.
    pub link: Option<PathBuf>,
}

/// Options for [`import_builder`].
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Name or ID of the existing container.
    pub container: String,
}

impl Builder {
    pub fn type_tag(&self) -> &str {
        self.type_tag.as_str()
    }

    /// How the container was produced, for the image history.
    pub fn created_by(&self) -> &str {
        if self.created_by.is_empty() {
            DEFAULT_CREATED_BY
        } else {
            &self.created_by
        }
    }

    /// True if `path` is the current mount point, an earlier one, or one of
    /// the recorded links.
    pub fn matches_path(&self, path: &Path) -> bool {
        self.mount_point.as_deref().map(Path::new) == Some(path)
            || self.mounts.iter().any(|m| Path::new(m) == path)
            || self.links.iter().any(|l| Path::new(l) == path)
    }

    /// Mount the container's root filesystem, optionally linking to it, and
    /// save the updated record.
    ///
    /// On failure the record is left as it was and any link created here is
    /// removed again.
    pub fn mount(&mut self, store: &dyn Store, link: Option<&Path>) -> Result<PathBuf> {
        let mount_point = store.mount(&self.container_id)?;
        let mount_str = utf8_path(&mount_point)?;

        let mut created_link = None;
        if let Some(link) = link.filter(|l| !l.as_os_str().is_empty()) {
            let link = absolute_path(link)?;
            let link_str = utf8_path(&link)?;
            std::os::unix::fs::symlink(&mount_point, &link).map_err(|e| {
                BuilderError::io(format!("creating symlink {}", link.display()), e)
            })?;
            created_link = Some((link, link_str));
        }

        let mut updated = self.clone();
        updated.mount_point = Some(mount_str.clone());
        updated.mounts.push(mount_str);
        if let Some((_, link_str)) = &created_link {
            updated.links.push(link_str.clone());
        }

        if let Err(e) = updated.save(store) {
            if let Some((link, _)) = &created_link {
                let _ = fs::remove_file(link);
            }
            return Err(e);
        }

        debug!(container = %self.container, mount = %mount_point.display(), "mounted");
        *self = updated;
        Ok(mount_point)
    }
}

/// Create a new build container from `options.from_image` (or from nothing)
/// and persist its initial record.
///
/// If anything fails after the store container was allocated, the container
/// is deleted again before the error is returned.
pub fn new_builder(store: &dyn Store, options: &BuilderOptions) -> Result<Builder> {
    let from = options.from_image.trim();
    let image = if from.is_empty() || from == "scratch" {
        None
    } else {
        Some(resolve_image(store, from, options)?)
    };

    let name = if options.container.is_empty() {
        default_container_name(store, from)?
    } else {
        options.container.clone()
    };

    let info = store.create_container(&ContainerRequest {
        name,
        image_id: image.as_ref().map(|i| i.id.clone()),
    })?;

    let mut builder = Builder {
        container: info.name().to_string(),
        container_id: info.id.clone(),
        ..Builder::default()
    };
    if let Some(image) = image {
        builder.from_image = Some(from.to_string());
        builder.config = image.config;
        builder.manifest = image.manifest;
    }

    let finished = builder.save(store).and_then(|()| {
        if options.mount {
            builder.mount(store, options.link.as_deref()).map(|_| ())
        } else {
            Ok(())
        }
    });
    if let Err(e) = finished {
        if let Err(cleanup) = store.delete_container(&info.id) {
            warn!(container = %info.id, error = %cleanup, "failed to remove partially created container");
        }
        return Err(e);
    }

    info!(container = %builder.container, id = %builder.container_id, "created build container");
    Ok(builder)
}

/// Adopt an existing store container as a build container.
///
/// A container that already carries one of our records is returned as is.
pub fn import_builder(store: &dyn Store, options: &ImportOptions) -> Result<Builder> {
    let info = store.container(&options.container)?;

    if let Some(bytes) = store.metadata(&info.id)? {
        match codec::decode(&bytes) {
            Ok(existing) => return Ok(existing),
            Err(e) if e.is_foreign() => {
                debug!(container = %info.id, error = %e, "replacing foreign metadata on import");
            }
            Err(e) => return Err(e),
        }
    }

    let builder = Builder {
        container: info.name().to_string(),
        container_id: info.id.clone(),
        ..Builder::default()
    };
    builder.save(store)?;
    info!(container = %builder.container, "imported build container");
    Ok(builder)
}

fn resolve_image(store: &dyn Store, from: &str, options: &BuilderOptions) -> Result<ImageInfo> {
    let registry = options.registry.as_deref();
    if options.pull_always {
        return Ok(store.pull_image(from, registry)?);
    }
    if let Some(image) = store.image(from)? {
        return Ok(image);
    }
    if options.pull_if_missing {
        return Ok(store.pull_image(from, registry)?);
    }
    Err(StoreError::UnknownImage(from.to_string()).into())
}

/// `<image>-working-container`, numbered until it does not collide.
fn default_container_name(store: &dyn Store, image: &str) -> Result<String> {
    let base = image_base_name(image);
    let stem = if base.is_empty() || base == "scratch" {
        "working-container".to_string()
    } else {
        format!("{base}-working-container")
    };

    let mut candidate = stem.clone();
    let mut n = 1;
    loop {
        match store.container(&candidate) {
            Err(StoreError::UnknownContainer(_)) => return Ok(candidate),
            Err(e) => return Err(e.into()),
            Ok(_) => {
                n += 1;
                candidate = format!("{stem}-{n}");
            }
        }
    }
}

/// Last path segment of an image reference, without tag or digest.
fn image_base_name(image: &str) -> &str {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
    last.split(':').next().unwrap_or(last)
}

/// `path` as a `String`. Non-UTF-8 paths are refused.
fn utf8_path(path: &Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        BuilderError::io(
            format!("recording path {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "path is not valid UTF-8"),
        )
    })
}

/// Make `path` absolute against the current directory and drop `.`/`..`
/// lexically. Symlinks are not followed.
pub(crate) fn absolute_path(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| BuilderError::io("resolving current directory", e))?
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
