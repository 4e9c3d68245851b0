//! Directory-backed container store.
//!
//! Layout under the store root:
//!
//! ```text
//! containers.json                 registry of containers (atomic rewrite)
//! images.json                     registry of images (atomic rewrite)
//! containers/<id>/userdata/       private metadata directory for tools
//! containers/<id>/rootfs/         container root filesystem ("mount point")
//! images/<id>/layer.tar.zst       packed image root filesystem
//! images/<id>/config.json         image configuration, verbatim
//! images/<id>/manifest.json       image manifest, verbatim
//! locks/store.lock                serializes structural changes
//! tmp/                            staging for atomic writes
//! ```
//!
//! The store never mounts anything: a container's "mount point" is its
//! `rootfs/` directory.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use super::layer;
use super::{ContainerInfo, ContainerRequest, ImageInfo, Store};
use crate::error::StoreError;
use crate::STATE_FILE;

const CONTAINERS_FILE: &str = "containers.json";
const IMAGES_FILE: &str = "images.json";
const LAYER_FILE: &str = "layer.tar.zst";
const CONFIG_FILE: &str = "config.json";
const MANIFEST_FILE: &str = "manifest.json";

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerEntry {
    id: String,
    names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    created: String,
}

impl From<&ContainerEntry> for ContainerInfo {
    fn from(entry: &ContainerEntry) -> Self {
        ContainerInfo {
            id: entry.id.clone(),
            names: entry.names.clone(),
            image_id: entry.image.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageEntry {
    id: String,
    names: Vec<String>,
    created: String,
}

/// Container store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
    image_sources: Vec<PathBuf>,
}

impl DirStore {
    /// Open (and create if needed) the store at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root)
            .map_err(|e| StoreError::io(format!("creating store root {}", root.display()), e))?;
        let root = fs::canonicalize(root)
            .map_err(|e| StoreError::io(format!("resolving store root {}", root.display()), e))?;
        let store = Self {
            root,
            image_sources: Vec::new(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    /// Directories `pull_image` may import images from.
    pub fn with_image_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.image_sources = sources;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in [
            self.containers_dir(),
            self.images_dir(),
            self.tmp_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn container_path(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    fn image_path(&self, id: &str) -> PathBuf {
        self.images_dir().join(id)
    }

    /// Register an image whose root filesystem is the directory `rootfs`.
    ///
    /// The image ID is the sha256 of the packed layer, so adding identical
    /// content twice yields one image carrying both names. A name already
    /// held by another image moves to this one.
    pub fn add_image(
        &self,
        name: &str,
        rootfs: &Path,
        config: &[u8],
        manifest: &[u8],
    ) -> Result<ImageInfo, StoreError> {
        if !rootfs.is_dir() {
            return Err(StoreError::io(
                format!("image root filesystem {}", rootfs.display()),
                std::io::Error::new(ErrorKind::NotFound, "not a directory"),
            ));
        }

        let _lock = self.acquire_lock()?;

        let tmp_layer = self.tmp_dir().join(tmp_name("layer.tar.zst"));
        let packed = layer::pack_dir(rootfs, &tmp_layer).and_then(|()| layer::sha256_file(&tmp_layer));
        let id = match packed {
            Ok(id) => id,
            Err(e) => {
                let _ = fs::remove_file(&tmp_layer);
                return Err(StoreError::Layer(e));
            }
        };

        let image_dir = self.image_path(&id);
        let stored = (|| -> Result<(), StoreError> {
            fs::create_dir_all(&image_dir)
                .map_err(|e| StoreError::io(format!("creating {}", image_dir.display()), e))?;
            self.write_file(&image_dir.join(CONFIG_FILE), config)?;
            self.write_file(&image_dir.join(MANIFEST_FILE), manifest)?;
            atomic_rename(&tmp_layer, &image_dir.join(LAYER_FILE))
        })();
        if let Err(e) = stored {
            let _ = fs::remove_file(&tmp_layer);
            return Err(e);
        }

        let mut entries = self.read_images()?;
        for entry in entries.iter_mut() {
            entry.names.retain(|n| n != name);
        }
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => entry.names.push(name.to_string()),
            None => entries.push(ImageEntry {
                id: id.clone(),
                names: vec![name.to_string()],
                created: now_rfc3339(),
            }),
        }
        self.write_images(&entries)?;
        debug!(image = %id, name, "added image");

        let entry = entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::UnknownImage(id.clone()))?;
        self.load_image(entry)
    }

    fn load_image(&self, entry: &ImageEntry) -> Result<ImageInfo, StoreError> {
        let dir = self.image_path(&entry.id);
        Ok(ImageInfo {
            id: entry.id.clone(),
            names: entry.names.clone(),
            config: read_optional(&dir.join(CONFIG_FILE))?,
            manifest: read_optional(&dir.join(MANIFEST_FILE))?,
        })
    }

    fn find_image(&self, name_or_id: &str) -> Result<Option<ImageEntry>, StoreError> {
        Ok(self
            .read_images()?
            .into_iter()
            .find(|e| e.id == name_or_id || e.names.iter().any(|n| n == name_or_id)))
    }

    fn populate_container(
        &self,
        dir: &Path,
        image_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let userdata = dir.join("userdata");
        let rootfs = dir.join("rootfs");
        for d in [&userdata, &rootfs] {
            fs::create_dir_all(d)
                .map_err(|e| StoreError::io(format!("creating {}", d.display()), e))?;
        }
        if let Some(image_id) = image_id {
            let layer_path = self.image_path(image_id).join(LAYER_FILE);
            layer::unpack_into(&layer_path, &rootfs).map_err(StoreError::Layer)?;
        }
        Ok(())
    }

    fn read_containers(&self) -> Result<Vec<ContainerEntry>, StoreError> {
        read_registry(&self.root.join(CONTAINERS_FILE))
    }

    fn write_containers(&self, entries: &[ContainerEntry]) -> Result<(), StoreError> {
        self.write_registry(CONTAINERS_FILE, entries)
    }

    fn read_images(&self) -> Result<Vec<ImageEntry>, StoreError> {
        read_registry(&self.root.join(IMAGES_FILE))
    }

    fn write_images(&self, entries: &[ImageEntry]) -> Result<(), StoreError> {
        self.write_registry(IMAGES_FILE, entries)
    }

    fn write_registry<T: Serialize>(&self, file: &str, entries: &[T]) -> Result<(), StoreError> {
        let path = self.root.join(file);
        let bytes = serde_json::to_vec_pretty(entries).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        self.write_file(&path, &bytes)
    }

    /// Stage `bytes` under `tmp/` and rename into `path`.
    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self.tmp_dir().join(tmp_name("write"));
        fs::write(&tmp, bytes)
            .map_err(|e| StoreError::io(format!("writing {}", tmp.display()), e))?;
        atomic_rename(&tmp, path)
    }

    fn acquire_lock(&self) -> Result<StoreLock, StoreError> {
        let lock_path = self.locks_dir().join("store.lock");

        // Do not unlink the lock file on release. Unlinking a still-locked file
        // lets a second process create a fresh file at the same path and take
        // a separate exclusive lock.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                StoreError::io(format!("opening lock file {}", lock_path.display()), e)
            })?;

        if file.try_lock_exclusive().is_err() {
            debug!(lock = %lock_path.display(), "waiting for store lock");
            file.lock_exclusive().map_err(|e| {
                StoreError::io(format!("locking {}", lock_path.display()), e)
            })?;
        }
        Ok(StoreLock { _file: file })
    }
}

impl Store for DirStore {
    fn create_container(&self, request: &ContainerRequest) -> Result<ContainerInfo, StoreError> {
        let _lock = self.acquire_lock()?;

        let mut entries = self.read_containers()?;
        if entries
            .iter()
            .any(|e| e.id == request.name || e.names.iter().any(|n| n == &request.name))
        {
            return Err(StoreError::NameInUse(request.name.clone()));
        }
        if let Some(image_id) = &request.image_id {
            if self.find_image(image_id)?.is_none() {
                return Err(StoreError::UnknownImage(image_id.clone()));
            }
        }

        let id = new_id(&request.name);
        let dir = self.container_path(&id);
        let entry = ContainerEntry {
            id: id.clone(),
            names: vec![request.name.clone()],
            image: request.image_id.clone(),
            created: now_rfc3339(),
        };
        entries.push(entry.clone());

        let created = self
            .populate_container(&dir, request.image_id.as_deref())
            .and_then(|()| self.write_containers(&entries));
        if let Err(e) = created {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        debug!(container = %id, name = %request.name, "created container");
        Ok(ContainerInfo::from(&entry))
    }

    fn delete_container(&self, id: &str) -> Result<(), StoreError> {
        let _lock = self.acquire_lock()?;

        let mut entries = self.read_containers()?;
        let Some(pos) = entries
            .iter()
            .position(|e| e.id == id || e.names.iter().any(|n| n == id))
        else {
            return Err(StoreError::UnknownContainer(id.to_string()));
        };
        let entry = entries.remove(pos);
        self.write_containers(&entries)?;

        let dir = self.container_path(&entry.id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| StoreError::io(format!("removing {}", dir.display()), e))?;
        }
        debug!(container = %entry.id, "deleted container");
        Ok(())
    }

    fn container(&self, name_or_id: &str) -> Result<ContainerInfo, StoreError> {
        self.read_containers()?
            .iter()
            .find(|e| e.id == name_or_id || e.names.iter().any(|n| n == name_or_id))
            .map(ContainerInfo::from)
            .ok_or_else(|| StoreError::UnknownContainer(name_or_id.to_string()))
    }

    fn containers(&self) -> Result<Vec<ContainerInfo>, StoreError> {
        Ok(self
            .read_containers()?
            .iter()
            .map(ContainerInfo::from)
            .collect())
    }

    fn container_directory(&self, id: &str) -> Result<PathBuf, StoreError> {
        let info = self.container(id)?;
        Ok(self.container_path(&info.id).join("userdata"))
    }

    /// Reads `containers/<id>/userdata/buildah.json` without consulting the
    /// registry.
    fn metadata(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if !is_safe_relative(id) || id.contains('/') {
            return Err(StoreError::UnknownContainer(id.to_string()));
        }
        let dir = self.container_path(id);
        let path = dir.join("userdata").join(STATE_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if dir.is_dir() {
                    Ok(None)
                } else {
                    Err(StoreError::UnknownContainer(id.to_string()))
                }
            }
            Err(e) => Err(StoreError::io(format!("reading {}", path.display()), e)),
        }
    }

    fn image(&self, name_or_id: &str) -> Result<Option<ImageInfo>, StoreError> {
        match self.find_image(name_or_id)? {
            Some(entry) => self.load_image(&entry).map(Some),
            None => Ok(None),
        }
    }

    fn pull_image(&self, name: &str, registry: Option<&str>) -> Result<ImageInfo, StoreError> {
        if self.image_sources.is_empty() {
            return Err(StoreError::PullUnsupported(name.to_string()));
        }

        let mut candidates = vec![name.to_string()];
        if let Some(registry) = registry.filter(|r| !r.is_empty()) {
            candidates.push(format!("{}/{}", registry.trim_end_matches('/'), name));
        }

        for source in &self.image_sources {
            for candidate in &candidates {
                if !is_safe_relative(candidate) {
                    continue;
                }
                let dir = source.join(candidate);
                let rootfs = dir.join("rootfs");
                if !rootfs.is_dir() {
                    continue;
                }
                debug!(image = %candidate, source = %source.display(), "pulling image");
                let config = read_optional(&dir.join(CONFIG_FILE))?;
                let manifest = read_optional(&dir.join(MANIFEST_FILE))?;
                return self.add_image(name, &rootfs, &config, &manifest);
            }
        }
        Err(StoreError::UnknownImage(name.to_string()))
    }

    fn mount(&self, id: &str) -> Result<PathBuf, StoreError> {
        let info = self.container(id)?;
        let rootfs = self.container_path(&info.id).join("rootfs");
        fs::create_dir_all(&rootfs)
            .map_err(|e| StoreError::io(format!("creating {}", rootfs.display()), e))?;
        Ok(rootfs)
    }
}

/// Releases the store lock when dropped (closing the file drops the flock).
#[derive(Debug)]
struct StoreLock {
    _file: File,
}

fn read_registry<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
    };
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn read_optional(path: &Path) -> Result<Vec<u8>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::io(format!("reading {}", path.display()), e)),
    }
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<(), StoreError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StoreError::io(format!("creating {}", parent.display()), e))?;
    }
    fs::rename(src, dst).map_err(|e| {
        StoreError::io(
            format!("renaming {} to {}", src.display(), dst.display()),
            e,
        )
    })
}

fn is_safe_relative(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn new_id(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{n}-{seq}")
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
