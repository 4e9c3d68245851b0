//! Tool settings read from `storage.toml`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::dir::DirStore;
use crate::PACKAGE;

/// Resolved settings. Every field has a usable default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Explicit store root; see [`Settings::storage_root`].
    pub root: Option<PathBuf>,
    /// Directories searched when an image has to be pulled.
    pub image_sources: Vec<PathBuf>,
    /// Registry prefix tried after the bare image name.
    pub registry: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    storage: Option<StorageToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageToml {
    root: Option<PathBuf>,
    image_sources: Option<Vec<PathBuf>>,
    registry: Option<String>,
}

impl Settings {
    /// Load settings from `explicit` if given, else from the per-user config
    /// file if it exists, else defaults.
    ///
    /// An explicit path that does not exist is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings '{}'", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("parsing settings '{}'", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: SettingsToml = toml::from_str(text)?;
        let Some(storage) = parsed.storage else {
            return Ok(Self::default());
        };
        Ok(Self {
            root: storage.root,
            image_sources: storage.image_sources.unwrap_or_default(),
            registry: storage
                .registry
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
        })
    }

    /// The store root, falling back to [`default_storage_root`].
    pub fn storage_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(default_storage_root)
    }

    /// Open the store these settings describe. `root_override` wins over the
    /// configured root.
    pub fn open_store(&self, root_override: Option<&Path>) -> Result<DirStore> {
        let root = root_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.storage_root());
        let store = DirStore::open(&root)
            .with_context(|| format!("opening store at '{}'", root.display()))?;
        Ok(store.with_image_sources(self.image_sources.clone()))
    }
}

/// `<config dir>/buildah/storage.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(PACKAGE).join("storage.toml"))
}

/// System-wide store for root, per-user store otherwise.
pub fn default_storage_root() -> PathBuf {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        return PathBuf::from("/var/lib").join(PACKAGE).join("storage");
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(PACKAGE)
        .join("storage")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(Settings::from_toml_str("").unwrap(), Settings::default());
    }

    #[test]
    fn storage_table_is_read() {
        let s = Settings::from_toml_str(
            r#"
            [storage]
            root = "/srv/buildah"
            image_sources = ["/srv/images", "/mnt/images"]
            registry = " registry.example "
            "#,
        )
        .unwrap();
        assert_eq!(s.root, Some(PathBuf::from("/srv/buildah")));
        assert_eq!(
            s.image_sources,
            vec![PathBuf::from("/srv/images"), PathBuf::from("/mnt/images")]
        );
        assert_eq!(s.registry.as_deref(), Some("registry.example"));
        assert_eq!(s.storage_root(), PathBuf::from("/srv/buildah"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Settings::from_toml_str("[storage]\ndriver = \"overlay\"\n").is_err());
        assert!(Settings::from_toml_str("[network]\n").is_err());
    }

    #[test]
    fn blank_registry_is_none() {
        let s = Settings::from_toml_str("[storage]\nregistry = \"\"\n").unwrap();
        assert!(s.registry.is_none());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = Settings::load(Some(tmp.path().join("absent.toml").as_path())).unwrap_err();
        assert!(format!("{err:#}").contains("absent.toml"));
    }

    #[test]
    fn open_store_honours_override() {
        let tmp = TempDir::new().unwrap();
        let configured = Settings {
            root: Some(tmp.path().join("configured")),
            ..Default::default()
        };
        let store = configured
            .open_store(Some(tmp.path().join("override").as_path()))
            .unwrap();
        assert!(store.root().ends_with("override"));
        assert!(!tmp.path().join("configured").exists());
    }

    #[test]
    fn default_root_ends_in_package_storage() {
        assert!(default_storage_root().ends_with("buildah/storage"));
    }
}
