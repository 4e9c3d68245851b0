//! Finding build containers by name, ID, or path.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::debug;

use super::{absolute_path, codec, Builder};
use crate::error::{BuilderError, Result, StoreError};
use crate::store::Store;
use crate::STATE_FILE;

/// Load the record for the container with this name or ID.
pub fn open_builder(store: &dyn Store, container: &str) -> Result<Builder> {
    let dir = store.container_directory(container)?;
    let path = dir.join(STATE_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(BuilderError::NotFound(container.to_string()));
        }
        Err(e) => {
            return Err(BuilderError::io(
                format!("reading {}", path.display()),
                e,
            ))
        }
    };
    codec::decode(&bytes)
}

/// Find the build container whose mount point, earlier mounts, or links
/// include `path`.
///
/// This is a linear scan over every container in the store. Containers
/// without a record, or whose record belongs to some other tool, are skipped.
pub fn open_builder_by_path(store: &dyn Store, path: &Path) -> Result<Builder> {
    let abs = absolute_path(path)?;

    for container in store.containers()? {
        let bytes = match store.metadata(&container.id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(StoreError::UnknownContainer(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        match codec::decode(&bytes) {
            Ok(builder) if builder.matches_path(&abs) => return Ok(builder),
            Ok(_) => {}
            Err(e) if e.is_foreign() => {
                debug!(container = %container.id, error = %e, "skipping container");
            }
            Err(e) => return Err(e),
        }
    }

    Err(BuilderError::NotFound(abs.display().to_string()))
}

/// Resolve a build container from any combination of name, root path, and
/// link path. Each one given is tried in that order until one matches.
pub fn open_builder_any(
    store: &dyn Store,
    name: Option<&str>,
    root: Option<&Path>,
    link: Option<&Path>,
) -> Result<Builder> {
    let name = name.filter(|n| !n.is_empty());
    let root = root.filter(|p| !p.as_os_str().is_empty());
    let link = link.filter(|p| !p.as_os_str().is_empty());

    let mut last_err = BuilderError::NoTarget;
    if let Some(name) = name {
        match open_builder(store, name) {
            Ok(builder) => return Ok(builder),
            Err(e) => last_err = e,
        }
    }
    for path in [root, link].into_iter().flatten() {
        match open_builder_by_path(store, path) {
            Ok(builder) => return Ok(builder),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Every container in the store that carries one of our records.
pub fn list_builders(store: &dyn Store) -> Result<Vec<Builder>> {
    let mut builders = Vec::new();
    for container in store.containers()? {
        let bytes = match store.metadata(&container.id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(StoreError::UnknownContainer(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        match codec::decode(&bytes) {
            Ok(builder) => builders.push(builder),
            Err(e) if e.is_foreign() => {
                debug!(container = %container.id, error = %e, "not a build container");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(builders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{new_builder, BuilderOptions};
    use crate::store::testing::MemStore;
    use crate::store::ContainerRequest;
    use tempfile::TempDir;

    fn named(store: &MemStore, name: &str) -> Builder {
        new_builder(
            store,
            &BuilderOptions {
                container: name.into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn foreign(store: &MemStore, name: &str, bytes: &[u8]) -> String {
        let info = store
            .create_container(&ContainerRequest {
                name: name.into(),
                image_id: None,
            })
            .unwrap();
        store.put_metadata(&info.id, bytes);
        info.id
    }

    #[test]
    fn open_by_name_and_id() {
        let store = MemStore::new();
        let b = named(&store, "web");
        assert_eq!(open_builder(&store, "web").unwrap(), b);
        assert_eq!(open_builder(&store, &b.container_id).unwrap(), b);
    }

    #[test]
    fn open_unknown_name_is_a_store_error() {
        let store = MemStore::new();
        assert!(matches!(
            open_builder(&store, "ghost").unwrap_err(),
            BuilderError::Store(StoreError::UnknownContainer(_))
        ));
    }

    #[test]
    fn open_container_without_record_is_not_found() {
        let store = MemStore::new();
        store
            .create_container(&ContainerRequest {
                name: "bare".into(),
                image_id: None,
            })
            .unwrap();
        assert!(matches!(
            open_builder(&store, "bare").unwrap_err(),
            BuilderError::NotFound(_)
        ));
    }

    #[test]
    fn open_foreign_record_is_a_type_mismatch() {
        let store = MemStore::new();
        foreign(&store, "other", br#"{"type":"podman"}"#);
        assert!(matches!(
            open_builder(&store, "other").unwrap_err(),
            BuilderError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn path_lookup_matches_mount_and_link() {
        let store = MemStore::new();
        let tmp = TempDir::new().unwrap();
        named(&store, "first");
        let mut b = named(&store, "second");
        let link = tmp.path().join("second-root");
        let mount = b.mount(&store, Some(link.as_path())).unwrap();

        assert_eq!(open_builder_by_path(&store, &mount).unwrap(), b);
        assert_eq!(open_builder_by_path(&store, &link).unwrap(), b);

        let dotted = tmp.path().join(".").join("x").join("..").join("second-root");
        assert_eq!(open_builder_by_path(&store, &dotted).unwrap(), b);
    }

    #[test]
    fn path_lookup_matches_earlier_mounts() {
        let store = MemStore::new();
        let mut b = named(&store, "c");
        b.mounts.push("/old/mount".into());
        b.save(&store).unwrap();
        assert_eq!(open_builder_by_path(&store, Path::new("/old/mount")).unwrap(), b);
    }

    #[test]
    fn path_lookup_skips_foreign_and_broken_records() {
        let store = MemStore::new();
        foreign(&store, "junk", b"\x00\x01 not json");
        foreign(&store, "podman", br#"{"type":"podman","mountpoint":"/m"}"#);
        store
            .create_container(&ContainerRequest {
                name: "bare".into(),
                image_id: None,
            })
            .unwrap();
        let mut ours = named(&store, "ours");
        ours.mount_point = Some("/m".into());
        ours.save(&store).unwrap();

        assert_eq!(open_builder_by_path(&store, Path::new("/m")).unwrap(), ours);
    }

    #[test]
    fn path_lookup_returns_first_match_in_store_order() {
        let store = MemStore::new();
        let mut first = named(&store, "first");
        first.mount_point = Some("/same".into());
        first.save(&store).unwrap();
        let mut second = named(&store, "second");
        second.mounts.push("/same".into());
        second.save(&store).unwrap();

        let found = open_builder_by_path(&store, Path::new("/same")).unwrap();
        assert_eq!(found.container_id, first.container_id);
    }

    #[test]
    fn path_lookup_without_match_is_not_found() {
        let store = MemStore::new();
        named(&store, "a");
        let err = open_builder_by_path(&store, Path::new("/nowhere")).unwrap_err();
        match err {
            BuilderError::NotFound(what) => assert_eq!(what, "/nowhere"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn any_requires_a_target() {
        let store = MemStore::new();
        assert!(matches!(
            open_builder_any(&store, None, None, None).unwrap_err(),
            BuilderError::NoTarget
        ));
        assert!(matches!(
            open_builder_any(&store, Some(""), Some(Path::new("")), None).unwrap_err(),
            BuilderError::NoTarget
        ));
    }

    #[test]
    fn any_falls_through_to_paths() {
        let store = MemStore::new();
        let mut b = named(&store, "c");
        b.mount_point = Some("/r".into());
        b.save(&store).unwrap();

        let found =
            open_builder_any(&store, Some("ghost"), Some(Path::new("/r")), None).unwrap();
        assert_eq!(found, b);

        let by_name = open_builder_any(&store, Some("c"), None, None).unwrap();
        assert_eq!(by_name, b);

        let err = open_builder_any(&store, None, None, Some(Path::new("/none")))
            .unwrap_err();
        assert!(matches!(err, BuilderError::NotFound(_)));
    }

    #[test]
    fn list_only_returns_our_records() {
        let store = MemStore::new();
        let a = named(&store, "a");
        foreign(&store, "x", br#"{"type":"other"}"#);
        let b = named(&store, "b");
        assert_eq!(list_builders(&store).unwrap(), vec![a, b]);
    }

    #[test]
    fn scans_skip_containers_removed_mid_scan() {
        let store = MemStore::new();
        store.add_vanished("deadbeef");
        let mut b = named(&store, "live");
        b.mount_point = Some("/live".into());
        b.save(&store).unwrap();

        assert_eq!(list_builders(&store).unwrap(), vec![b.clone()]);
        assert_eq!(open_builder_by_path(&store, Path::new("/live")).unwrap(), b);
    }
}
