//! JSON encoding of [`Builder`] records and their atomic persistence.

use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::Builder as TempFileBuilder;
use tracing::debug;

use super::Builder;
use crate::error::{BuilderError, Result};
use crate::store::Store;
use crate::STATE_FILE;

/// Serialize a record. Empty fields are left out; `type` is always present.
pub fn encode(builder: &Builder) -> Result<Vec<u8>> {
    serde_json::to_vec(builder).map_err(BuilderError::Encode)
}

/// Parse a record, rejecting anything not stamped with our type tag.
pub fn decode(bytes: &[u8]) -> Result<Builder> {
    let builder: Builder = serde_json::from_slice(bytes).map_err(BuilderError::Decode)?;
    if !builder.type_tag.is_ours() {
        return Err(BuilderError::TypeMismatch {
            found: builder.type_tag.as_str().to_string(),
        });
    }
    Ok(builder)
}

impl Builder {
    /// Write the record to the container's metadata directory.
    ///
    /// Readers observe either the previous record or the new one, never a
    /// partial write.
    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let bytes = encode(self)?;
        let dir = store.container_directory(&self.container_id)?;
        atomic_write(&dir.join(STATE_FILE), &bytes)?;
        debug!(container = %self.container_id, bytes = bytes.len(), "saved build container record");
        Ok(())
    }
}

/// Replace `path` with `bytes` via a synced temp file in the same directory.
/// The result is readable by the owner only.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    atomic_write_with(path, bytes, |_| Ok(()))
}

fn atomic_write_with<F>(path: &Path, bytes: &[u8], before_persist: F) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let ctx = |what: &str| format!("{what} {}", path.display());

    // Dropping the temp file on any early return removes it.
    let mut tmp = TempFileBuilder::new()
        .prefix(".buildah-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| BuilderError::io(ctx("creating temp file for"), e))?;
    fs::set_permissions(tmp.path(), Permissions::from_mode(0o600))
        .map_err(|e| BuilderError::io(ctx("setting permissions for"), e))?;
    tmp.write_all(bytes)
        .map_err(|e| BuilderError::io(ctx("writing"), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| BuilderError::io(ctx("syncing"), e))?;

    before_persist(tmp.path()).map_err(|e| BuilderError::io(ctx("writing"), e))?;

    tmp.persist(path)
        .map_err(|e| BuilderError::io(ctx("replacing"), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemStore;
    use crate::store::ContainerRequest;
    use crate::CONTAINER_TYPE;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn sample() -> Builder {
        let mut b = Builder {
            from_image: Some("fedora".into()),
            config: vec![0, 1, 2, 255],
            manifest: b"{}".to_vec(),
            container: "fedora-working-container".into(),
            container_id: "c0ffee".into(),
            os: "linux".into(),
            architecture: "amd64".into(),
            env: vec!["A=1".into(), "B=2".into()],
            cmd: vec!["/bin/sh".into(), "-c".into(), "echo hi".into()],
            ..Builder::default()
        };
        b.expose.insert("8080/tcp".into());
        b.labels.insert("version".into(), "1".into());
        b
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let b = sample();
        assert_eq!(decode(&encode(&b).unwrap()).unwrap(), b);
    }

    #[test]
    fn empty_fields_are_omitted_but_type_is_not() {
        let v: Value = serde_json::from_slice(&encode(&Builder::default()).unwrap()).unwrap();
        assert_eq!(v, json!({ "type": CONTAINER_TYPE }));
    }

    #[test]
    fn wire_names_and_shapes() {
        let v: Value = serde_json::from_slice(&encode(&sample()).unwrap()).unwrap();
        assert_eq!(v["type"], CONTAINER_TYPE);
        assert_eq!(v["image"], "fedora");
        assert_eq!(v["config"], "AAEC/w==");
        assert_eq!(v["manifest"], "e30=");
        assert_eq!(v["container-name"], "fedora-working-container");
        assert_eq!(v["container-id"], "c0ffee");
        assert_eq!(v["arch"], "amd64");
        assert_eq!(v["expose"], json!({ "8080/tcp": {} }));
        assert_eq!(v["labels"], json!({ "version": "1" }));
        assert!(v.get("mountpoint").is_none());
        assert!(v.get("created-by").is_none());
    }

    #[test]
    fn wrong_type_is_rejected() {
        let err = decode(br#"{"type":"other 1.0","container-id":"x"}"#).unwrap_err();
        match err {
            BuilderError::TypeMismatch { found } => assert_eq!(found, "other 1.0"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_type_is_rejected() {
        let err = decode(br#"{"container-id":"x"}"#).unwrap_err();
        assert!(matches!(err, BuilderError::TypeMismatch { ref found } if found.is_empty()));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(decode(b"{not json").unwrap_err(), BuilderError::Decode(_)));
    }

    #[test]
    fn nulls_and_unknown_fields_are_tolerated() {
        let b = decode(
            br#"{"type":"buildah 0.0.0","env":null,"labels":null,"expose":null,"config":null,"future":true}"#,
        )
        .unwrap();
        assert!(b.env.is_empty() && b.labels.is_empty() && b.expose.is_empty());
        assert!(b.config.is_empty());
    }

    #[test]
    fn save_writes_owner_only_file() {
        let store = MemStore::new();
        let info = store
            .create_container(&ContainerRequest {
                name: "c".into(),
                image_id: None,
            })
            .unwrap();
        let b = Builder {
            container: "c".into(),
            container_id: info.id.clone(),
            ..Builder::default()
        };
        b.save(&store).unwrap();

        let path = store.container_directory(&info.id).unwrap().join(STATE_FILE);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(decode(&fs::read(&path).unwrap()).unwrap(), b);
    }

    #[test]
    fn save_to_unknown_container_fails() {
        let store = MemStore::new();
        let b = Builder {
            container_id: "gone".into(),
            ..Builder::default()
        };
        assert!(matches!(
            b.save(&store).unwrap_err(),
            BuilderError::Store(crate::StoreError::UnknownContainer(_))
        ));
    }

    #[test]
    fn interrupted_write_keeps_previous_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(STATE_FILE);
        atomic_write(&path, b"old").unwrap();

        let err = atomic_write_with(&path, b"new", |_| {
            Err(io::Error::new(io::ErrorKind::Interrupted, "crash"))
        })
        .unwrap_err();
        assert!(matches!(err, BuilderError::Io { .. }));

        assert_eq!(fs::read(&path).unwrap(), b"old");
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n != STATE_FILE)
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }
}
