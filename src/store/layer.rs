//! Image root filesystems packed as deterministic `tar.zst` layers.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

/// Pack `src_dir` into a zstd-compressed tar at `out_path`.
///
/// Entries are sorted and ownership/mtime are zeroed, so packing the same
/// tree twice yields the same bytes.
pub fn pack_dir(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        let p = ent.path();
        if p == src_dir {
            continue;
        }
        entries.push(p.to_path_buf());
    }

    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");

        let md = fs::symlink_metadata(&p)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(mode_of(&md));

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut f)?;
        }
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

/// Unpack a layer produced by [`pack_dir`] into `dest_dir`, creating it.
pub fn unpack_into(layer: &Path, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
    let f = File::open(layer).with_context(|| format!("Failed to open {}", layer.display()))?;
    let decoder = zstd::stream::Decoder::new(f)?;
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest_dir)
        .with_context(|| format!("Failed to unpack {}", layer.display()))?;
    Ok(())
}

/// Hex sha256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(unix)]
fn mode_of(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(md: &fs::Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pack_then_unpack_preserves_tree() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/os-release"), b"ID=test\n").unwrap();
        std::os::unix::fs::symlink("os-release", src.join("etc/link")).unwrap();

        let layer = tmp.path().join("layer.tar.zst");
        pack_dir(&src, &layer).unwrap();

        let dest = tmp.path().join("dest");
        unpack_into(&layer, &dest).unwrap();
        assert_eq!(fs::read(dest.join("etc/os-release")).unwrap(), b"ID=test\n");
        assert_eq!(
            fs::read_link(dest.join("etc/link")).unwrap(),
            Path::new("os-release")
        );
    }

    #[test]
    fn packing_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("b")).unwrap();
        fs::write(src.join("a"), b"1").unwrap();
        fs::write(src.join("b/c"), b"2").unwrap();

        let one = tmp.path().join("one.tar.zst");
        let two = tmp.path().join("two.tar.zst");
        pack_dir(&src, &one).unwrap();
        pack_dir(&src, &two).unwrap();
        assert_eq!(sha256_file(&one).unwrap(), sha256_file(&two).unwrap());
    }
}
