//! Published image artifacts.
//!
//! The rootfs is archived as a deterministic `tar.zst`: entries sorted by
//! path, mtime 0, uid/gid 0. Two builds of the same tree give the same bytes.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

/// Rootfs archive name inside a run directory.
pub const ROOTFS_ARCHIVE: &str = "rootfs.tar.zst";

/// Image runtime configuration name inside a run directory.
pub const IMAGE_CONFIG: &str = "image-config.json";

const ZSTD_LEVEL: i32 = 3;

/// Archive `src_dir` into `out_path` deterministically.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, ZSTD_LEVEL)?;
    let mut builder = TarBuilder::new(encoder);

    // Collect paths deterministically.
    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.with_context(|| format!("walking '{}'", src_dir.display()))?;
        if ent.path() == src_dir {
            continue;
        }
        entries.push(ent.path().to_path_buf());
    }
    entries.sort_by(|a, b| relative(src_dir, a).cmp(&relative(src_dir, b)));

    for p in entries {
        let rel = relative(src_dir, &p);
        let md = fs::symlink_metadata(&p)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(md.permissions().mode() & 0o7777);

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut f)?;
        } else {
            tracing::warn!(path = %p.display(), "skipping special file in rootfs archive");
        }
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

/// Hex sha256 and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
