//! Run directories under the output root.
//!
//! ```text
//! <output>/
//!   .provision.lock
//!   .<run_id>.partial/      in-flight build, removed unless committed
//!   <run_id>/               published run
//!     rootfs.tar.zst
//!     image-config.json
//!     run-manifest.json
//! ```

use std::cmp::Reverse;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::executor::StageRecord;
use crate::privilege::Identity;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const LOCK_FILENAME: &str = ".provision.lock";
const PARTIAL_SUFFIX: &str = ".partial";
pub const RUN_MANIFEST_SCHEMA: u32 = 1;
pub const STATUS_SUCCESS: &str = "success";

const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fields every run manifest carries; enough for listing and pruning.
#[derive(Debug, Deserialize, Clone)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub package_digest: Option<String>,
}

/// Checksummed file published with a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub file: String,
    pub sha256: String,
    pub size: u64,
}

/// `run-manifest.json` of a published run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema: u32,
    pub run_id: String,
    pub image: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub dev: bool,
    pub backend: String,
    pub identity: Identity,
    pub plan_key: String,
    pub stages: Vec<StageRecord>,
    /// Installed package keys, sorted.
    pub packages: Vec<String>,
    pub package_digest: String,
    pub artifacts: Vec<ArtifactRecord>,
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_run_manifest(run_dir: &Path, manifest: &RunManifest) -> Result<()> {
    let path = manifest_path(run_dir);
    write_json_atomic(&path, manifest)
        .with_context(|| format!("writing run manifest '{}'", path.display()))
}

pub fn load_run_manifest(run_dir: &Path) -> Result<RunManifest> {
    let path = manifest_path(run_dir);
    let bytes =
        fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing run manifest '{}'", path.display()))
}

/// Metadata of every published run. Dot-prefixed entries (locks, partial
/// runs) are skipped.
pub fn load_runs_metadata(output_root: &Path) -> Result<Vec<RunMetadata>> {
    if !output_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(output_root)
        .with_context(|| format!("reading runs directory '{}'", output_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", output_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading run metadata '{}'", path.display()))?;
        let parsed: RunMetadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run metadata '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful_run_id(output_root: &Path) -> Result<Option<String>> {
    let runs = load_runs_metadata(output_root)?;
    Ok(runs
        .into_iter()
        .find(|run| run.status == STATUS_SUCCESS)
        .map(|r| r.run_id))
}

/// Keep the newest `keep` runs, delete the rest.
pub fn prune_old_runs(output_root: &Path, keep: usize) -> Result<Vec<String>> {
    let runs = load_runs_metadata(output_root)?;
    let mut pruned = Vec::new();
    for run in runs.into_iter().skip(keep) {
        let path = output_root.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
        tracing::debug!(run_id = %run.run_id, "pruned old run");
        pruned.push(run.run_id);
    }
    Ok(pruned)
}

fn run_sort_key(run: &RunMetadata) -> (String, String) {
    (
        run.finished_at_utc
            .clone()
            .unwrap_or_else(|| run.created_at_utc.clone()),
        run.run_id.clone(),
    )
}

/// Sortable base62 run id derived from the clock, pid and a counter.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << (RUN_ID_SALT_BITS - 16);
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let mut id = base62_encode_u128(entropy);
    id = id.trim_start_matches('0').to_string();
    if id.is_empty() {
        id.push('0');
    }
    if id.len() > 20 {
        bail!("sortable run id overflow while generating run identifier")
    }
    Ok(id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

/// UTC timestamp in the compact `YYYYMMDDTHHMMSSZ` form.
pub fn now_utc_compact() -> Result<String> {
    format_utc_compact(OffsetDateTime::now_utc())
}

fn format_utc_compact(at: OffsetDateTime) -> Result<String> {
    at.format(format_description!(
        "[year][month][day]T[hour][minute][second]Z"
    ))
    .context("formatting UTC timestamp")
}

/// Exclusive lock on an output root, held for the whole build.
#[derive(Debug)]
pub struct OutputLock {
    _file: File,
    path: PathBuf,
}

impl OutputLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Take the output lock without waiting.
///
/// The lock file is never unlinked: removing a file another process still
/// has locked would let a third process lock a fresh inode at the same path.
pub fn lock_output(output_root: &Path) -> Result<OutputLock> {
    fs::create_dir_all(output_root)
        .with_context(|| format!("creating output directory '{}'", output_root.display()))?;
    let path = output_root.join(LOCK_FILENAME);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

    if file.try_lock_exclusive().is_err() {
        bail!("output directory is locked by another build: {}", path.display());
    }
    Ok(OutputLock { _file: file, path })
}

/// A run directory that only becomes visible when committed.
///
/// Dropping an uncommitted run deletes everything written to it.
#[derive(Debug)]
pub struct PartialRun {
    run_id: String,
    output_root: PathBuf,
    path: PathBuf,
    committed: bool,
}

impl PartialRun {
    pub fn allocate(output_root: &Path) -> Result<Self> {
        for _ in 0..32 {
            let run_id = generate_run_id()?;
            let path = output_root.join(format!(".{}{}", run_id, PARTIAL_SUFFIX));
            if path.exists() || output_root.join(&run_id).exists() {
                continue;
            }
            fs::create_dir_all(&path)
                .with_context(|| format!("creating run directory '{}'", path.display()))?;
            return Ok(Self {
                run_id,
                output_root: output_root.to_path_buf(),
                path,
                committed: false,
            });
        }
        bail!(
            "failed allocating unique run directory under '{}'",
            output_root.display()
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish the run by renaming it to its final name.
    pub fn commit(mut self) -> Result<PathBuf> {
        let final_path = self.output_root.join(&self.run_id);
        fs::rename(&self.path, &final_path).with_context(|| {
            format!(
                "publishing run '{}' -> '{}'",
                self.path.display(),
                final_path.display()
            )
        })?;
        self.committed = true;
        Ok(final_path)
    }
}

impl Drop for PartialRun {
    fn drop(&mut self) {
        if self.committed || !self.path.exists() {
            return;
        }
        tracing::warn!(run_id = %self.run_id, "discarding unpublished run");
        if let Err(err) = fs::remove_dir_all(&self.path) {
            tracing::error!(
                path = %self.path.display(),
                error = %err,
                "failed to remove unpublished run"
            );
        }
    }
}

/// Remove partial run directories left by a crashed process.
pub fn sweep_stale_partials(output_root: &Path) -> Result<()> {
    if !output_root.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(output_root)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) && path.is_dir() {
            tracing::warn!(path = %path.display(), "removing stale partial run");
            fs::remove_dir_all(&path)
                .with_context(|| format!("removing stale partial run '{}'", path.display()))?;
        }
    }
    Ok(())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let mut payload = serde_json::to_vec_pretty(value).context("serializing run manifest")?;
    payload.push(b'\n');
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}
