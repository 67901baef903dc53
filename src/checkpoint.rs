//! Checkpointing of map-reduce reduction progress, not of pipeline data.
//!
//! A long-running [`crate::mapreduce::MapReduceNode`] reduction over a wide step range
//! can be expensive to restart from `first_step` after a crash. This module lets a
//! caller periodically persist *how far a rank's local fold has gotten* — the highest
//! step index folded so far and the partial dataset accumulated up to it — and resume
//! from that point on the next `update()` rather than refolding from scratch. It never
//! stores pipeline graphs, reports, or requests; only this one, narrow piece of
//! executor progress, matching the original's own checkpoint-of-progress shape.

#[cfg(feature = "checkpointing")]
use crate::dataset::Dataset;
#[cfg(feature = "checkpointing")]
use anyhow::{Context, Result, anyhow};
#[cfg(feature = "checkpointing")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "checkpointing")]
use sha2::{Digest, Sha256};
#[cfg(feature = "checkpointing")]
use std::fs::{DirEntry, File, create_dir_all, read_dir, remove_file};
#[cfg(feature = "checkpointing")]
use std::io::{Read, Write};
#[cfg(feature = "checkpointing")]
use std::path::{Path, PathBuf};
#[cfg(feature = "checkpointing")]
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Configuration for checkpoint behavior.
#[derive(Clone, Debug)]
#[cfg(feature = "checkpointing")]
pub struct CheckpointConfig {
    /// Enable or disable checkpointing.
    pub enabled: bool,
    /// Directory where checkpoint files are stored.
    pub directory: PathBuf,
    /// Policy determining when checkpoints are created.
    pub policy: CheckpointPolicy,
    /// Automatically resume from the latest checkpoint on startup.
    pub auto_recover: bool,
    /// Maximum number of checkpoints to retain per rank (oldest deleted first).
    pub max_checkpoints: Option<usize>,
}

#[cfg(feature = "checkpointing")]
impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("./kernel_checkpoints"),
            policy: CheckpointPolicy::EveryNSteps(10),
            auto_recover: true,
            max_checkpoints: Some(10),
        }
    }
}

/// Policy for determining when a checkpoint is taken during a rank's local fold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg(feature = "checkpointing")]
pub enum CheckpointPolicy {
    /// Checkpoint after every N locally-folded steps.
    EveryNSteps(usize),
    /// Checkpoint after approximately every N seconds of folding.
    TimeInterval(u64),
    /// Checkpoint on both conditions, whichever fires first.
    Hybrid { every_n_steps: usize, interval_secs: u64 },
}

/// Progress snapshot for one rank's local fold over a map-reduce step range.
#[derive(Serialize, Deserialize)]
#[cfg(feature = "checkpointing")]
pub struct ReductionCheckpoint {
    /// Name of the `MapReduceNode` this checkpoint belongs to.
    pub node_name: String,
    /// This rank's number, so a restart resumes the same rank's slice.
    pub rank: usize,
    /// Highest step index folded into `partial` so far (inclusive).
    pub last_completed_step: i64,
    /// The partial dataset accumulated through `last_completed_step`, framed via
    /// `Dataset::to_bytes`.
    pub partial_bytes: Vec<u8>,
    /// Milliseconds since epoch when this checkpoint was written.
    pub timestamp: u64,
    /// SHA-256 over `node_name:rank:last_completed_step:partial_bytes`.
    pub checksum: String,
}

#[cfg(feature = "checkpointing")]
impl ReductionCheckpoint {
    #[must_use]
    pub fn new(node_name: impl Into<String>, rank: usize, last_completed_step: i64, partial: &Dataset) -> Self {
        let node_name = node_name.into();
        let partial_bytes = partial.to_bytes();
        let timestamp = current_timestamp_ms();
        let checksum = compute_checksum(&checksum_input(&node_name, rank, last_completed_step, &partial_bytes));
        Self {
            node_name,
            rank,
            last_completed_step,
            partial_bytes,
            timestamp,
            checksum,
        }
    }

    /// Decode the stored partial dataset back out of this checkpoint.
    pub fn partial_dataset(&self) -> Result<Dataset> {
        let (dataset, _consumed) = Dataset::from_bytes(&self.partial_bytes).context("corrupt checkpoint payload")?;
        Ok(dataset)
    }
}

#[cfg(feature = "checkpointing")]
fn checksum_input(node_name: &str, rank: usize, last_completed_step: i64, partial_bytes: &[u8]) -> Vec<u8> {
    let mut buf = format!("{node_name}:{rank}:{last_completed_step}:").into_bytes();
    buf.extend_from_slice(partial_bytes);
    buf
}

/// Manages checkpoint creation, persistence, and recovery for one checkpoint directory.
#[cfg(feature = "checkpointing")]
pub struct CheckpointManager {
    pub(crate) config: CheckpointConfig,
    pub last_checkpoint_time: Option<SystemTime>,
}

#[cfg(feature = "checkpointing")]
impl CheckpointManager {
    /// Create a new checkpoint manager, creating the checkpoint directory if enabled.
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        if config.enabled {
            create_dir_all(&config.directory).context("failed to create checkpoint directory")?;
        }
        Ok(Self {
            config,
            last_checkpoint_time: None,
        })
    }

    /// Whether a checkpoint should be written after folding `steps_since_last` more
    /// steps locally.
    pub fn should_checkpoint(&mut self, steps_since_last: usize) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.config.policy {
            CheckpointPolicy::EveryNSteps(n) => n > 0 && steps_since_last >= n,
            CheckpointPolicy::TimeInterval(secs) => self.time_interval_elapsed(secs),
            CheckpointPolicy::Hybrid { every_n_steps, interval_secs } => {
                (every_n_steps > 0 && steps_since_last >= every_n_steps) || self.time_interval_elapsed(interval_secs)
            }
        }
    }

    fn time_interval_elapsed(&self, secs: u64) -> bool {
        let now = SystemTime::now();
        self.last_checkpoint_time.is_none_or(|last| {
            now.duration_since(last).is_ok_and(|elapsed| elapsed >= Duration::from_secs(secs))
        })
    }

    /// Serialize and persist `state` to disk, pruning old checkpoints for the same
    /// `(node_name, rank)` beyond `max_checkpoints`.
    pub fn save_checkpoint(&mut self, state: &ReductionCheckpoint) -> Result<PathBuf> {
        let filename = format!("{}_{}_{}.postcard", state.node_name, state.rank, state.timestamp);
        let path = self.config.directory.join(&filename);

        let encoded = postcard::to_allocvec(state).context("failed to serialize checkpoint")?;
        let mut file = File::create(&path).context("failed to create checkpoint file")?;
        file.write_all(&encoded).context("failed to write checkpoint")?;
        file.sync_all().context("failed to sync checkpoint to disk")?;

        tracing::info!(
            node = state.node_name,
            rank = state.rank,
            last_completed_step = state.last_completed_step,
            path = %path.display(),
            "wrote reduction checkpoint"
        );
        self.last_checkpoint_time = Some(SystemTime::now());
        self.cleanup_old_checkpoints(&state.node_name, state.rank)?;
        Ok(path)
    }

    /// Locate the most recent checkpoint for `(node_name, rank)`, if any.
    pub fn find_latest_checkpoint(&self, node_name: &str, rank: usize) -> Result<Option<PathBuf>> {
        if !self.config.enabled || !self.config.directory.exists() {
            return Ok(None);
        }
        let mut checkpoints = self.matching_checkpoints(node_name, rank)?;
        if checkpoints.is_empty() {
            return Ok(None);
        }
        checkpoints.sort_by_key(timestamp_of_entry);
        Ok(checkpoints.last().map(DirEntry::path))
    }

    /// Load and verify a checkpoint file's integrity.
    pub fn load_checkpoint(&self, path: &Path) -> Result<ReductionCheckpoint> {
        let mut file = File::open(path).context("failed to open checkpoint file")?;
        let mut encoded = Vec::new();
        file.read_to_end(&mut encoded).context("failed to read checkpoint")?;

        let state: ReductionCheckpoint = postcard::from_bytes(&encoded).context("failed to deserialize checkpoint")?;
        let expected = compute_checksum(&checksum_input(&state.node_name, state.rank, state.last_completed_step, &state.partial_bytes));
        if expected != state.checksum {
            tracing::error!(path = %path.display(), "checkpoint integrity check failed");
            return Err(anyhow!("checkpoint integrity check failed: checksum mismatch"));
        }
        tracing::info!(
            node = state.node_name,
            rank = state.rank,
            last_completed_step = state.last_completed_step,
            "recovered reduction checkpoint"
        );
        Ok(state)
    }

    fn matching_checkpoints(&self, node_name: &str, rank: usize) -> Result<Vec<DirEntry>> {
        let prefix = format!("{node_name}_{rank}_");
        Ok(read_dir(&self.config.directory)
            .context("failed to read checkpoint directory")?
            .filter_map(Result::ok)
            .filter(|entry| is_checkpoint_file(entry, &prefix))
            .collect())
    }

    fn cleanup_old_checkpoints(&self, node_name: &str, rank: usize) -> Result<()> {
        let Some(max_checkpoints) = self.config.max_checkpoints else {
            return Ok(());
        };
        let mut checkpoints = self.matching_checkpoints(node_name, rank)?;
        if checkpoints.len() <= max_checkpoints {
            return Ok(());
        }
        checkpoints.sort_by_key(timestamp_of_entry);
        let to_delete = checkpoints.len() - max_checkpoints;
        for entry in checkpoints.iter().take(to_delete) {
            remove_file(entry.path()).ok();
        }
        Ok(())
    }

    /// Delete every checkpoint for `(node_name, rank)`.
    pub fn clear_checkpoints(&self, node_name: &str, rank: usize) -> Result<()> {
        for entry in self.matching_checkpoints(node_name, rank)? {
            remove_file(entry.path()).ok();
        }
        Ok(())
    }
}

#[cfg(feature = "checkpointing")]
fn is_checkpoint_file(entry: &DirEntry, prefix: &str) -> bool {
    entry.file_name().to_str().is_some_and(|name| {
        name.starts_with(prefix)
            && Path::new(name).extension().is_some_and(|ext| ext.eq_ignore_ascii_case("postcard"))
    })
}

#[cfg(feature = "checkpointing")]
fn timestamp_of_entry(entry: &DirEntry) -> u64 {
    entry
        .file_name()
        .to_str()
        .and_then(|name| name.rsplit('_').next())
        .and_then(|s| s.strip_suffix(".postcard"))
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Compute a SHA-256 checksum, hex-encoded.
#[cfg(feature = "checkpointing")]
#[must_use]
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Current time in milliseconds since the Unix epoch.
#[cfg(feature = "checkpointing")]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(all(test, feature = "checkpointing"))]
mod tests {
    use super::*;
    use crate::dataset::{Extent, Mesh};
    use crate::variant::VariantArray;

    fn sample_dataset() -> Dataset {
        let mut mesh = Mesh::new(Extent::new(0, 1, 0, 0, 0, 0));
        mesh.point_arrays.set("m", VariantArray::new_f64(vec![1.0, 2.0]));
        Dataset::Mesh(mesh)
    }

    #[test]
    fn save_and_load_roundtrips_partial_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            ..CheckpointConfig::default()
        };
        let mut mgr = CheckpointManager::new(config).unwrap();

        let state = ReductionCheckpoint::new("sum", 0, 3, &sample_dataset());
        let path = mgr.save_checkpoint(&state).unwrap();

        let loaded = mgr.load_checkpoint(&path).unwrap();
        assert_eq!(loaded.last_completed_step, 3);
        assert_eq!(loaded.partial_dataset().unwrap(), sample_dataset());
    }

    #[test]
    fn find_latest_checkpoint_picks_the_most_recent_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            ..CheckpointConfig::default()
        };
        let mut mgr = CheckpointManager::new(config).unwrap();

        let mut early = ReductionCheckpoint::new("sum", 0, 1, &sample_dataset());
        early.timestamp = 1000;
        early.checksum = compute_checksum(&checksum_input(&early.node_name, early.rank, early.last_completed_step, &early.partial_bytes));
        mgr.save_checkpoint(&early).unwrap();

        let mut late = ReductionCheckpoint::new("sum", 0, 5, &sample_dataset());
        late.timestamp = 2000;
        late.checksum = compute_checksum(&checksum_input(&late.node_name, late.rank, late.last_completed_step, &late.partial_bytes));
        mgr.save_checkpoint(&late).unwrap();

        let path = mgr.find_latest_checkpoint("sum", 0).unwrap().unwrap();
        let loaded = mgr.load_checkpoint(&path).unwrap();
        assert_eq!(loaded.last_completed_step, 5);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            ..CheckpointConfig::default()
        };
        let mut mgr = CheckpointManager::new(config).unwrap();
        let mut state = ReductionCheckpoint::new("sum", 0, 3, &sample_dataset());
        state.checksum = "not-a-real-checksum".to_string();
        let path = mgr.save_checkpoint(&state).unwrap();
        assert!(mgr.load_checkpoint(&path).is_err());
    }

    #[test]
    fn should_checkpoint_respects_every_n_steps_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(CheckpointConfig {
            enabled: true,
            policy: CheckpointPolicy::EveryNSteps(4),
            directory: dir.path().to_path_buf(),
            ..CheckpointConfig::default()
        })
        .unwrap();
        assert!(!mgr.should_checkpoint(3));
        assert!(mgr.should_checkpoint(4));
    }
}
