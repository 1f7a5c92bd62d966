//! Durable, append-only offline queue of pending evidence uploads.
//!
//! Storage is a single JSONL write-ahead log under `queue/queue.db`: every
//! mutation (enqueue, nack, ack) appends one record and `fsync`s before
//! returning, so the queue survives a crash between commits. On open, the
//! log is replayed and the last record seen for each id wins; a trailing
//! partially-written line (crash mid-write) is discarded.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Base backoff for retry scheduling.
const BASE_BACKOFF_SEC: i64 = 30;
/// `retry_count` exponent cap (2^6 ≈ 32 min maximum backoff).
const BACKOFF_EXPONENT_CAP: u32 = 6;
/// Above this many retries an entry is moved to the dead-letter directory.
pub const MAX_RETRY_COUNT: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Status {
    Active,
    Acked,
    DeadLettered,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WalRecord {
    id: u64,
    bundle_id: String,
    bundle_path: PathBuf,
    signature_path: Option<PathBuf>,
    created_at: DateTime<Utc>,
    retry_count: u32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    status: Status,
}

/// A queue entry as exposed to callers.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub id: u64,
    pub bundle_id: String,
    pub bundle_path: PathBuf,
    pub signature_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
}

impl From<&WalRecord> for QueueEntry {
    fn from(r: &WalRecord) -> Self {
        Self {
            id: r.id,
            bundle_id: r.bundle_id.clone(),
            bundle_path: r.bundle_path.clone(),
            signature_path: r.signature_path.clone(),
            created_at: r.created_at,
            retry_count: r.retry_count,
            last_error: r.last_error.clone(),
            next_attempt_at: r.next_attempt_at,
        }
    }
}

/// Outcome of [`OfflineQueue::nack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The entry was rescheduled for a later retry.
    Rescheduled,
    /// The entry exceeded [`MAX_RETRY_COUNT`] and moved to dead-letter.
    DeadLettered,
}

/// Single-writer (the healer), single-reader (the control-plane drain
/// task) durable queue.
pub struct OfflineQueue {
    dir: PathBuf,
    wal_path: PathBuf,
    dead_letter_dir: PathBuf,
    state: Mutex<QueueState>,
}

struct QueueState {
    entries: std::collections::BTreeMap<u64, WalRecord>,
    next_id: u64,
    wal: File,
}

impl OfflineQueue {
    /// Open (creating if absent) the queue rooted at `dir`, replaying the
    /// WAL to recover in-memory state.
    pub fn open(dir: &Path) -> Result<Self, QueueError> {
        fs::create_dir_all(dir)?;
        let dead_letter_dir = dir.join("dead_letter");
        fs::create_dir_all(&dead_letter_dir)?;
        let wal_path = dir.join("queue.db");

        let (entries, next_id) = replay(&wal_path)?;

        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            wal_path,
            dead_letter_dir,
            state: Mutex::new(QueueState {
                entries,
                next_id,
                wal,
            }),
        })
    }

    /// Append a new pending entry for `bundle_path` (with optional detached
    /// signature) and durably commit it.
    pub fn enqueue(
        &self,
        bundle_id: &str,
        bundle_path: PathBuf,
        signature_path: Option<PathBuf>,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let record = WalRecord {
            id,
            bundle_id: bundle_id.to_string(),
            bundle_path,
            signature_path,
            created_at: now,
            retry_count: 0,
            last_error: None,
            next_attempt_at: now,
            status: Status::Active,
        };
        append_record(&mut state.wal, &record)?;
        state.entries.insert(id, record);
        Ok(id)
    }

    /// Return up to `limit` active entries whose `next_attempt_at <= now`,
    /// in FIFO order by id (ties broken by insertion order, newer entries
    /// may be pushed behind an older entry's later `next_attempt_at`).
    #[must_use]
    pub fn peek_due(&self, limit: usize, now: DateTime<Utc>) -> Vec<QueueEntry> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|r| r.status == Status::Active && r.next_attempt_at <= now)
            .take(limit)
            .map(QueueEntry::from)
            .collect()
    }

    /// Current number of active (not yet acked/dead-lettered) entries.
    #[must_use]
    pub fn depth(&self) -> usize {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|r| r.status == Status::Active)
            .count()
    }

    /// Acknowledge successful upload; the entry is logically removed.
    pub fn ack(&self, id: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let Some(record) = state.entries.get_mut(&id) else {
            return Ok(());
        };
        record.status = Status::Acked;
        let record = record.clone();
        append_record(&mut state.wal, &record)?;
        state.entries.remove(&id);
        Ok(())
    }

    /// Record a failed upload attempt; reschedules with exponential
    /// backoff and jitter, or dead-letters the entry past
    /// [`MAX_RETRY_COUNT`].
    pub fn nack(
        &self,
        id: u64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<NackOutcome, QueueError> {
        let mut state = self.state.lock();
        let Some(record) = state.entries.get_mut(&id) else {
            return Ok(NackOutcome::Rescheduled);
        };

        record.retry_count += 1;
        record.last_error = Some(error.to_string());

        if record.retry_count > MAX_RETRY_COUNT {
            record.status = Status::DeadLettered;
            let record = record.clone();
            append_record(&mut state.wal, &record)?;
            state.entries.remove(&id);
            move_to_dead_letter(&self.dead_letter_dir, &record)?;
            return Ok(NackOutcome::DeadLettered);
        }

        record.next_attempt_at = now + next_backoff(record.retry_count);
        let record = record.clone();
        append_record(&mut state.wal, &record)?;
        Ok(NackOutcome::Rescheduled)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }
}

fn next_backoff(retry_count: u32) -> chrono::Duration {
    let exponent = retry_count.min(BACKOFF_EXPONENT_CAP);
    let base = BASE_BACKOFF_SEC * 2i64.pow(exponent);
    let jitter_frac = rand::thread_rng().gen_range(-0.10..=0.10);
    #[allow(clippy::cast_possible_truncation)]
    let jittered = (base as f64 * (1.0 + jitter_frac)).max(1.0) as i64;
    chrono::Duration::seconds(jittered)
}

fn append_record(wal: &mut File, record: &WalRecord) -> Result<(), QueueError> {
    let line = serde_json::to_string(record)?;
    wal.write_all(line.as_bytes())?;
    wal.write_all(b"\n")?;
    wal.sync_all()?;
    Ok(())
}

fn move_to_dead_letter(dead_letter_dir: &Path, record: &WalRecord) -> Result<(), QueueError> {
    let dest = dead_letter_dir.join(&record.bundle_id);
    fs::create_dir_all(&dest)?;
    if record.bundle_path.exists() {
        let _ = fs::copy(&record.bundle_path, dest.join("bundle.json"));
    }
    if let Some(sig) = &record.signature_path {
        if sig.exists() {
            let _ = fs::copy(sig, dest.join("bundle.sig"));
        }
    }
    Ok(())
}

/// Replay the WAL, keeping only the last record per id and discarding a
/// corrupt/partial trailing line.
fn replay(
    wal_path: &Path,
) -> Result<(std::collections::BTreeMap<u64, WalRecord>, u64), QueueError> {
    let mut entries = std::collections::BTreeMap::new();
    let mut next_id = 0u64;

    if !wal_path.exists() {
        return Ok((entries, next_id));
    }

    let file = File::open(wal_path)?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<WalRecord>(line) else {
            // Corrupt/partial line: crash recovery stops here.
            break;
        };
        next_id = next_id.max(record.id + 1);
        match record.status {
            Status::Active => {
                entries.insert(record.id, record);
            }
            Status::Acked | Status::DeadLettered => {
                entries.remove(&record.id);
            }
        }
    }

    Ok((entries, next_id))
}
