// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AlreadyInProgress;

/// How often the rolling speed estimate is recomputed
const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

/// How long terminal operations stay visible to pollers before eviction
const DEFAULT_TERMINAL_RETENTION: Duration = Duration::from_secs(30);

/// Where the bytes of a transfer are headed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TransferDestination {
    /// Download from the episode's source URL to local disk
    Local,
    /// Copy from local disk onto the device with this id
    Device(String),
}

impl fmt::Display for TransferDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDestination::Local => write!(f, "local"),
            TransferDestination::Device(id) => write!(f, "device {}", id),
        }
    }
}

/// Why a transfer ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureCause {
    InvalidUrl,
    Network,
    Http { status: u16 },
    LocalWrite,
    SourceMissing,
    InsufficientSpace,
    PathUnavailable,
    DeviceWrite,
    DeviceRemoved,
    Cancelled,
}

/// State machine for a single transfer operation.
///
/// "Not started" is the absence of a table entry; once terminal, an entry
/// never leaves its state again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    /// Admitted, no bytes moved yet
    Pending,
    InProgress,
    Completed,
    Failed(FailureCause),
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed(_))
    }
}

/// Point-in-time view of an operation, handed out to pollers.
///
/// Serializable so a UI layer can forward it verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub episode_id: i64,
    pub destination: TransferDestination,
    pub bytes_transferred: u64,
    /// Unknown until the first response arrives for streamed sources
    /// without a content length
    pub bytes_total: Option<u64>,
    pub percentage: f64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: Option<u64>,
    pub status: TransferStatus,
}

/// Table entry. Owned by the engine driving the operation until terminal,
/// read-only afterwards.
#[derive(Debug)]
struct Operation {
    bytes_transferred: u64,
    bytes_total: Option<u64>,
    status: TransferStatus,
    speed_bytes_per_sec: f64,
    eta: Option<Duration>,
    started_at: Instant,
    last_sample_at: Instant,
    sample_bytes: u64,
    cancel_requested: bool,
    finished_at: Option<Instant>,
}

impl Operation {
    fn new(bytes_total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            bytes_transferred: 0,
            bytes_total,
            status: TransferStatus::Pending,
            speed_bytes_per_sec: 0.0,
            eta: None,
            started_at: now,
            last_sample_at: now,
            sample_bytes: 0,
            cancel_requested: false,
            finished_at: None,
        }
    }

    fn percentage(&self) -> f64 {
        match (self.bytes_total, &self.status) {
            (_, TransferStatus::Completed) => 100.0,
            (Some(total), _) if total > 0 => {
                (self.bytes_transferred as f64 / total as f64) * 100.0
            }
            _ => 0.0,
        }
    }

    fn finish(&mut self, status: TransferStatus) {
        self.status = status;
        self.finished_at = Some(Instant::now());
    }
}

type Key = (i64, TransferDestination);

/// In-memory table of active and recently-finished transfer operations.
///
/// Downloads and device copies share one table; readers poll at sub-second
/// cadence while the engine owning an entry updates it per chunk. Admission
/// is atomic: at most one non-terminal operation may exist per
/// (episode, destination) key.
pub struct ProgressTable {
    operations: RwLock<HashMap<Key, Operation>>,
    sample_window: Duration,
    terminal_retention: Duration,
}

impl Default for ProgressTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::with_tuning(DEFAULT_SAMPLE_WINDOW, DEFAULT_TERMINAL_RETENTION)
    }

    /// Table with explicit sample window and terminal retention, mainly
    /// for tests that need fast sampling or eviction.
    pub fn with_tuning(sample_window: Duration, terminal_retention: Duration) -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
            sample_window,
            terminal_retention,
        }
    }

    /// Admit a new operation for the key, rejecting if a non-terminal one
    /// already exists. A terminal entry for the same key is replaced, which
    /// is what makes an explicit retry a fresh admission.
    pub fn begin(
        &self,
        episode_id: i64,
        destination: TransferDestination,
        bytes_total: Option<u64>,
    ) -> Result<(), AlreadyInProgress> {
        let mut ops = self.operations.write().unwrap();

        let retention = self.terminal_retention;
        ops.retain(|_, op| {
            op.finished_at
                .map(|at| at.elapsed() < retention)
                .unwrap_or(true)
        });

        let key = (episode_id, destination.clone());
        if let Some(existing) = ops.get(&key)
            && !existing.status.is_terminal()
        {
            return Err(AlreadyInProgress {
                episode_id,
                destination,
            });
        }

        ops.insert(key, Operation::new(bytes_total));
        Ok(())
    }

    /// Move a pending operation to `InProgress`, fixing the total if the
    /// response supplied one.
    pub fn start(&self, episode_id: i64, destination: &TransferDestination, bytes_total: Option<u64>) {
        let mut ops = self.operations.write().unwrap();
        if let Some(op) = ops.get_mut(&(episode_id, destination.clone())) {
            if bytes_total.is_some() {
                op.bytes_total = bytes_total;
            }
            op.status = TransferStatus::InProgress;
        }
    }

    /// Account for a chunk of transferred bytes and recompute the rolling
    /// speed estimate once per sample window.
    pub fn record_chunk(&self, episode_id: i64, destination: &TransferDestination, len: u64) {
        let mut ops = self.operations.write().unwrap();
        let Some(op) = ops.get_mut(&(episode_id, destination.clone())) else {
            return;
        };

        op.bytes_transferred += len;

        let now = Instant::now();
        let elapsed = now.duration_since(op.last_sample_at);
        if elapsed < self.sample_window {
            // Bootstrap with a cumulative average until the first full
            // sample window has passed
            if op.speed_bytes_per_sec == 0.0 {
                let since_start = now.duration_since(op.started_at).as_secs_f64();
                if since_start > 0.0 {
                    op.speed_bytes_per_sec = op.bytes_transferred as f64 / since_start;
                }
            }
        } else {
            let delta = op.bytes_transferred - op.sample_bytes;
            op.speed_bytes_per_sec = delta as f64 / elapsed.as_secs_f64();
            op.last_sample_at = now;
            op.sample_bytes = op.bytes_transferred;

            op.eta = match op.bytes_total {
                Some(total) if op.speed_bytes_per_sec > 0.0 => {
                    let remaining = total.saturating_sub(op.bytes_transferred);
                    Some(Duration::from_secs_f64(
                        remaining as f64 / op.speed_bytes_per_sec,
                    ))
                }
                _ => None,
            };
        }
    }

    /// Mark the operation completed.
    pub fn complete(&self, episode_id: i64, destination: &TransferDestination) {
        let mut ops = self.operations.write().unwrap();
        if let Some(op) = ops.get_mut(&(episode_id, destination.clone())) {
            if let Some(total) = op.bytes_total {
                op.bytes_transferred = total;
            }
            op.speed_bytes_per_sec = 0.0;
            op.eta = Some(Duration::ZERO);
            op.finish(TransferStatus::Completed);
        }
    }

    /// Mark the operation completed without any bytes having moved, for a
    /// download resolved against an already-present file.
    pub fn complete_existing(
        &self,
        episode_id: i64,
        destination: &TransferDestination,
        file_len: u64,
    ) {
        let mut ops = self.operations.write().unwrap();
        if let Some(op) = ops.get_mut(&(episode_id, destination.clone())) {
            op.bytes_total = Some(file_len);
            op.bytes_transferred = file_len;
            op.eta = Some(Duration::ZERO);
            op.finish(TransferStatus::Completed);
        }
    }

    /// Mark the operation failed with its classified cause.
    pub fn fail(&self, episode_id: i64, destination: &TransferDestination, cause: FailureCause) {
        let mut ops = self.operations.write().unwrap();
        if let Some(op) = ops.get_mut(&(episode_id, destination.clone())) {
            op.speed_bytes_per_sec = 0.0;
            op.eta = None;
            op.finish(TransferStatus::Failed(cause));
        }
    }

    /// Ask the engine owning a non-terminal operation to stop. Returns
    /// whether such an operation existed; the engine observes the request
    /// between chunks and finishes as `Failed(Cancelled)`.
    pub fn request_cancel(&self, episode_id: i64, destination: &TransferDestination) -> bool {
        let mut ops = self.operations.write().unwrap();
        match ops.get_mut(&(episode_id, destination.clone())) {
            Some(op) if !op.status.is_terminal() => {
                op.cancel_requested = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_cancel_requested(&self, episode_id: i64, destination: &TransferDestination) -> bool {
        let ops = self.operations.read().unwrap();
        ops.get(&(episode_id, destination.clone()))
            .map(|op| op.cancel_requested)
            .unwrap_or(false)
    }

    /// Snapshot the operation for the key, if one is known.
    pub fn get(
        &self,
        episode_id: i64,
        destination: &TransferDestination,
    ) -> Option<TransferSnapshot> {
        let ops = self.operations.read().unwrap();
        ops.get(&(episode_id, destination.clone())).map(|op| TransferSnapshot {
            episode_id,
            destination: destination.clone(),
            bytes_transferred: op.bytes_transferred,
            bytes_total: op.bytes_total,
            percentage: op.percentage(),
            speed_bytes_per_sec: op.speed_bytes_per_sec,
            eta_seconds: op.eta.map(|eta| eta.as_secs()),
            status: op.status.clone(),
        })
    }

}
