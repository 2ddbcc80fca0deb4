//! Shared per-transfer state.
//!
//! A [`TransferRecord`] is the handle both the manager and the streaming
//! task hold for one operation. Status, sizing, and progress live behind a
//! single mutex; the pause gate is the only control path into a running
//! stream loop.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drift_files::Manifest;

use crate::peer::PeerRecord;
use crate::sync::PauseGate;
use crate::transfer::estimator::SpeedEstimator;

/// Which side of the wire this record plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We crawl and stream chunks out
    Outgoing,
    /// We receive and materialize chunks
    Incoming,
}

/// Lifecycle state of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Registered, nothing started yet
    Init,
    /// Crawling the source tree to size the operation
    Crawling,
    /// Offer delivered, waiting for the receiver's decision
    WaitingPermission,
    /// Sender withdrew the offer before a decision
    DeclinedBySender,
    /// Receiver refused the offer
    DeclinedByReceiver,
    /// Chunks are flowing
    Transferring,
    /// Stream loop is parked at the pause gate
    Paused,
    /// Sender stopped an active transfer
    StoppedBySender,
    /// Receiver stopped an active transfer
    StoppedByReceiver,
    /// The offered path vanished before the crawl could size it
    FileNotFound,
    /// Failed; retrying the operation may succeed
    Failed,
    /// Failed with no prospect of success on retry
    FailedUnrecoverable,
    /// All elements arrived intact
    Finished,
    /// Completed, but some elements were skipped or damaged
    FinishedWithWarnings,
}

impl TransferStatus {
    /// True when no further state change is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::DeclinedBySender
                | Self::DeclinedByReceiver
                | Self::StoppedBySender
                | Self::StoppedByReceiver
                | Self::FileNotFound
                | Self::Failed
                | Self::FailedUnrecoverable
                | Self::Finished
                | Self::FinishedWithWarnings
        )
    }

    /// True while a stream loop exists for the transfer
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Transferring | Self::Paused)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Init => "init",
            Self::Crawling => "crawling",
            Self::WaitingPermission => "waiting for permission",
            Self::DeclinedBySender => "declined by sender",
            Self::DeclinedByReceiver => "declined by receiver",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::StoppedBySender => "stopped by sender",
            Self::StoppedByReceiver => "stopped by receiver",
            Self::FileNotFound => "file not found",
            Self::Failed => "failed",
            Self::FailedUnrecoverable => "failed permanently",
            Self::Finished => "finished",
            Self::FinishedWithWarnings => "finished with warnings",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
struct Sizing {
    total_size: u64,
    element_count: u64,
    top_level_basenames: Vec<String>,
    single_name: Option<String>,
    single_mime: Option<String>,
}

struct TransferState {
    status: TransferStatus,
    sizing: Sizing,
    manifest: Option<Arc<Manifest>>,
    bytes_done: u64,
    last_progress: Option<Instant>,
    estimator: SpeedEstimator,
    speed_bps: Option<f64>,
    eta_seconds: Option<f64>,
    error: Option<String>,
}

/// Read-only view of a transfer for event consumers
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    /// Local registry id
    pub id: u64,
    /// Wire operation id quoted in peer RPCs
    pub op_id: u64,
    /// Hostname of the remote side
    pub peer_hostname: String,
    /// Direction from our point of view
    pub direction: TransferDirection,
    /// Current lifecycle state
    pub status: TransferStatus,
    /// Total payload bytes
    pub total_size: u64,
    /// Total manifest entries
    pub element_count: u64,
    /// Bytes transferred so far
    pub bytes_done: u64,
    /// Completion ratio in `0.0..=1.0`
    pub progress: f64,
    /// Smoothed throughput in bytes per second, once measurable
    pub speed_bps: Option<f64>,
    /// Smoothed seconds remaining, once measurable
    pub eta_seconds: Option<f64>,
    /// Top-level names offered
    pub top_level_basenames: Vec<String>,
    /// Name of the single element for one-item transfers
    pub single_name: Option<String>,
    /// MIME type of the single element for one-item transfers
    pub single_mime: Option<String>,
    /// Terminal error description, if the transfer failed
    pub error: Option<String>,
}

/// Shared state for one transfer operation
///
/// State sits behind a std mutex: every critical section is a short
/// synchronous read or write, and no guard is ever held across an await.
pub struct TransferRecord {
    id: u64,
    op_id: u64,
    direction: TransferDirection,
    peer: Arc<PeerRecord>,
    compress: bool,
    progress_interval: Duration,
    gate: PauseGate,
    state: Mutex<TransferState>,
}

impl TransferRecord {
    /// Create a record in [`TransferStatus::Init`]
    #[must_use]
    pub fn new(
        id: u64,
        op_id: u64,
        direction: TransferDirection,
        peer: Arc<PeerRecord>,
        compress: bool,
        progress_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            op_id,
            direction,
            peer,
            compress,
            progress_interval,
            gate: PauseGate::new(),
            state: Mutex::new(TransferState {
                status: TransferStatus::Init,
                sizing: Sizing::default(),
                manifest: None,
                bytes_done: 0,
                last_progress: None,
                estimator: SpeedEstimator::new(),
                speed_bps: None,
                eta_seconds: None,
                error: None,
            }),
        })
    }

    /// Local registry id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wire operation id
    #[must_use]
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    /// Direction from our point of view
    #[must_use]
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Remote side of this transfer
    #[must_use]
    pub fn peer(&self) -> &Arc<PeerRecord> {
        &self.peer
    }

    /// Whether chunk payloads are compressed on the wire
    #[must_use]
    pub fn compress(&self) -> bool {
        self.compress
    }

    /// Pause/stop gate observed by the stream loop
    #[must_use]
    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    /// Current lifecycle state
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.state.lock().unwrap().status
    }

    /// Move to a new lifecycle state
    ///
    /// Terminal states stick: once a transfer is finished, declined,
    /// stopped, or failed, no later transition is recorded. Returns whether
    /// the state changed.
    pub fn set_status(&self, status: TransferStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status == status || state.status.is_terminal() {
            return false;
        }
        tracing::debug!(transfer = self.id, from = %state.status, to = %status, "transfer status change");
        state.status = status;
        true
    }

    /// Record a terminal error description alongside a failure status
    pub fn set_error(&self, error: impl Into<String>) {
        self.state.lock().unwrap().error = Some(error.into());
    }

    /// Fill in sizing from a crawl or an incoming offer
    pub fn set_sizing(
        &self,
        total_size: u64,
        element_count: u64,
        top_level_basenames: Vec<String>,
        single_name: Option<String>,
        single_mime: Option<String>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.sizing = Sizing {
            total_size,
            element_count,
            top_level_basenames,
            single_name,
            single_mime,
        };
    }

    /// Attach the crawled manifest on the sending side
    pub fn set_manifest(&self, manifest: Arc<Manifest>) {
        self.state.lock().unwrap().manifest = Some(manifest);
    }

    /// The crawled manifest, once the crawl has finished
    #[must_use]
    pub fn manifest(&self) -> Option<Arc<Manifest>> {
        self.state.lock().unwrap().manifest.clone()
    }

    /// Total payload bytes, once sized
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.state.lock().unwrap().sizing.total_size
    }

    /// Accumulate transferred bytes and refresh the speed estimate
    ///
    /// Progress is monotonic. Returns `true` when enough wall-clock time has
    /// passed since the last notification that an update should be emitted;
    /// `force` overrides the throttle for the final 100% notification.
    pub fn add_bytes(&self, bytes: u64, force: bool) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.bytes_done = state.bytes_done.saturating_add(bytes);
        let bytes_done = state.bytes_done;
        state.estimator.record(now, bytes_done);

        let due = match state.last_progress {
            Some(last) => now.duration_since(last) >= self.progress_interval,
            None => true,
        };
        if !due && !force {
            return false;
        }

        state.last_progress = Some(now);
        state.speed_bps = state.estimator.speed();
        let remaining = state.sizing.total_size.saturating_sub(state.bytes_done);
        state.eta_seconds = state.estimator.estimate_remaining(remaining);
        true
    }

    /// Snapshot for event consumers
    #[must_use]
    pub fn snapshot(&self) -> TransferSnapshot {
        let state = self.state.lock().unwrap();
        let progress = if state.sizing.total_size == 0 {
            if state.status == TransferStatus::Finished { 1.0 } else { 0.0 }
        } else {
            (state.bytes_done as f64 / state.sizing.total_size as f64).min(1.0)
        };
        TransferSnapshot {
            id: self.id,
            op_id: self.op_id,
            peer_hostname: self.peer.hostname().to_owned(),
            direction: self.direction,
            status: state.status,
            total_size: state.sizing.total_size,
            element_count: state.sizing.element_count,
            bytes_done: state.bytes_done,
            progress,
            speed_bps: state.speed_bps,
            eta_seconds: state.eta_seconds,
            top_level_basenames: state.sizing.top_level_basenames.clone(),
            single_name: state.sizing.single_name.clone(),
            single_mime: state.sizing.single_mime.clone(),
            error: state.error.clone(),
        }
    }
}

impl fmt::Debug for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRecord")
            .field("id", &self.id)
            .field("op_id", &self.op_id)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
