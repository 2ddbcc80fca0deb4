//! Transfer lifecycle manager.
//!
//! Owns the table of transfer records and every streaming task. Outgoing
//! transfers are crawled off the async runtime, offered to the peer, and
//! streamed once the remote side calls back in; incoming offers are parked
//! until the local user decides. Local stop/pause always lands on the record
//! first, remote notification is best-effort.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use drift_files::{ElementKind, Manifest, ManifestBuilder};
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::error::{CoreError, Result};
use crate::event::{EventBus, ServiceEvent};
use crate::peer::PeerRecord;
use crate::policy::{PathResolver, StoragePolicy};
use crate::rpc::{CallerIdentity, ChunkStream, PeerChannel, TransferOffer, CHUNK_STREAM_DEPTH};
use crate::transfer::receiver::ChunkReceiver;
use crate::transfer::record::{TransferDirection, TransferRecord, TransferSnapshot, TransferStatus};
use crate::transfer::sender::ChunkSender;

struct ManagerInner {
    config: ServiceConfig,
    events: EventBus,
    policy: Arc<dyn StoragePolicy>,
    resolver: Arc<dyn PathResolver>,
    local: CallerIdentity,
    next_id: AtomicU64,
    transfers: DashMap<u64, Arc<TransferRecord>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Registry and orchestrator for all transfers, both directions
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        events: EventBus,
        policy: Arc<dyn StoragePolicy>,
        resolver: Arc<dyn PathResolver>,
        local: CallerIdentity,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                events,
                policy,
                resolver,
                local,
                next_id: AtomicU64::new(1),
                transfers: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    // ---- local operations ------------------------------------------------

    /// Register an outgoing transfer and start crawling the inputs
    ///
    /// Returns the transfer id immediately; crawling and the offer RPC run
    /// in the background and drive the record through `Crawling` into
    /// `WaitingPermission` (or a failure state).
    pub fn send(&self, peer: Arc<PeerRecord>, paths: Vec<PathBuf>) -> Result<u64> {
        if peer.channel().is_none() {
            return Err(CoreError::invalid_state("peer has no open channel"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let record = TransferRecord::new(
            id,
            id,
            TransferDirection::Outgoing,
            peer,
            self.inner.config.transfer.compress,
            self.inner.config.transfer.progress_interval,
        );
        self.inner.transfers.insert(id, record.clone());
        self.inner.events.emit(ServiceEvent::TransferAdded(record.snapshot()));

        let manager = self.clone();
        self.track(tokio::spawn(async move {
            manager.crawl_and_offer(record, paths).await;
        }));
        Ok(id)
    }

    /// Accept or decline an incoming transfer waiting for permission
    pub async fn decide(&self, transfer_id: u64, accept: bool) -> Result<()> {
        let record = self.get(transfer_id).ok_or_else(|| {
            CoreError::invalid_state("unknown transfer")
        })?;
        if record.direction() != TransferDirection::Incoming
            || record.status() != TransferStatus::WaitingPermission
        {
            return Err(CoreError::invalid_state("transfer is not awaiting a decision"));
        }

        if !accept {
            return self.decline(&record).await;
        }

        let snapshot = record.snapshot();
        self.check_disk_space(snapshot.total_size)?;
        if self.inner.config.transfer.require_overwrite_confirmation {
            let existing = self.existing_targets(&snapshot.top_level_basenames);
            if !existing.is_empty() && !self.inner.policy.confirm_overwrite(&existing) {
                tracing::info!(transfer = transfer_id, "overwrite not confirmed, declining");
                self.decline(&record).await?;
                return Err(CoreError::Declined("overwrite not confirmed".into()));
            }
        }

        let channel = self.peer_channel(&record)?;
        let stream = channel.start_transfer(&self.inner.local, record.op_id()).await?;
        self.spawn_receiver(record, stream);
        Ok(())
    }

    /// Pause an active transfer locally
    ///
    /// Pausing is not signalled to the peer; the stalled stream exerts
    /// backpressure and the remote loop parks on its own side of the wire.
    pub fn pause(&self, transfer_id: u64) -> Result<()> {
        let record = self.active(transfer_id)?;
        record.gate().pause();
        Ok(())
    }

    /// Resume a locally paused transfer
    pub fn resume(&self, transfer_id: u64) -> Result<()> {
        let record = self.active(transfer_id)?;
        record.gate().resume();
        Ok(())
    }

    /// Stop or withdraw a transfer
    ///
    /// A pending outgoing offer is withdrawn, a pending incoming offer is
    /// declined, and an active stream is cancelled with the terminal status
    /// for our role. The peer is notified best-effort.
    pub async fn stop(&self, transfer_id: u64) -> Result<()> {
        let record = self.get(transfer_id).ok_or_else(|| {
            CoreError::invalid_state("unknown transfer")
        })?;

        match record.status() {
            TransferStatus::WaitingPermission => match record.direction() {
                TransferDirection::Outgoing => self.withdraw(&record).await,
                TransferDirection::Incoming => self.decline(&record).await,
            },
            status if status.is_active() || status == TransferStatus::Crawling => {
                let stopped = match record.direction() {
                    TransferDirection::Outgoing => TransferStatus::StoppedBySender,
                    TransferDirection::Incoming => TransferStatus::StoppedByReceiver,
                };
                record.set_status(stopped);
                record.gate().cancel();
                if let Ok(channel) = self.peer_channel(&record) {
                    if let Err(error) =
                        channel.stop_transfer(&self.inner.local, record.op_id(), false).await
                    {
                        tracing::debug!(transfer = transfer_id, %error, "stop notification failed");
                    }
                }
                self.emit_update(&record);
                Ok(())
            }
            _ => Err(CoreError::invalid_state("transfer is not stoppable")),
        }
    }

    /// Drop a terminal transfer from the table
    pub fn remove(&self, transfer_id: u64) -> Result<()> {
        let record = self.get(transfer_id).ok_or_else(|| {
            CoreError::invalid_state("unknown transfer")
        })?;
        if !record.status().is_terminal() {
            return Err(CoreError::invalid_state("transfer is still live"));
        }
        self.inner.transfers.remove(&transfer_id);
        self.inner.events.emit(ServiceEvent::TransferRemoved { transfer_id });
        Ok(())
    }

    /// Look up one transfer
    #[must_use]
    pub fn get(&self, transfer_id: u64) -> Option<Arc<TransferRecord>> {
        self.inner.transfers.get(&transfer_id).map(|r| r.clone())
    }

    /// Snapshots of every known transfer
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        let mut all: Vec<_> = self.inner.transfers.iter().map(|r| r.snapshot()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Cancel every live transfer and join all streaming tasks
    pub async fn shutdown(&self) {
        for record in self.inner.transfers.iter() {
            record.gate().cancel();
        }
        let tasks: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(error) = task.await {
                tracing::warn!(%error, "transfer task panicked during shutdown");
            }
        }
        tracing::debug!("transfer manager drained");
    }

    // ---- peer-driven operations -----------------------------------------

    /// An offer arrived from a peer; park it until the user decides
    pub fn handle_transfer_request(&self, peer: Arc<PeerRecord>, offer: TransferOffer) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let record = TransferRecord::new(
            id,
            offer.op_id,
            TransferDirection::Incoming,
            peer.clone(),
            offer.compress,
            self.inner.config.transfer.progress_interval,
        );
        record.set_sizing(
            offer.total_size,
            offer.element_count,
            offer.top_level_basenames,
            offer.single_name,
            offer.single_mime,
        );
        record.set_status(TransferStatus::WaitingPermission);
        self.inner.transfers.insert(id, record.clone());

        tracing::info!(transfer = id, peer = %peer.key(), "incoming transfer offer");
        self.inner.events.emit(ServiceEvent::TransferAdded(record.snapshot()));
        self.inner.events.emit(ServiceEvent::OpenTransferUi {
            peer_id: peer.instance_id().to_owned(),
            transfer_id: id,
        });
        id
    }

    /// The receiving peer accepted; start streaming chunks back
    pub fn handle_start_transfer(&self, peer: &PeerRecord, op_id: u64) -> Result<ChunkStream> {
        let record = self
            .find(peer, op_id, TransferDirection::Outgoing)
            .ok_or_else(|| CoreError::invalid_state("unknown operation"))?;
        if record.status() != TransferStatus::WaitingPermission {
            return Err(CoreError::invalid_state("operation is not awaiting permission"));
        }

        let (sink, stream) = tokio::sync::mpsc::channel(CHUNK_STREAM_DEPTH);
        let sender = ChunkSender::new(
            record.clone(),
            self.inner.config.transfer.clone(),
            self.inner.events.clone(),
        );
        let peer = record.peer().clone();
        self.track(tokio::spawn(async move {
            peer.transfer_begin();
            sender.run(sink).await;
            peer.transfer_end();
        }));
        Ok(stream)
    }

    /// The peer withdrew or declined a pending offer
    pub fn handle_cancel_request(&self, peer: &PeerRecord, op_id: u64) {
        let Some(record) = self.find_any_direction(peer, op_id) else {
            return;
        };
        if record.status() != TransferStatus::WaitingPermission {
            return;
        }
        let status = match record.direction() {
            // Our offer was declined by the receiving side.
            TransferDirection::Outgoing => TransferStatus::DeclinedByReceiver,
            // The offering side withdrew before we decided.
            TransferDirection::Incoming => TransferStatus::DeclinedBySender,
        };
        if record.set_status(status) {
            self.emit_update(&record);
        }
    }

    /// The peer stopped an active transfer
    pub fn handle_remote_stop(&self, peer: &PeerRecord, op_id: u64, error: bool) {
        let Some(record) = self.find_any_direction(peer, op_id) else {
            return;
        };
        let status = if error {
            TransferStatus::Failed
        } else {
            match record.direction() {
                TransferDirection::Outgoing => TransferStatus::StoppedByReceiver,
                TransferDirection::Incoming => TransferStatus::StoppedBySender,
            }
        };
        if record.set_status(status) {
            record.gate().cancel();
            self.emit_update(&record);
        }
    }

    // ---- internals -------------------------------------------------------

    async fn crawl_and_offer(&self, record: Arc<TransferRecord>, paths: Vec<PathBuf>) {
        if record.set_status(TransferStatus::Crawling) {
            self.emit_update(&record);
        }

        let crawl = self.inner.config.crawl.clone();
        let crawled = tokio::task::spawn_blocking(move || {
            ManifestBuilder::new(crawl.include_hidden)
                .with_max_depth(crawl.max_depth)
                .build(&paths)
        })
        .await;

        let manifest = match crawled {
            Ok(Ok(manifest)) => Arc::new(manifest),
            Ok(Err(error)) => {
                tracing::warn!(transfer = record.id(), %error, "crawl failed");
                record.set_error(error.to_string());
                record.set_status(if error.is_not_found() {
                    TransferStatus::FileNotFound
                } else {
                    TransferStatus::FailedUnrecoverable
                });
                self.emit_update(&record);
                return;
            }
            Err(error) => {
                record.set_error(error.to_string());
                record.set_status(TransferStatus::Failed);
                self.emit_update(&record);
                return;
            }
        };

        let offer = self.offer_for(&record, &manifest);
        record.set_sizing(
            offer.total_size,
            offer.element_count,
            offer.top_level_basenames.clone(),
            offer.single_name.clone(),
            offer.single_mime.clone(),
        );
        record.set_manifest(manifest);

        // Gate may already be cancelled if the user stopped during the crawl.
        if record.status().is_terminal() {
            return;
        }

        let channel = match self.peer_channel(&record) {
            Ok(channel) => channel,
            Err(error) => {
                record.set_error(error.to_string());
                record.set_status(TransferStatus::Failed);
                self.emit_update(&record);
                return;
            }
        };
        if let Err(error) = channel.request_transfer(offer).await {
            tracing::warn!(transfer = record.id(), %error, "offer delivery failed");
            record.set_error(error.to_string());
            record.set_status(TransferStatus::Failed);
            self.emit_update(&record);
            return;
        }

        record.set_status(TransferStatus::WaitingPermission);
        self.emit_update(&record);
    }

    fn offer_for(&self, record: &TransferRecord, manifest: &Manifest) -> TransferOffer {
        let top_level: Vec<&drift_files::ManifestEntry> = manifest
            .entries
            .iter()
            .filter(|e| !e.relative_path.contains('/'))
            .collect();
        let single = (top_level.len() == 1).then(|| top_level[0]);
        TransferOffer {
            op_id: record.op_id(),
            sender: self.inner.local.clone(),
            total_size: manifest.total_size(),
            element_count: manifest.element_count(),
            top_level_basenames: top_level.iter().map(|e| e.basename.clone()).collect(),
            single_name: single.map(|e| e.basename.clone()),
            single_mime: single.and_then(|e| {
                (e.kind == ElementKind::File).then(|| guess_mime(&e.basename).to_owned())
            }),
            compress: record.compress(),
        }
    }

    fn spawn_receiver(&self, record: Arc<TransferRecord>, stream: ChunkStream) {
        let receiver = ChunkReceiver::new(
            record.clone(),
            self.inner.config.transfer.clone(),
            self.inner.events.clone(),
            self.inner.resolver.clone(),
        );
        let peer = record.peer().clone();
        self.track(tokio::spawn(async move {
            peer.transfer_begin();
            receiver.run(stream).await;
            peer.transfer_end();
        }));
    }

    async fn decline(&self, record: &Arc<TransferRecord>) -> Result<()> {
        record.set_status(TransferStatus::DeclinedByReceiver);
        if let Ok(channel) = self.peer_channel(record) {
            if let Err(error) =
                channel.cancel_transfer_request(&self.inner.local, record.op_id()).await
            {
                tracing::debug!(transfer = record.id(), %error, "decline notification failed");
            }
        }
        self.emit_update(record);
        Ok(())
    }

    async fn withdraw(&self, record: &Arc<TransferRecord>) -> Result<()> {
        record.set_status(TransferStatus::DeclinedBySender);
        if let Ok(channel) = self.peer_channel(record) {
            if let Err(error) =
                channel.cancel_transfer_request(&self.inner.local, record.op_id()).await
            {
                tracing::debug!(transfer = record.id(), %error, "withdraw notification failed");
            }
        }
        self.emit_update(record);
        Ok(())
    }

    fn check_disk_space(&self, required: u64) -> Result<()> {
        let root = &self.inner.config.transfer.output_dir;
        let available = self.inner.policy.available_space(root).unwrap_or(u64::MAX);
        if available < required {
            return Err(CoreError::InsufficientSpace { required, available });
        }
        Ok(())
    }

    /// Top-level target paths that already exist under the output root
    fn existing_targets(&self, basenames: &[String]) -> Vec<PathBuf> {
        basenames
            .iter()
            .filter_map(|name| self.inner.resolver.resolve(name).ok())
            .filter(|path| path.exists())
            .collect()
    }

    fn peer_channel(&self, record: &TransferRecord) -> Result<Arc<dyn PeerChannel>> {
        record
            .peer()
            .channel()
            .ok_or_else(|| CoreError::invalid_state("peer has no open channel"))
    }

    fn active(&self, transfer_id: u64) -> Result<Arc<TransferRecord>> {
        let record = self.get(transfer_id).ok_or_else(|| {
            CoreError::invalid_state("unknown transfer")
        })?;
        if !record.status().is_active() {
            return Err(CoreError::invalid_state("transfer is not active"));
        }
        Ok(record)
    }

    fn find(&self, peer: &PeerRecord, op_id: u64, direction: TransferDirection) -> Option<Arc<TransferRecord>> {
        self.inner
            .transfers
            .iter()
            .find(|r| {
                r.op_id() == op_id
                    && r.direction() == direction
                    && r.peer().instance_id() == peer.instance_id()
            })
            .map(|r| r.clone())
    }

    fn find_any_direction(&self, peer: &PeerRecord, op_id: u64) -> Option<Arc<TransferRecord>> {
        self.inner
            .transfers
            .iter()
            .find(|r| r.op_id() == op_id && r.peer().instance_id() == peer.instance_id())
            .map(|r| r.clone())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn emit_update(&self, record: &TransferRecord) {
        self.inner.events.emit(ServiceEvent::TransferUpdated(record.snapshot()));
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("transfers", &self.inner.transfers.len())
            .finish()
    }
}

/// Crude extension-based MIME guess for the single-file offer summary
fn guess_mime(basename: &str) -> &'static str {
    let extension = basename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("txt") | Some("md") | Some("log") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
