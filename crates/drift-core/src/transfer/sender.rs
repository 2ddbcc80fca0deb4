//! Outgoing chunk streaming.
//!
//! The sender walks a crawled manifest in order and pushes one chunk per
//! marker entry and one or more per regular file into the bounded stream
//! sink. Backpressure from a slow receiver stalls the loop at `send`; pause
//! and stop are observed at the gate checkpoint before every chunk.

use std::sync::Arc;

use drift_files::{compress, is_executable, ChunkRecord, ElementKind, ManifestEntry};
use tokio::io::AsyncReadExt;

use crate::config::TransferConfig;
use crate::error::{CoreError, Result};
use crate::event::{EventBus, ServiceEvent};
use crate::rpc::{ChunkSink, RpcError};
use crate::sync::GateResolution;
use crate::transfer::record::{TransferRecord, TransferStatus};

/// Streams one outgoing transfer into a chunk sink
pub(crate) struct ChunkSender {
    record: Arc<TransferRecord>,
    config: TransferConfig,
    events: EventBus,
}

impl ChunkSender {
    pub(crate) fn new(record: Arc<TransferRecord>, config: TransferConfig, events: EventBus) -> Self {
        Self { record, config, events }
    }

    /// Stream the whole manifest, driving the record's status
    pub(crate) async fn run(self, sink: ChunkSink) {
        if self.record.set_status(TransferStatus::Transferring) {
            self.emit_update();
        }

        let outcome = self.stream(&sink).await;
        match outcome {
            Ok(true) => {
                // Force the 100% notification past the throttle.
                self.record.add_bytes(0, true);
                self.record.set_status(TransferStatus::Finished);
                tracing::info!(transfer = self.record.id(), "send finished");
            }
            Ok(false) => {
                // Stopped or cancelled; whoever pulled the gate already set
                // the terminal status.
                tracing::debug!(transfer = self.record.id(), status = %self.record.status(), "send interrupted");
            }
            Err(error) => {
                tracing::warn!(transfer = self.record.id(), %error, "send failed");
                let _ = sink.send(Err(RpcError::Remote(error.to_string()))).await;
                self.record.set_error(error.to_string());
                self.record.set_status(if error.is_permanent() {
                    TransferStatus::FailedUnrecoverable
                } else {
                    TransferStatus::Failed
                });
            }
        }
        self.emit_update();
    }

    /// Send every manifest entry; `Ok(false)` means stopped mid-stream
    async fn stream(&self, sink: &ChunkSink) -> Result<bool> {
        let manifest = self
            .record
            .manifest()
            .ok_or_else(|| CoreError::invalid_state("transfer started before crawl finished"))?;

        for entry in &manifest.entries {
            match entry.kind {
                ElementKind::Directory => {
                    let chunk = ChunkRecord::directory(
                        entry.relative_path.clone(),
                        self.config.directory_mode.to_chmod(),
                    );
                    if !self.send_chunk(sink, chunk).await? {
                        return Ok(false);
                    }
                }
                ElementKind::Symlink => {
                    if !self.send_symlink(sink, entry).await? {
                        return Ok(false);
                    }
                }
                ElementKind::File => {
                    if !self.send_file(sink, entry).await? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn send_symlink(&self, sink: &ChunkSink, entry: &ManifestEntry) -> Result<bool> {
        let target = tokio::fs::read_link(&entry.absolute_path).await?;
        let target = target.to_string_lossy().into_owned();
        let chunk = ChunkRecord::symlink(
            entry.relative_path.clone(),
            target,
            self.config.file_mode.to_chmod(),
        );
        self.send_chunk(sink, chunk).await
    }

    /// Split one regular file into payload blocks
    ///
    /// The first block classifies the file as executable or plain, which
    /// picks the mode stamped on every block of that file. Empty files still
    /// produce a single empty chunk so the receiver materializes them.
    async fn send_file(&self, sink: &ChunkSink, entry: &ManifestEntry) -> Result<bool> {
        let mut file = tokio::fs::File::open(&entry.absolute_path).await?;
        let mut first = true;
        let mut mode = self.config.file_mode.to_chmod();

        loop {
            let mut block = vec![0u8; self.config.chunk_size];
            let mut filled = 0usize;
            while filled < block.len() {
                let read = file.read(&mut block[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
            block.truncate(filled);

            if filled == 0 && !first {
                return Ok(true);
            }
            if first {
                if is_executable(&entry.basename, &block) {
                    mode = self.config.executable_mode.to_chmod();
                }
                first = false;
            }

            let raw_len = block.len() as u64;
            let last = filled < self.config.chunk_size;
            let payload = if self.record.compress() {
                compress(&block, self.config.compression_level)?
            } else {
                block
            };
            let chunk = ChunkRecord::file_block(entry.relative_path.clone(), payload, mode);
            if !self.send_chunk(sink, chunk).await? {
                return Ok(false);
            }
            if self.record.add_bytes(raw_len, false) {
                self.emit_update();
            }
            if last {
                return Ok(true);
            }
        }
    }

    /// Gate-checked send; `Ok(false)` means the transfer was stopped, either
    /// at the gate or because the receiving side hung up
    async fn send_chunk(&self, sink: &ChunkSink, chunk: ChunkRecord) -> Result<bool> {
        match self.checkpoint().await {
            GateResolution::Resumed => {}
            GateResolution::Cancelled => return Ok(false),
        }
        if sink.send(Ok(chunk)).await.is_err() {
            tracing::debug!(transfer = self.record.id(), "receiver hung up");
            self.record.set_status(TransferStatus::StoppedByReceiver);
            return Ok(false);
        }
        Ok(true)
    }

    /// Pass the pause gate, surfacing the paused state while parked
    async fn checkpoint(&self) -> GateResolution {
        if self.record.gate().is_paused() {
            if self.record.set_status(TransferStatus::Paused) {
                self.emit_update();
            }
            let resolution = self.record.gate().checkpoint().await;
            if resolution == GateResolution::Resumed && self.record.set_status(TransferStatus::Transferring)
            {
                self.emit_update();
            }
            return resolution;
        }
        self.record.gate().checkpoint().await
    }

    fn emit_update(&self) {
        self.events.emit(ServiceEvent::TransferUpdated(self.record.snapshot()));
    }
}
