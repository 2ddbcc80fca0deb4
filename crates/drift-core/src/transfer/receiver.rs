//! Incoming chunk materialization.
//!
//! The receiver consumes a chunk stream in manifest order and materializes
//! each element under the configured output root. A change of relative path
//! marks the start of the next element; regular files stay open across
//! consecutive blocks and get their permissions stamped at close. After the
//! last chunk a short grace period absorbs a stop that raced the end of the
//! stream before the transfer is finalized.

use std::path::PathBuf;
use std::sync::Arc;

use drift_files::{decompress, ChunkRecord, ElementKind, UnixMode};
use tokio::io::AsyncWriteExt;

use crate::config::TransferConfig;
use crate::error::{CoreError, Result};
use crate::event::{EventBus, ServiceEvent};
use crate::policy::PathResolver;
use crate::rpc::ChunkStream;
use crate::sync::GateResolution;
use crate::transfer::record::{TransferRecord, TransferStatus};

/// One regular file being assembled across consecutive chunks
struct OpenFile {
    path: PathBuf,
    file: tokio::fs::File,
    relative: String,
    mode: u32,
}

/// Materializes one incoming transfer from a chunk stream
pub(crate) struct ChunkReceiver {
    record: Arc<TransferRecord>,
    config: TransferConfig,
    events: EventBus,
    resolver: Arc<dyn PathResolver>,
    warnings: u32,
}

impl ChunkReceiver {
    pub(crate) fn new(
        record: Arc<TransferRecord>,
        config: TransferConfig,
        events: EventBus,
        resolver: Arc<dyn PathResolver>,
    ) -> Self {
        Self { record, config, events, resolver, warnings: 0 }
    }

    /// Consume the whole stream, driving the record's status
    pub(crate) async fn run(mut self, mut stream: ChunkStream) {
        if self.record.set_status(TransferStatus::Transferring) {
            self.emit_update();
        }

        match self.consume(&mut stream).await {
            Ok(true) => {
                // Grace window: a stop that raced the last chunk still wins,
                // because terminal states stick.
                tokio::time::sleep(self.config.finalize_grace).await;
                self.record.add_bytes(0, true);
                let status = if self.warnings > 0 {
                    TransferStatus::FinishedWithWarnings
                } else {
                    TransferStatus::Finished
                };
                if self.record.set_status(status) {
                    tracing::info!(
                        transfer = self.record.id(),
                        warnings = self.warnings,
                        "receive finished"
                    );
                }
            }
            Ok(false) => {
                tracing::debug!(transfer = self.record.id(), status = %self.record.status(), "receive interrupted");
            }
            Err(error) => {
                tracing::warn!(transfer = self.record.id(), %error, "receive failed");
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

    /// Materialize every chunk; `Ok(false)` means stopped mid-stream
    async fn consume(&mut self, stream: &mut ChunkStream) -> Result<bool> {
        let mut open: Option<OpenFile> = None;

        while let Some(item) = stream.recv().await {
            match self.checkpoint().await {
                GateResolution::Resumed => {}
                GateResolution::Cancelled => {
                    if let Some(open) = open.take() {
                        self.close_file(open).await?;
                    }
                    return Ok(false);
                }
            }

            let chunk = item.map_err(CoreError::Rpc)?;

            let starts_new_element =
                open.as_ref().is_none_or(|o| o.relative != chunk.relative_path);
            if starts_new_element {
                if let Some(open) = open.take() {
                    self.close_file(open).await?;
                }
                match chunk.kind {
                    ElementKind::Directory => self.materialize_directory(&chunk).await?,
                    ElementKind::Symlink => self.materialize_symlink(&chunk).await?,
                    ElementKind::File => open = Some(self.open_file(&chunk).await?),
                }
            }

            if chunk.kind == ElementKind::File {
                let file = open
                    .as_mut()
                    .ok_or_else(|| CoreError::invalid_state("file chunk without open file"))?;
                let payload = if self.record.compress() {
                    decompress(&chunk.payload, self.config.chunk_size)?
                } else {
                    chunk.payload
                };
                file.file.write_all(&payload).await?;
                if self.record.add_bytes(payload.len() as u64, false) {
                    self.emit_update();
                }
            }
        }

        if let Some(open) = open.take() {
            self.close_file(open).await?;
        }
        Ok(true)
    }

    async fn materialize_directory(&mut self, chunk: &ChunkRecord) -> Result<()> {
        let path = self.resolver.resolve(&chunk.relative_path)?;
        tokio::fs::create_dir_all(&path).await?;
        self.apply_mode(&path, chunk.mode).await;
        Ok(())
    }

    async fn materialize_symlink(&mut self, chunk: &ChunkRecord) -> Result<()> {
        let path = self.resolver.resolve(&chunk.relative_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let Some(target) = chunk.symlink_target.as_deref() else {
            return Err(CoreError::MalformedPath(chunk.relative_path.clone()));
        };

        #[cfg(unix)]
        {
            // Replace a leftover link rather than failing the stream.
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                let _ = tokio::fs::remove_file(&path).await;
            }
            tokio::fs::symlink(target, &path).await?;
        }
        #[cfg(not(unix))]
        {
            tracing::warn!(path = %path.display(), target, "symlinks unsupported here, skipping");
            self.warnings += 1;
        }
        Ok(())
    }

    async fn open_file(&mut self, chunk: &ChunkRecord) -> Result<OpenFile> {
        let path = self.resolver.resolve(&chunk.relative_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(OpenFile {
            path,
            file,
            relative: chunk.relative_path.clone(),
            mode: chunk.mode,
        })
    }

    async fn close_file(&mut self, mut open: OpenFile) -> Result<()> {
        open.file.flush().await?;
        drop(open.file);
        self.apply_mode(&open.path, open.mode).await;
        Ok(())
    }

    /// Stamp a chmod-style decimal mode onto a materialized path
    ///
    /// An unparseable mode falls back to the configured default and counts
    /// as a warning rather than failing the transfer.
    async fn apply_mode(&mut self, path: &std::path::Path, mode: u32) {
        let mode = match UnixMode::from_chmod(mode) {
            Some(mode) => mode,
            None => {
                tracing::warn!(path = %path.display(), mode, "unparseable mode, using default");
                self.warnings += 1;
                self.config.file_mode
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(u32::from(mode.bits()));
            if let Err(error) = tokio::fs::set_permissions(path, permissions).await {
                tracing::warn!(path = %path.display(), %error, "failed to set permissions");
                self.warnings += 1;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
        }
    }

    /// Pass the pause gate, surfacing the paused state while parked
    async fn checkpoint(&self) -> GateResolution {
        if self.record.gate().is_paused() {
            if self.record.set_status(TransferStatus::Paused) {
                self.emit_update();
            }
            let resolution = self.record.gate().checkpoint().await;
            if resolution == GateResolution::Resumed
                && self.record.set_status(TransferStatus::Transferring)
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
