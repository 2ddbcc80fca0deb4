//! Per-peer connection task.
//!
//! One task per discovered peer owns that peer's whole connection lifecycle:
//! certificate bootstrap, channel setup, duplex confirmation, liveness, and
//! teardown. Generation 1 peers are polled; generation 2 peers are watched
//! through channel-state transitions and the task sleeps in between. All
//! waits go through the record's [`StopSignal`], so shutdown and discovery
//! nudges interrupt any backoff.
//!
//! [`StopSignal`]: crate::sync::StopSignal

use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::event::{EventBus, ServiceEvent};
use crate::peer::record::{ConnectionStatus, PeerRecord};
use crate::peer::ProtocolGeneration;
use crate::rpc::{CallerIdentity, ChannelState, PeerChannel, PeerConnector};

/// How a connection session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Tear down and run another session against the same announcement
    Retry,
    /// Exit the task; a fresh announcement spawns a new one
    Halt,
}

/// Drives the connection lifecycle for one peer record
pub(crate) struct ConnectionHandler {
    record: Arc<PeerRecord>,
    connector: Arc<dyn PeerConnector>,
    config: ConnectionConfig,
    events: EventBus,
    local: CallerIdentity,
}

impl ConnectionHandler {
    pub(crate) fn new(
        record: Arc<PeerRecord>,
        connector: Arc<dyn PeerConnector>,
        config: ConnectionConfig,
        events: EventBus,
        local: CallerIdentity,
    ) -> Self {
        Self { record, connector, config, events, local }
    }

    /// Task body; returns only when the peer is stopped, withdrawn, or its
    /// generation-1 session is lost
    pub(crate) async fn run(self) {
        tracing::info!(
            peer = %self.record.key(),
            generation = %self.record.generation(),
            "connection task started"
        );

        loop {
            if self.record.stop().is_stopped() || !self.record.is_announced() {
                break;
            }
            let end = match self.record.generation() {
                ProtocolGeneration::V1 => self.session_v1().await,
                ProtocolGeneration::V2 => self.session_v2().await,
            };
            self.teardown();
            if end == SessionEnd::Halt {
                break;
            }
        }

        tracing::debug!(peer = %self.record.key(), "connection task exited");
    }

    /// Drop the channel and return the record to offline, invisible
    fn teardown(&self) {
        self.record.set_channel(None);
        let status_changed = self.record.set_status(ConnectionStatus::Offline);
        let visibility_changed = self.record.set_visible(false);
        if status_changed || visibility_changed {
            self.emit_update();
        }
    }

    fn emit_update(&self) {
        self.events.emit(ServiceEvent::PeerUpdated(self.record.snapshot()));
    }

    fn update_status(&self, status: ConnectionStatus) {
        if self.record.set_status(status) {
            self.emit_update();
        }
    }

    /// Interruptible backoff; `true` means the task must halt
    async fn backoff(&self, duration: std::time::Duration) -> bool {
        self.record.stop().sleep(duration).await;
        self.record.stop().is_stopped() || !self.record.is_announced()
    }

    // ---- generation 1 ----------------------------------------------------

    async fn session_v1(&self) -> SessionEnd {
        self.update_status(ConnectionStatus::Registration);

        let Some(certificate) = self.register_v1().await else {
            tracing::warn!(peer = %self.record.key(), "registration failed, backing off");
            self.update_status(ConnectionStatus::Unreachable);
            if self.backoff(self.config.v1_retry_backoff).await {
                return SessionEnd::Halt;
            }
            return SessionEnd::Retry;
        };

        let endpoint = self.record.endpoint();
        let channel = match self.connector.open_channel(&endpoint, &certificate).await {
            Ok(channel) => channel,
            Err(error) => {
                tracing::warn!(peer = %self.record.key(), %error, "channel setup failed");
                self.update_status(ConnectionStatus::Unreachable);
                if self.backoff(self.config.v1_retry_backoff).await {
                    return SessionEnd::Halt;
                }
                return SessionEnd::Retry;
            }
        };
        self.record.set_channel(Some(channel.clone()));

        self.update_status(ConnectionStatus::AwaitingDuplex);
        if !self.await_duplex_v1(channel.as_ref()).await {
            if self.record.stop().is_stopped() || !self.record.is_announced() {
                return SessionEnd::Halt;
            }
            tracing::warn!(peer = %self.record.key(), "duplex never confirmed, rebuilding channel");
            self.update_status(ConnectionStatus::Unreachable);
            if self.backoff(self.config.v1_retry_backoff).await {
                return SessionEnd::Halt;
            }
            return SessionEnd::Retry;
        }

        // Remote details are best-effort on generation 1; old peers answer
        // pings but not the info calls.
        self.fetch_remote_details(channel.as_ref(), false).await;

        self.update_status(ConnectionStatus::Online);
        if self.record.set_visible(true) {
            self.emit_update();
        }
        tracing::info!(peer = %self.record.key(), "peer online");

        self.ping_loop(channel.as_ref()).await
    }

    /// Bounded datagram registration: a few short attempts per cycle
    async fn register_v1(&self) -> Option<Vec<u8>> {
        let endpoint = self.record.endpoint();
        for attempt in 1..=self.config.v1_registration_attempts {
            if self.record.stop().is_stopped() || !self.record.is_announced() {
                return None;
            }
            let request = self.connector.fetch_certificate_v1(&endpoint);
            match tokio::time::timeout(self.config.v1_registration_timeout, request).await {
                Ok(Ok(certificate)) => return Some(certificate),
                Ok(Err(error)) => {
                    tracing::debug!(peer = %self.record.key(), attempt, %error, "registration attempt failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %self.record.key(), attempt, "registration attempt timed out");
                }
            }
        }
        None
    }

    /// Probe until the peer confirms it can reach us back
    ///
    /// Returns `false` after the configured failure budget, or when stopped.
    async fn await_duplex_v1(&self, channel: &dyn PeerChannel) -> bool {
        let mut failures = 0u32;
        while failures < self.config.duplex_max_failures {
            if self.record.stop().sleep(self.config.duplex_ping_interval).await
                && self.record.stop().is_stopped()
            {
                return false;
            }
            if !self.record.is_announced() {
                return false;
            }
            match channel.check_duplex(&self.local).await {
                Ok(true) => return true,
                Ok(false) => failures += 1,
                Err(error) => {
                    tracing::debug!(peer = %self.record.key(), %error, "duplex probe failed");
                    failures += 1;
                }
            }
        }
        false
    }

    /// Keepalive loop; quiet while transfers run
    async fn ping_loop(&self, channel: &dyn PeerChannel) -> SessionEnd {
        loop {
            if self.record.stop().sleep(self.config.ping_interval).await
                && self.record.stop().is_stopped()
            {
                return SessionEnd::Halt;
            }
            // A withdrawn peer with transfers still running rides out the
            // flap; the session ends once the last transfer drains.
            if !self.record.is_announced() && !self.record.is_busy() {
                return SessionEnd::Halt;
            }
            if self.record.is_busy() {
                continue;
            }
            if let Err(error) = channel.ping(&self.local).await {
                tracing::info!(peer = %self.record.key(), %error, "peer lost");
                return SessionEnd::Halt;
            }
        }
    }

    // ---- generation 2 ----------------------------------------------------

    async fn session_v2(&self) -> SessionEnd {
        self.update_status(ConnectionStatus::Registration);

        let endpoint = self.record.endpoint();
        let certificate = match self.connector.fetch_certificate_v2(&endpoint, &self.local).await {
            Ok(certificate) => certificate,
            Err(error) => {
                tracing::warn!(peer = %self.record.key(), %error, "registration failed, backing off");
                self.update_status(ConnectionStatus::Unreachable);
                if self.backoff(self.config.v2_retry_backoff).await {
                    return SessionEnd::Halt;
                }
                return SessionEnd::Retry;
            }
        };

        let channel = match self.connector.open_channel(&endpoint, &certificate).await {
            Ok(channel) => channel,
            Err(error) => {
                tracing::warn!(peer = %self.record.key(), %error, "channel setup failed");
                self.update_status(ConnectionStatus::Unreachable);
                if self.backoff(self.config.v2_retry_backoff).await {
                    return SessionEnd::Halt;
                }
                return SessionEnd::Retry;
            }
        };
        self.record.set_channel(Some(channel.clone()));

        self.drive_v2(channel.as_ref()).await
    }

    async fn drive_v2(&self, channel: &dyn PeerChannel) -> SessionEnd {
        self.update_status(ConnectionStatus::AwaitingDuplex);
        let duplex =
            tokio::time::timeout(self.config.duplex_wait_timeout, channel.wait_for_duplex(&self.local))
                .await;
        match duplex {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) | Ok(Err(_)) | Err(_) => {
                tracing::warn!(peer = %self.record.key(), "duplex wait failed, backing off");
                self.update_status(ConnectionStatus::Unreachable);
                if self.backoff(self.config.v2_retry_backoff).await {
                    return SessionEnd::Halt;
                }
                return SessionEnd::Retry;
            }
        }

        // Display names are part of the generation-2 handshake proper.
        if !self.fetch_remote_details(channel, true).await {
            self.update_status(ConnectionStatus::Unreachable);
            if self.backoff(self.config.v2_retry_backoff).await {
                return SessionEnd::Halt;
            }
            return SessionEnd::Retry;
        }

        self.update_status(ConnectionStatus::Online);
        if self.record.set_visible(true) {
            self.emit_update();
        }
        tracing::info!(peer = %self.record.key(), "peer online");

        // Idle until the channel degrades, discovery withdraws the peer, or
        // shutdown stops us. A withdrawn peer with transfers still running
        // rides out the flap, so the periodic tick re-checks after the last
        // transfer drains.
        let mut states = channel.state_changes();
        loop {
            if self.record.stop().is_stopped()
                || (!self.record.is_announced() && !self.record.is_busy())
            {
                return SessionEnd::Halt;
            }
            if *states.borrow_and_update() != ChannelState::Ready {
                tracing::info!(peer = %self.record.key(), "channel lost, reconnecting");
                return SessionEnd::Retry;
            }
            tokio::select! {
                () = self.record.stop().wait() => {}
                () = tokio::time::sleep(self.config.ping_interval) => {}
                changed = states.changed() => {
                    if changed.is_err() {
                        tracing::info!(peer = %self.record.key(), "channel closed, reconnecting");
                        return SessionEnd::Retry;
                    }
                }
            }
        }
    }

    // ---- shared ----------------------------------------------------------

    /// Fetch display names and avatar; `required` fails the session when the
    /// info call errors
    async fn fetch_remote_details(&self, channel: &dyn PeerChannel, required: bool) -> bool {
        match channel.machine_info(&self.local).await {
            Ok(info) => {
                self.record.set_display_names(info.display_name, info.short_name);
            }
            Err(error) => {
                if required {
                    tracing::warn!(peer = %self.record.key(), %error, "machine info fetch failed");
                    return false;
                }
                tracing::debug!(peer = %self.record.key(), %error, "peer does not serve machine info");
            }
        }
        match channel.machine_avatar(&self.local).await {
            Ok(avatar) if !avatar.is_empty() => self.record.set_avatar(Some(avatar)),
            Ok(_) => self.record.set_avatar(None),
            Err(error) => {
                tracing::debug!(peer = %self.record.key(), %error, "avatar fetch failed");
            }
        }
        true
    }
}
