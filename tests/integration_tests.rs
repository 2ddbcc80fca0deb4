//! End-to-end tests over the loopback transport.
//!
//! Each test wires real [`Service`] instances together with the in-process
//! loopback network and drives the full path: discovery announcement, the
//! connection state machine, offer and permission, chunk streaming, and
//! materialization on the receiving filesystem.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drift_core::{
    CoreError, PeerSnapshot, Service, ServiceEvent, TransferDirection, TransferStatus,
};
use drift_integration_tests::{
    auto_accept, identity, incoming_id, online_pair, pause_on_first_transferring, payload,
    snapshot, test_config, wait_for, wait_status,
};

// ============================================================================
// Peer lifecycle
// ============================================================================

/// Two services on one network discover each other and come online.
#[tokio::test]
async fn test_peers_discover_each_other() {
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;

    let peers = sender.visible_peers();
    assert_eq!(peers.len(), 1);
    let beta = &peers[0];
    assert_eq!(beta.key.hostname, "beta");
    assert!(beta.status.is_online());
    assert!(beta.visible);
    // Display metadata is fetched over the channel once the link is duplex.
    assert_eq!(beta.display_name, "beta machine");
    assert_eq!(sender.peer_count(), 1);
    assert_eq!(receiver.peer_count(), 1);

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// A withdrawn peer is reaped and disappears from the registry.
#[tokio::test]
async fn test_withdrawn_peer_disappears() {
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;

    network.leave("beta");
    wait_for("the withdrawn peer to be reaped", || {
        sender.peer_count() == 0 && sender.visible_peers().is_empty()
    })
    .await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// A failed channel tears the session down and the handler reconnects.
#[tokio::test]
async fn test_channel_failure_triggers_reconnect() {
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;

    let seen: Arc<Mutex<Vec<PeerSnapshot>>> = Arc::default();
    let sink = seen.clone();
    sender.subscribe(Arc::new(move |event| {
        if let ServiceEvent::PeerUpdated(s) = event {
            sink.lock().unwrap().push(s.clone());
        }
    }));

    network.break_channels_to("beta");
    wait_for("an offline notification followed by a reconnect", || {
        let seen = seen.lock().unwrap();
        match seen.iter().position(|s| !s.status.is_online()) {
            Some(i) => seen[i..].iter().any(|s| s.status.is_online() && s.visible),
            None => false,
        }
    })
    .await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// A discovery flap during an active transfer does not tear the session
/// down; the transfer completes and only then is the peer reaped.
#[tokio::test]
async fn test_withdrawal_rides_out_active_transfer() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;
    auto_accept(&receiver);
    pause_on_first_transferring(&sender);

    let file = src.path().join("big.bin");
    fs::write(&file, payload(256 * 1024)).unwrap();
    let id = sender.send_to("beta", vec![file.clone()]).unwrap();
    wait_status(&sender, id, TransferStatus::Paused).await;

    network.withdraw_announcement("beta");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sender.peer_count(), 1);
    assert_eq!(snapshot(&sender, id).status, TransferStatus::Paused);

    sender.resume_transfer(id).unwrap();
    wait_status(&sender, id, TransferStatus::Finished).await;
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::Finished).await;
    assert_eq!(
        fs::read(out_b.path().join("big.bin")).unwrap(),
        fs::read(&file).unwrap()
    );

    // With the transfer drained the withdrawal finally takes effect.
    wait_for("the withdrawn peer to be reaped", || sender.peer_count() == 0).await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

// ============================================================================
// Transfers end to end
// ============================================================================

/// One regular file travels across and lands byte-identical.
#[tokio::test]
async fn test_single_file_roundtrip() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;
    auto_accept(&receiver);

    let body = payload(10_000);
    let file = src.path().join("hello.txt");
    fs::write(&file, &body).unwrap();

    let id = sender.send_to("beta", vec![file]).unwrap();
    wait_status(&sender, id, TransferStatus::Finished).await;

    let sent = snapshot(&sender, id);
    assert_eq!(sent.direction, TransferDirection::Outgoing);
    assert_eq!(sent.total_size, 10_000);
    assert_eq!(sent.bytes_done, 10_000);
    assert_eq!(sent.element_count, 1);
    assert_eq!(sent.single_name.as_deref(), Some("hello.txt"));
    assert_eq!(sent.single_mime.as_deref(), Some("text/plain"));
    assert!((sent.progress - 1.0).abs() < f64::EPSILON);

    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::Finished).await;
    assert_eq!(fs::read(out_b.path().join("hello.txt")).unwrap(), body);

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// A nested directory tree arrives with structure, contents, markers and
/// (on Unix) permissions and symlinks intact.
#[tokio::test]
async fn test_directory_tree_roundtrip() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;
    auto_accept(&receiver);

    let root = src.path().join("project");
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    let notes = payload(10_000);
    let data = payload(20_000);
    fs::write(root.join("notes.txt"), &notes).unwrap();
    fs::write(root.join("run.sh"), "#!/bin/sh\necho hi\n").unwrap();
    fs::write(root.join("src").join("data.bin"), &data).unwrap();
    fs::write(root.join("src").join("zero.dat"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("run.sh", root.join("link")).unwrap();

    let id = sender.send_to("beta", vec![root]).unwrap();
    wait_status(&sender, id, TransferStatus::Finished).await;
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::Finished).await;

    let landed = out_b.path().join("project");
    assert!(landed.is_dir());
    assert!(landed.join("empty").is_dir());
    assert_eq!(fs::read(landed.join("notes.txt")).unwrap(), notes);
    assert_eq!(fs::read(landed.join("src").join("data.bin")).unwrap(), data);
    assert_eq!(fs::read(landed.join("src").join("zero.dat")).unwrap(), b"");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(landed.join("run.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "run.sh must land executable");
        let target = fs::read_link(landed.join("link")).unwrap();
        assert_eq!(target.to_str(), Some("run.sh"));
    }

    let sent = snapshot(&sender, id);
    assert_eq!(sent.total_size, 10_000 + 18 + 20_000);
    assert_eq!(sent.single_name.as_deref(), Some("project"));

    sender.shutdown().await;
    receiver.shutdown().await;
}

// ============================================================================
// Permission decisions
// ============================================================================

/// Declining an offer lands the decline on both sides.
#[tokio::test]
async fn test_receiver_declines_offer() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;

    let file = src.path().join("unwanted.bin");
    fs::write(&file, payload(500)).unwrap();

    let id = sender.send_to("beta", vec![file]).unwrap();
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::WaitingPermission).await;

    receiver.decline_transfer(rid).await.unwrap();
    wait_status(&receiver, rid, TransferStatus::DeclinedByReceiver).await;
    wait_status(&sender, id, TransferStatus::DeclinedByReceiver).await;
    assert!(!out_b.path().join("unwanted.bin").exists());

    // Terminal transfers can be dropped from the table.
    receiver.remove_transfer(rid).unwrap();
    sender.remove_transfer(id).unwrap();
    assert!(sender.transfers().is_empty());

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// Withdrawing a pending offer marks it sender-declined on both sides.
#[tokio::test]
async fn test_sender_withdraws_offer() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;

    let file = src.path().join("retracted.bin");
    fs::write(&file, payload(500)).unwrap();

    let id = sender.send_to("beta", vec![file]).unwrap();
    wait_status(&sender, id, TransferStatus::WaitingPermission).await;
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::WaitingPermission).await;

    sender.stop_transfer(id).await.unwrap();
    wait_status(&sender, id, TransferStatus::DeclinedBySender).await;
    wait_status(&receiver, rid, TransferStatus::DeclinedBySender).await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// With overwrite confirmation required and no confirming policy, accepting
/// an offer that collides with an existing file declines it instead.
#[tokio::test]
async fn test_overwrite_requires_confirmation() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();

    let sender = Service::new(test_config(out_a.path()), identity("alpha"), network.connector());
    let mut config = test_config(out_b.path());
    config.transfer.require_overwrite_confirmation = true;
    let receiver = Service::new(config, identity("beta"), network.connector());
    network.join(&sender);
    network.join(&receiver);
    wait_for("both peers to come online", || {
        !sender.visible_peers().is_empty() && !receiver.visible_peers().is_empty()
    })
    .await;

    let old = b"do not clobber".to_vec();
    fs::write(out_b.path().join("report.txt"), &old).unwrap();
    let file = src.path().join("report.txt");
    fs::write(&file, payload(2_000)).unwrap();

    let id = sender.send_to("beta", vec![file]).unwrap();
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::WaitingPermission).await;

    let denied = receiver.accept_transfer(rid).await;
    assert!(matches!(denied, Err(CoreError::Declined(_))));
    wait_status(&receiver, rid, TransferStatus::DeclinedByReceiver).await;
    wait_status(&sender, id, TransferStatus::DeclinedByReceiver).await;
    assert_eq!(fs::read(out_b.path().join("report.txt")).unwrap(), old);

    sender.shutdown().await;
    receiver.shutdown().await;
}

// ============================================================================
// Pause and stop
// ============================================================================

/// Pausing parks the stream at the gate with nothing sent; resuming
/// completes the transfer intact.
#[tokio::test]
async fn test_pause_parks_stream_and_resume_completes() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;
    auto_accept(&receiver);
    pause_on_first_transferring(&sender);

    let body = payload(256 * 1024);
    let file = src.path().join("big.bin");
    fs::write(&file, &body).unwrap();

    let id = sender.send_to("beta", vec![file]).unwrap();
    wait_status(&sender, id, TransferStatus::Paused).await;
    assert_eq!(snapshot(&sender, id).bytes_done, 0);

    // The gate holds while paused.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let held = snapshot(&sender, id);
    assert_eq!(held.status, TransferStatus::Paused);
    assert_eq!(held.bytes_done, 0);

    sender.resume_transfer(id).unwrap();
    wait_status(&sender, id, TransferStatus::Finished).await;
    assert_eq!(fs::read(out_b.path().join("big.bin")).unwrap(), body);

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// The receiver stopping an active transfer lands the receiver-stop status
/// on both sides and releases the parked sender.
#[tokio::test]
async fn test_receiver_stops_active_transfer() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;
    auto_accept(&receiver);
    pause_on_first_transferring(&sender);

    let file = src.path().join("big.bin");
    fs::write(&file, payload(256 * 1024)).unwrap();

    let id = sender.send_to("beta", vec![file]).unwrap();
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::Transferring).await;
    wait_status(&sender, id, TransferStatus::Paused).await;

    receiver.stop_transfer(rid).await.unwrap();
    wait_status(&receiver, rid, TransferStatus::StoppedByReceiver).await;
    wait_status(&sender, id, TransferStatus::StoppedByReceiver).await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// The sender stopping an active transfer lands the sender-stop status on
/// both sides.
#[tokio::test]
async fn test_sender_stops_active_transfer() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;
    auto_accept(&receiver);
    pause_on_first_transferring(&sender);

    let file = src.path().join("big.bin");
    fs::write(&file, payload(256 * 1024)).unwrap();

    let id = sender.send_to("beta", vec![file]).unwrap();
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::Transferring).await;
    wait_status(&sender, id, TransferStatus::Paused).await;

    sender.stop_transfer(id).await.unwrap();
    wait_status(&sender, id, TransferStatus::StoppedBySender).await;
    wait_status(&receiver, rid, TransferStatus::StoppedBySender).await;

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// Offering a path that no longer exists fails the crawl with a dedicated
/// terminal status and never reaches the receiver.
#[tokio::test]
async fn test_missing_source_reports_file_not_found() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;

    let id = sender
        .send_to("beta", vec![src.path().join("vanished.txt")])
        .unwrap();
    wait_status(&sender, id, TransferStatus::FileNotFound).await;

    let sent = snapshot(&sender, id);
    assert!(sent.error.is_some());
    assert!(receiver.transfers().is_empty());

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// Two transfers between the same pair run side by side without sharing
/// state; each record sizes and finishes on its own.
#[tokio::test]
async fn test_concurrent_transfers_stay_isolated() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;
    auto_accept(&receiver);

    let one = src.path().join("one.bin");
    let two = src.path().join("two.bin");
    fs::write(&one, payload(30_000)).unwrap();
    fs::write(&two, payload(50_000)).unwrap();

    let id_one = sender.send_to("beta", vec![one.clone()]).unwrap();
    let id_two = sender.send_to("beta", vec![two.clone()]).unwrap();
    assert_ne!(id_one, id_two);

    wait_status(&sender, id_one, TransferStatus::Finished).await;
    wait_status(&sender, id_two, TransferStatus::Finished).await;

    assert_eq!(snapshot(&sender, id_one).total_size, 30_000);
    assert_eq!(snapshot(&sender, id_two).total_size, 50_000);
    assert_eq!(
        fs::read(out_b.path().join("one.bin")).unwrap(),
        fs::read(&one).unwrap()
    );
    assert_eq!(
        fs::read(out_b.path().join("two.bin")).unwrap(),
        fs::read(&two).unwrap()
    );

    sender.shutdown().await;
    receiver.shutdown().await;
}

/// A transfer that fails on the receiving filesystem leaves a concurrent
/// transfer and both connection sessions untouched.
#[tokio::test]
async fn test_failed_transfer_leaves_siblings_alone() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let out_c = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();

    let sender = Service::new(test_config(out_a.path()), identity("alpha"), network.connector());
    let receiver = Service::new(test_config(out_b.path()), identity("beta"), network.connector());
    // gamma's output root is a regular file, so materialization fails.
    let bad_root = out_c.path().join("not-a-dir");
    fs::write(&bad_root, b"occupied").unwrap();
    let broken = Service::new(test_config(&bad_root), identity("gamma"), network.connector());

    network.join(&sender);
    network.join(&receiver);
    network.join(&broken);
    wait_for("all three peers to come online", || {
        sender.visible_peers().len() == 2
            && !receiver.visible_peers().is_empty()
            && !broken.visible_peers().is_empty()
    })
    .await;
    auto_accept(&receiver);
    auto_accept(&broken);
    pause_on_first_transferring(&sender);

    let good_file = src.path().join("good.bin");
    fs::write(&good_file, payload(256 * 1024)).unwrap();
    let good = sender.send_to("beta", vec![good_file.clone()]).unwrap();
    wait_status(&sender, good, TransferStatus::Paused).await;

    let bad_file = src.path().join("bad.bin");
    fs::write(&bad_file, payload(64 * 1024)).unwrap();
    let bad = sender.send_to("gamma", vec![bad_file]).unwrap();
    let bad_in = incoming_id(&broken).await;
    wait_status(&broken, bad_in, TransferStatus::Failed).await;
    wait_status(&sender, bad, TransferStatus::StoppedByReceiver).await;

    // The sibling transfer and both sessions are unaffected.
    assert_eq!(snapshot(&sender, good).status, TransferStatus::Paused);
    let peers = sender.visible_peers();
    assert_eq!(peers.len(), 2);
    assert!(peers.iter().all(|p| p.status.is_online()));

    sender.resume_transfer(good).unwrap();
    wait_status(&sender, good, TransferStatus::Finished).await;
    let rid = incoming_id(&receiver).await;
    wait_status(&receiver, rid, TransferStatus::Finished).await;
    assert_eq!(
        fs::read(out_b.path().join("good.bin")).unwrap(),
        fs::read(&good_file).unwrap()
    );

    sender.shutdown().await;
    receiver.shutdown().await;
    broken.shutdown().await;
}

// ============================================================================
// Operation surface
// ============================================================================

/// Operations against unknown peers or non-terminal transfers are rejected.
#[tokio::test]
async fn test_invalid_operations_rejected() {
    let src = tempfile::tempdir().unwrap();
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();
    let network = drift_core::LoopbackNetwork::new();
    let (sender, receiver) = online_pair(&network, out_a.path(), out_b.path()).await;

    let file = src.path().join("f.bin");
    fs::write(&file, payload(100)).unwrap();

    assert!(sender.send_to("nobody", vec![file.clone()]).is_err());

    let id = sender.send_to("beta", vec![file]).unwrap();
    // Still live, so removal must be refused.
    assert!(sender.remove_transfer(id).is_err());

    wait_status(&sender, id, TransferStatus::WaitingPermission).await;
    sender.stop_transfer(id).await.unwrap();
    wait_status(&sender, id, TransferStatus::DeclinedBySender).await;
    sender.remove_transfer(id).unwrap();

    sender.shutdown().await;
    receiver.shutdown().await;
}
