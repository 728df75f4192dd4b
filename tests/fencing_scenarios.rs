//! End-to-end fencing scenarios: device fallback, peer-view convergence,
//! self-fence handling and fencer loss.

mod common;

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use common::leader_fixture;
use corral::cluster::{MsgRecipient, MsgSender, MsgType};
use corral::fencing::{ATTR_HOST_LIST, ATTR_PRIORITY};
use corral::membership::{JoinPhase, Liveness, PeerFilter};
use corral::transition::{
    ActionInput, ActionKind, EngineNotification, GraphInput, SynapseInput,
};
use corral::{Envelope, FencingNotification, HandleOutcome, WireMessage};

fn script(body: &str) -> tempfile::TempPath {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "#!/bin/sh\n{}", body).unwrap();
    let path = file.into_temp_path();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn device_params(hosts: &str, priority: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert(ATTR_HOST_LIST.to_string(), hosts.to_string());
    params.insert(ATTR_PRIORITY.to_string(), priority.to_string());
    params
}

fn fencing_graph(graph_id: u32, target: &str) -> GraphInput {
    GraphInput {
        id: graph_id,
        batch_limit: 0,
        synapses: vec![SynapseInput {
            id: 0,
            priority: 0,
            inputs: vec![],
            actions: vec![ActionInput {
                id: 1,
                kind: ActionKind::Fencing,
                target: Some(target.to_string()),
                task: "off".to_string(),
                timeout_ms: 30_000,
                rsc_id: None,
                interval_ms: 0,
                target_rc: 0,
                params: HashMap::new(),
                confirm_on_timeout: false,
            }],
            failure_tolerated: false,
        }],
    }
}

/// The first device fails, the second (lower priority) succeeds; the
/// outcome is broadcast and every peer's view converges: liveness lost,
/// join phase none, expected down.
#[tokio::test]
async fn fencing_falls_back_and_converges_peer_view() {
    let mut cluster = leader_fixture().await;
    cluster.runtime.with_peers(|peers| {
        peers.get(Some(2), Some("node2"), PeerFilter::Cluster).unwrap();
        peers.update_liveness(Some(2), None, Liveness::Member);
        peers.update_join("node2", JoinPhase::Confirmed);
    });

    let failing = script("exit 5");
    let working = script("exit 0");
    cluster
        .runtime
        .fencing()
        .register_device("d1", failing.to_str().unwrap(), None, device_params("node2", "10"))
        .unwrap();
    cluster
        .runtime
        .fencing()
        .register_device("d2", working.to_str().unwrap(), None, device_params("node2", "5"))
        .unwrap();

    cluster
        .runtime
        .submit_graph(fencing_graph(1, "node2"))
        .await
        .unwrap();

    // The engine confirms the fencing action off the broadcast and the
    // transition completes cleanly.
    loop {
        let note = tokio::time::timeout(Duration::from_secs(10), cluster.engine_rx.recv())
            .await
            .expect("notification within deadline")
            .expect("channel open");
        if let EngineNotification::TransitionComplete { graph_id: 1, failed, .. } = note {
            assert!(!failed);
            break;
        }
    }

    // Peer view converged.
    cluster.runtime.with_peers(|peers| {
        let peer = peers.find(None, Some("node2"), PeerFilter::Any).unwrap();
        assert_eq!(peer.state, Liveness::Lost);
        assert_eq!(peer.join, JoinPhase::None);
        assert_eq!(peer.expected.as_deref(), Some("down"));
    });

    // The leader recorded the outcome and the broadcast named the
    // fallback device.
    assert_eq!(
        *cluster.store.stonith_updates.lock().unwrap(),
        vec!["node2".to_string()]
    );
    let sent = cluster.bus.sent.lock().unwrap();
    let note = sent
        .iter()
        .find_map(|env| {
            let payload = env.payload().ok()?;
            match serde_json::from_slice::<WireMessage>(&payload).ok()? {
                WireMessage::FencingNotification(note) => Some(note),
                _ => None,
            }
        })
        .expect("fencing notification broadcast");
    assert_eq!(note.device.as_deref(), Some("d2"));
    assert_eq!(note.target, "node2");
}

/// A broadcast naming the local node is terminal: the runtime reports
/// self-fencing and signals the daemon to halt.
#[tokio::test]
async fn self_fence_notification_is_terminal() {
    let mut cluster = leader_fixture().await;

    let note = FencingNotification {
        target: "node1".to_string(),
        action: "off".to_string(),
        rc: 0,
        device: Some("d9".to_string()),
        executioner: "node2".to_string(),
        client_origin: None,
        reference: "ref-1".to_string(),
    };
    let envelope = Envelope::new(
        MsgSender {
            id: 2,
            uname: "node2".to_string(),
            pid: 1,
            kind: MsgType::Fencer,
        },
        MsgRecipient::broadcast(MsgType::Fencer),
        0,
        &serde_json::to_vec(&WireMessage::FencingNotification(note)).unwrap(),
    )
    .unwrap();

    assert_eq!(
        cluster.runtime.handle_envelope(&envelope).await,
        HandleOutcome::SelfFenced
    );
    assert!(cluster.fatal_rx.recv().await.is_some());
}

/// Losing the fencer while a fencing action is pending fails the action,
/// aborts the graph at infinite priority and posts a compute-again input.
#[tokio::test]
async fn fencer_loss_aborts_pending_fencing() {
    let mut cluster = leader_fixture().await;
    cluster.runtime.with_peers(|peers| {
        peers.get(Some(3), Some("node3"), PeerFilter::Cluster).unwrap();
    });

    // A device that hangs, so the fencing action stays in flight.
    let hanging = script("sleep 60");
    cluster
        .runtime
        .fencing()
        .register_device("slow", hanging.to_str().unwrap(), None, device_params("node3", "1"))
        .unwrap();

    cluster
        .runtime
        .submit_graph(fencing_graph(3, "node3"))
        .await
        .unwrap();

    cluster.runtime.on_fencer_lost().await;

    let mut saw_abort = false;
    let mut saw_compute_again = false;
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(5), cluster.engine_rx.recv()).await {
            Ok(Some(EngineNotification::TransitionComplete { graph_id: 3, aborted, .. })) => {
                saw_abort = saw_abort || aborted;
            }
            Ok(Some(EngineNotification::ComputeAgain)) => {
                saw_compute_again = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_abort, "graph should be discarded by the abort");
    assert!(saw_compute_again, "a compute-again input should be posted");
}

/// An externally-initiated fencing success still updates the view, but
/// additionally aborts the current transition.
#[tokio::test]
async fn external_fencing_aborts_transition() {
    let mut cluster = leader_fixture().await;
    cluster.runtime.with_peers(|peers| {
        peers.get(Some(2), Some("node2"), PeerFilter::Cluster).unwrap();
        peers.update_liveness(Some(2), None, Liveness::Member);
    });

    // A long-running transition is in flight (hanging fencing op on a
    // hanging device keeps it incomplete).
    let hanging = script("sleep 60");
    cluster
        .runtime
        .fencing()
        .register_device("slow", hanging.to_str().unwrap(), None, device_params("node4", "1"))
        .unwrap();
    cluster.runtime.with_peers(|peers| {
        peers.get(Some(4), Some("node4"), PeerFilter::Cluster).unwrap();
    });
    cluster
        .runtime
        .submit_graph(fencing_graph(5, "node4"))
        .await
        .unwrap();

    // Someone else fenced node2 meanwhile.
    let note = FencingNotification {
        target: "node2".to_string(),
        action: "reboot".to_string(),
        rc: 0,
        device: Some("other".to_string()),
        executioner: "node3".to_string(),
        client_origin: Some("stonith-admin.999".to_string()),
        reference: "ext-1".to_string(),
    };
    let envelope = Envelope::new(
        MsgSender {
            id: 3,
            uname: "node3".to_string(),
            pid: 1,
            kind: MsgType::Fencer,
        },
        MsgRecipient::broadcast(MsgType::Fencer),
        0,
        &serde_json::to_vec(&WireMessage::FencingNotification(note)).unwrap(),
    )
    .unwrap();
    assert_eq!(
        cluster.runtime.handle_envelope(&envelope).await,
        HandleOutcome::Processed
    );

    // The external operation discarded our transition.
    let mut saw_abort = false;
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(5), cluster.engine_rx.recv()).await {
            Ok(Some(EngineNotification::TransitionComplete { graph_id: 5, aborted: true, .. })) => {
                saw_abort = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_abort, "external fencing should abort the in-flight graph");
    // And its fail count was reset.
    assert_eq!(
        *cluster.attrs.fail_counts_cleared.lock().unwrap(),
        vec!["node2".to_string()]
    );
}
