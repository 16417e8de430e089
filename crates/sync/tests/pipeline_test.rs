mod common;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use alloy_primitives::B256;

use chain::generate::{generate_blocks, generate_state, genesis};
use chain::memory::MemoryChain;
use common::*;
use sync::{EngineEvent, HashOrNumber, ImportMode, Request, Stage, SyncConfig, SyncMode};

fn assert_imported_once(log: &[(u64, B256, ImportMode)]) {
    let unique: HashSet<B256> = log.iter().map(|(_, h, _)| *h).collect();
    assert_eq!(unique.len(), log.len(), "a block was imported twice");
    for pair in log.windows(2) {
        assert!(pair[0].0 < pair[1].0, "imports out of order: {pair:?}");
    }
}

// ---------------------------------------------------------------------------
// Full sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_sync_from_genesis() {
    let blocks = generate_blocks(&genesis(), 100, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    let a = peer_id(1);
    let target = head_of(&remote);

    let (mut engine, transport, store) = setup(test_config(), MemoryChain::new(genesis()));
    let net = Network::default().serve(a, remote);

    engine.on_peer_connected(a, target).await;
    assert!(engine.start_sync(Some(a)).await);
    pump(&mut engine, &transport, &net).await;

    let head = store.with_chain(|c| c.head());
    assert_eq!(head.number, 100);
    assert_eq!(head.hash, target.hash);

    let log = store.import_log();
    assert_eq!(log.len(), 100);
    assert_imported_once(&log);
    assert!(log.iter().all(|(_, _, mode)| *mode == ImportMode::Execute));

    // Empty blocks never cost a body request.
    let requested: usize = transport
        .history()
        .iter()
        .map(|s| match &s.request {
            Request::Bodies(h) => h.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(requested, 67);

    let status = engine.status();
    assert_eq!(status.stage, Stage::Idle);
    assert!(status.last_error.is_none());
    let metrics = engine.metrics();
    assert_eq!(metrics.imported, 100);
    assert_eq!(metrics.headers.received, 100);
    assert!(engine.dispatcher().is_empty());
}

#[tokio::test]
async fn test_target_disconnect_resumes_without_refetch() {
    let blocks = generate_blocks(&genesis(), 100, 1, B256::ZERO);
    let local = chain_with(&blocks[..49]);
    let remote = chain_with(&blocks);
    let (a, b) = (peer_id(1), peer_id(2));
    let target = head_of(&remote);

    let config = SyncConfig {
        header_batch: 21,
        body_batch: 21,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, local);
    let net = Network::default().serve(a, remote.clone()).serve(b, remote.clone());

    engine.on_peer_connected(a, target).await;
    assert!(engine.start_sync(Some(a)).await);
    // A serves everything up to block 70 and sits on the rest.
    pump_filtered(&mut engine, &transport, &net, |s| {
        s.peer == a && request_height(&remote, &s.request) <= 70
    })
    .await;
    assert_eq!(store.with_chain(|c| c.head()).number, 70);

    engine.on_peer_connected(b, target).await;
    engine.on_peer_disconnected(a).await;
    assert!(engine.is_syncing(), "session should move to the remaining peer");
    pump(&mut engine, &transport, &net).await;

    let head = store.with_chain(|c| c.head());
    assert_eq!(head.number, 100);
    assert_eq!(head.hash, target.hash);

    let log = store.import_log();
    assert_eq!(log.len(), 51);
    assert_eq!(log.first().map(|l| l.0), Some(50));
    assert_imported_once(&log);

    for s in transport.sent_to(&b) {
        assert!(
            request_height(&remote, &s.request) > 70,
            "block range already delivered by A was fetched again: {:?}",
            s.request
        );
    }
}

#[tokio::test]
async fn test_broken_chain_from_target_aborts() {
    let blocks = generate_blocks(&genesis(), 60, 1, B256::ZERO);
    let a = peer_id(1);
    let remote = chain_with(&blocks);
    let target = head_of(&remote);

    let (mut engine, transport, store) = setup(test_config(), MemoryChain::new(genesis()));
    let mut net = Network::default().serve(a, remote);
    net.tamper.insert(a, break_first_header);

    engine.on_peer_connected(a, target).await;
    assert!(engine.start_sync(Some(a)).await);
    pump(&mut engine, &transport, &net).await;

    assert!(!engine.is_syncing());
    assert!(store.import_log().is_empty());
    assert_eq!(store.with_chain(|c| c.head()).number, 0);
    let err = engine.status().last_error.unwrap_or_default();
    assert!(err.contains("invalid chain"), "unexpected error: {err}");
    assert!(engine.metrics().headers.dropped > 0);
}

#[tokio::test]
async fn test_conflicting_helper_is_excluded() {
    let blocks = generate_blocks(&genesis(), 100, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    let (a, b) = (peer_id(1), peer_id(2));
    let target = head_of(&remote);

    let config = SyncConfig {
        header_batch: 25,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let mut net = Network::default().serve(a, remote.clone()).serve(b, remote);
    net.tamper.insert(b, break_first_header);

    engine.on_peer_connected(a, target).await;
    engine.on_peer_connected(b, target).await;
    assert!(engine.start_sync(Some(a)).await);
    pump(&mut engine, &transport, &net).await;

    assert_eq!(store.with_chain(|c| c.head()).hash, target.hash);
    assert_imported_once(&store.import_log());
    // Excluded from the session, not disconnected.
    assert!(engine.peers().contains(&b));
    assert!(transport.disconnected().is_empty());
    let headers_to_b = transport
        .sent_to(&b)
        .iter()
        .filter(|s| matches!(s.request, Request::Headers { .. }))
        .count();
    assert_eq!(headers_to_b, 1);
}

#[tokio::test]
async fn test_lying_helper_answering_first_is_excluded() {
    let blocks = generate_blocks(&genesis(), 100, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    // B shares the first ten blocks, then serves a fork it claims is canonical.
    let mut forked = chain_with(&blocks[..10]);
    extend(
        &mut forked,
        &generate_blocks(&blocks[9].block.header, 90, 9, B256::ZERO),
    );
    let (a, b) = (peer_id(1), peer_id(2));
    let target = head_of(&remote);
    assert_ne!(head_of(&forked).hash, target.hash);

    let config = SyncConfig {
        header_batch: 25,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let net = Network::default().serve(a, remote).serve(b, forked.clone());

    engine.on_peer_connected(a, target).await;
    engine.on_peer_connected(b, head_of(&forked)).await;
    assert!(engine.start_sync(Some(a)).await);

    let (from_b, from_a): (Vec<Sent>, Vec<Sent>) =
        transport.take_sent().into_iter().partition(|s| s.peer == b);
    assert!(!from_a.is_empty() && !from_b.is_empty());
    // The helper's forged range lands before the target's first batch.
    for s in from_b.iter().chain(&from_a) {
        let response = net.respond(s).unwrap();
        engine.on_response(s.peer, s.request_id, response).await;
    }
    pump(&mut engine, &transport, &net).await;

    assert_eq!(store.with_chain(|c| c.head()).hash, target.hash);
    assert_eq!(store.import_log().len(), 100);
    assert_imported_once(&store.import_log());
    assert!(engine.status().last_error.is_none());
    // Excluded from the session, not disconnected.
    assert!(engine.peers().contains(&b));
    assert!(transport.disconnected().is_empty());
}

// ---------------------------------------------------------------------------
// Timeouts and cancellation
// ---------------------------------------------------------------------------

/// Deadline of the newest request sent to `peer`.
fn latest_deadline(engine: &TestEngine, transport: &MockTransport, peer: &sync::PeerId) -> Instant {
    let id = transport
        .sent_to(peer)
        .last()
        .map(|s| s.request_id)
        .expect("no request sent");
    engine.dispatcher().get(id).expect("request not in flight").deadline
}

/// Answer what is queued right now, without following up on new requests.
async fn answer_queued(engine: &mut TestEngine, transport: &MockTransport, net: &Network) {
    for s in transport.take_sent() {
        if let Some(response) = net.respond(&s) {
            engine.on_response(s.peer, s.request_id, response).await;
        }
    }
}

#[tokio::test]
async fn test_silent_peer_evicted_and_work_reassigned() {
    let blocks = generate_blocks(&genesis(), 100, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    // The silent peer sorts first while throughput estimates are tied.
    let (silent, a) = (peer_id(1), peer_id(2));
    let target = head_of(&remote);

    let config = SyncConfig {
        mode: SyncMode::Light,
        header_batch: 10,
        request_timeout_ms: 1_000,
        max_consecutive_failures: 3,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let net = Network::default().serve(a, remote);

    engine.on_peer_connected(a, target).await;
    engine.on_peer_connected(silent, target).await;
    assert!(engine.start_sync(Some(a)).await);

    // Each round expires only the silent peer's request; A always has a
    // newer one in flight, so the released range goes back to the silent peer.
    for round in 1..=3 {
        assert!(engine.peers().contains(&silent), "evicted early in round {round}");
        let deadline = latest_deadline(&engine, &transport, &silent);
        engine.tick(deadline).await;
        answer_queued(&mut engine, &transport, &net).await;
    }

    assert!(!engine.peers().contains(&silent));
    assert_eq!(transport.disconnected(), vec![silent]);
    assert_eq!(engine.dispatcher().count_for(|r| r.peer == silent), 0);
    assert_eq!(engine.metrics().headers.timed_out, 3);
    assert!(engine.is_syncing());

    pump(&mut engine, &transport, &net).await;
    assert_eq!(store.with_chain(|c| c.head()).hash, target.hash);
    assert_imported_once(&store.import_log());
}

#[tokio::test]
async fn test_cancel_drops_late_responses() {
    let blocks = generate_blocks(&genesis(), 100, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    let a = peer_id(1);

    let config = SyncConfig {
        header_batch: 50,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let net = Network::default().serve(a, remote);

    engine.on_peer_connected(a, head_of(&net.chains[&a])).await;
    assert!(engine.start_sync(Some(a)).await);

    let first = transport.take_sent();
    assert_eq!(first.len(), 1);
    let response = net.respond(&first[0]).unwrap();
    engine.on_response(a, first[0].request_id, response).await;

    let held = transport.take_sent();
    assert!(!held.is_empty());
    engine.cancel_sync();
    assert!(!engine.is_syncing());
    assert_eq!(engine.status().stage, Stage::Idle);

    let dropped_before = engine.metrics().bodies.dropped + engine.metrics().headers.dropped;
    for s in &held {
        let response = net.respond(s).unwrap();
        engine.on_response(s.peer, s.request_id, response).await;
    }
    let dropped_after = engine.metrics().bodies.dropped + engine.metrics().headers.dropped;
    assert!(dropped_after > dropped_before);
    assert!(store.import_log().is_empty());
    // Late answers are not held against the peer.
    assert!(engine.peers().contains(&a));
    assert_eq!(engine.peers().get(&a).map(|p| p.failures()), Some(0));
}

#[tokio::test]
async fn test_stalled_session_fails() {
    let blocks = generate_blocks(&genesis(), 10, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    let a = peer_id(1);

    let config = SyncConfig {
        stall_timeout_secs: 30,
        request_timeout_ms: 120_000,
        ..test_config()
    };
    let (mut engine, _transport, _store) = setup(config, MemoryChain::new(genesis()));
    engine.on_peer_connected(a, head_of(&remote)).await;
    assert!(engine.start_sync(Some(a)).await);

    engine.tick(Instant::now() + Duration::from_secs(31)).await;
    assert!(!engine.is_syncing());
    let err = engine.status().last_error.unwrap_or_default();
    assert!(err.contains("no progress"), "unexpected error: {err}");
}

/// Drain what the engine task sent, waiting briefly for it to get there.
async fn wait_for_requests(transport: &MockTransport) -> Vec<Sent> {
    for _ in 0..400 {
        let sent = transport.take_sent();
        if !sent.is_empty() {
            return sent;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine sent no requests");
}

#[tokio::test]
async fn test_spawned_engine_cancels_mid_session() {
    let blocks = generate_blocks(&genesis(), 100, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    let a = peer_id(1);

    let config = SyncConfig {
        header_batch: 50,
        ..test_config()
    };
    let (engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let net = Network::default().serve(a, remote);
    let handle = engine.start();
    let events = handle.sender();
    let mut status = handle.subscribe();

    events
        .send(EngineEvent::PeerConnected {
            peer: a,
            head: head_of(&net.chains[&a]),
        })
        .await
        .unwrap();
    handle.start_sync(Some(a)).await;
    let held = wait_for_requests(&transport).await;
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.stage != Stage::Idle))
        .await
        .expect("session never started")
        .unwrap();

    handle.cancel_sync();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.stage == Stage::Idle))
        .await
        .expect("session still running after cancel")
        .unwrap();
    assert_eq!(handle.status().target, None);

    let dropped_before = handle.metrics().headers.dropped;
    for s in &held {
        events
            .send(EngineEvent::Response {
                peer: s.peer,
                request_id: s.request_id,
                response: net.respond(s).unwrap(),
            })
            .await
            .unwrap();
    }
    let counted = async {
        while handle.metrics().headers.dropped == dropped_before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), counted)
        .await
        .expect("late response was not counted as dropped");

    assert!(store.import_log().is_empty());
    assert_eq!(handle.status().stage, Stage::Idle);
    handle.stop().await;
}

// ---------------------------------------------------------------------------
// Ancestor search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fork_resolves_to_common_ancestor() {
    let common = generate_blocks(&genesis(), 30, 1, B256::ZERO);
    let fork_point = common.last().unwrap().block.header.clone();
    let local_fork = generate_blocks(&fork_point, 10, 2, B256::ZERO);
    let remote_fork = generate_blocks(&fork_point, 30, 3, B256::ZERO);

    let mut local = chain_with(&common);
    extend(&mut local, &local_fork);
    let mut remote = chain_with(&common);
    extend(&mut remote, &remote_fork);
    let a = peer_id(1);
    let target = head_of(&remote);

    let (mut engine, transport, store) = setup(test_config(), local);
    let net = Network::default().serve(a, remote);

    engine.on_peer_connected(a, target).await;
    assert!(engine.start_sync(Some(a)).await);
    assert_eq!(engine.status().stage, Stage::AncestorSearch);
    pump(&mut engine, &transport, &net).await;

    let head = store.with_chain(|c| c.head());
    assert_eq!(head.hash, target.hash);
    let log = store.import_log();
    assert_eq!(log.len(), 30);
    assert_eq!(log[0].0, 31);
    assert_eq!(log[0].1, remote_fork[0].block.hash());
    assert_imported_once(&log);

    // Single-header queries only, each at or below the local head.
    let queries: Vec<u64> = transport
        .history()
        .iter()
        .filter_map(|s| match s.request {
            Request::Headers {
                origin: HashOrNumber::Number(n),
                amount: 1,
                ..
            } => Some(n),
            _ => None,
        })
        .collect();
    assert!(!queries.is_empty());
    assert!(queries.iter().all(|n| *n <= 40));
}

#[tokio::test]
async fn test_unknown_ancestor_beyond_reorg_depth() {
    let local_blocks = generate_blocks(&genesis(), 20, 1, B256::ZERO);
    let remote_blocks = generate_blocks(&genesis(), 40, 9, B256::ZERO);
    let a = peer_id(1);
    let remote = chain_with(&remote_blocks);

    let config = SyncConfig {
        max_reorg_depth: 5,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, chain_with(&local_blocks));
    let net = Network::default().serve(a, remote);

    engine.on_peer_connected(a, head_of(&net.chains[&a])).await;
    assert!(engine.start_sync(Some(a)).await);
    pump(&mut engine, &transport, &net).await;

    assert!(!engine.is_syncing());
    assert!(store.import_log().is_empty());
    assert_eq!(store.with_chain(|c| c.head()).number, 20);
    let err = engine.status().last_error.unwrap_or_default();
    assert!(err.contains("no common ancestor"), "unexpected error: {err}");
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fast_sync_fetches_receipts_and_state() {
    let (root, nodes) = generate_state(7, 6);
    let blocks = generate_blocks(&genesis(), 64, 1, root);
    let remote = with_state(chain_with(&blocks), &nodes);
    let a = peer_id(1);
    let target = head_of(&remote);

    let config = SyncConfig {
        mode: SyncMode::Fast,
        pivot_confirmations: 16,
        state_batch: 2,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let net = Network::default().serve(a, remote);

    engine.on_peer_connected(a, target).await;
    assert!(engine.start_sync(Some(a)).await);
    pump(&mut engine, &transport, &net).await;

    assert_eq!(store.with_chain(|c| c.head()).hash, target.hash);
    assert_eq!(store.state_len(), nodes.len());

    let log = store.import_log();
    assert_eq!(log.len(), 64);
    for (number, _, mode) in &log {
        let expected = if *number < 48 {
            ImportMode::WithReceipts
        } else {
            ImportMode::Execute
        };
        assert_eq!(*mode, expected, "block {number}");
    }

    // Shared state nodes are requested once.
    let mut requested = Vec::new();
    for s in transport.history() {
        if let Request::StateNodes(hashes) = s.request {
            requested.extend(hashes);
        }
    }
    let unique: HashSet<B256> = requested.iter().copied().collect();
    assert_eq!(unique.len(), requested.len());
    assert_eq!(requested.len(), nodes.len());
    assert!(engine.metrics().receipts.received > 0);
}

#[tokio::test]
async fn test_light_sync_imports_headers_only() {
    let blocks = generate_blocks(&genesis(), 40, 1, B256::ZERO);
    let remote = chain_with(&blocks);
    let a = peer_id(1);

    let config = SyncConfig {
        mode: SyncMode::Light,
        ..test_config()
    };
    let (mut engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let net = Network::default().serve(a, remote);

    engine.on_peer_connected(a, head_of(&net.chains[&a])).await;
    assert!(engine.start_sync(Some(a)).await);
    pump(&mut engine, &transport, &net).await;

    let log = store.import_log();
    assert_eq!(log.len(), 40);
    assert!(log.iter().all(|(_, _, mode)| *mode == ImportMode::HeaderOnly));
    assert!(transport
        .history()
        .iter()
        .all(|s| matches!(s.request, Request::Headers { .. })));
}

#[tokio::test]
async fn test_heavier_peer_replaces_session() {
    let base = generate_blocks(&genesis(), 20, 1, B256::ZERO);
    let longer = generate_blocks(&genesis(), 50, 1, B256::ZERO);
    let (a, b) = (peer_id(1), peer_id(2));
    let chain_a = chain_with(&base);
    let chain_b = chain_with(&longer);

    let config = SyncConfig {
        auto_sync: true,
        ..SyncConfig::default()
    };
    let (mut engine, transport, store) = setup(config, MemoryChain::new(genesis()));
    let net = Network::default().serve(a, chain_a.clone()).serve(b, chain_b.clone());

    engine.on_peer_connected(a, head_of(&chain_a)).await;
    assert_eq!(engine.status().target, Some(head_of(&chain_a)));
    engine.on_peer_connected(b, head_of(&chain_b)).await;
    assert_eq!(engine.status().target, Some(head_of(&chain_b)));

    pump(&mut engine, &transport, &net).await;
    assert_eq!(store.with_chain(|c| c.head()).number, 50);
    assert_imported_once(&store.import_log());
}
