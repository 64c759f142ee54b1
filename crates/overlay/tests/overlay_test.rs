//! End-to-end behaviour of the overlay through the service facade

use std::sync::Arc;
use std::time::Duration;

use overlay::config::OverlayConfig;
use overlay::metadata::{ChunkId, NodeId, NodeInfo, NodeStatus, SummaryScope};
use overlay::scheduler::DepartureOutcome;
use overlay::transfer::InMemoryTransfer;
use overlay::{Overlay, OverlayError};

const SUPERPEER_1: NodeId = NodeId(0xC0C1);
const SUPERPEER_2: NodeId = NodeId(0xC301);
const PEER_A: NodeId = NodeId(0x0280);
const PEER_B: NodeId = NodeId(0xC241);
const PEER_C: NodeId = NodeId(0xC601);

fn test_config(name: &str) -> OverlayConfig {
    let mut config = OverlayConfig::default();
    config.cluster.name = name.to_string();
    config.cluster.data_dir =
        std::env::temp_dir().join(format!("overlay_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&config.cluster.data_dir);
    config.migration.transfer_timeout_ms = 1000;
    config.departure.shutdown_timeout_ms = 2000;
    config.departure.max_retries = 2;
    config.departure.backoff_base_ms = 1;
    config.departure.backoff_max_ms = 5;
    config
}

async fn start(config: OverlayConfig) -> (Overlay, Arc<InMemoryTransfer>) {
    let transfer = Arc::new(InMemoryTransfer::new());
    let overlay = Overlay::new(config, transfer.clone()).await.unwrap();
    (overlay, transfer)
}

async fn join_cluster(overlay: &Overlay, superpeers: &[NodeId], peers: &[NodeId]) {
    for sp in superpeers {
        overlay
            .join(NodeInfo::superpeer(*sp, format!("10.0.0.{}:22221", sp.0 & 0xFF)))
            .await
            .unwrap();
    }
    for peer in peers {
        overlay
            .join(NodeInfo::peer(*peer, format!("10.0.1.{}:22222", peer.0 & 0xFF)))
            .await
            .unwrap();
    }
}

fn expect_removed(outcome: DepartureOutcome) -> Vec<(ChunkId, NodeId)> {
    match outcome {
        DepartureOutcome::Removed { migrated } => migrated,
        DepartureOutcome::Recovering(_) => panic!("expected a completed shutdown"),
    }
}

#[tokio::test]
async fn test_chunks_created_on_preferred_node() {
    let (overlay, _) = start(test_config("preferred")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;

    let chunks = overlay.chunk_create(5, None, Some(PEER_A)).await.unwrap();
    assert_eq!(chunks.len(), 5);
    let mut distinct = chunks.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 5);

    for chunk in &chunks {
        assert_eq!(overlay.lookup_owner(*chunk).await.unwrap(), PEER_A);
        assert_eq!(chunk.creator(), PEER_A);
    }
}

#[tokio::test]
async fn test_preferred_node_without_room_falls_back() {
    let (overlay, _) = start(test_config("fallback")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[]).await;
    overlay
        .join(NodeInfo::peer(PEER_A, "10.0.1.1:22222").with_capacity(100))
        .await
        .unwrap();
    overlay
        .join(NodeInfo::peer(PEER_B, "10.0.1.2:22222").with_capacity(1000))
        .await
        .unwrap();

    let chunks = overlay.chunk_create(2, Some(64), Some(PEER_A)).await.unwrap();
    assert_eq!(overlay.lookup_owner(chunks[0]).await.unwrap(), PEER_A);
    assert_eq!(overlay.lookup_owner(chunks[1]).await.unwrap(), PEER_B);

    assert!(matches!(
        overlay.chunk_create(1, Some(5000), None).await,
        Err(OverlayError::NoCapacity { size: 5000 })
    ));
}

#[tokio::test]
async fn test_name_aliases_resolve_to_one_chunk() {
    let (overlay, _) = start(test_config("aliases")).await;
    join_cluster(&overlay, &[SUPERPEER_1, SUPERPEER_2], &[PEER_A]).await;
    let chunk = overlay.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];

    let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
    for name in names {
        let bound = overlay
            .namereg(chunk.creator().0, chunk.local_id(), name)
            .unwrap();
        assert_eq!(bound, chunk);
    }
    for name in names {
        assert_eq!(overlay.resolve(name).unwrap(), chunk);
        assert_eq!(overlay.resolve_owner(name).await.unwrap(), PEER_A);
    }

    assert!(matches!(
        overlay.namereg(chunk.creator().0, chunk.local_id(), "alpha"),
        Err(OverlayError::Conflict(_))
    ));
    assert!(matches!(
        overlay.namereg(PEER_A.0, 999, "nowhere"),
        Err(OverlayError::UnknownChunk(_))
    ));
    assert!(matches!(
        overlay.namereg(PEER_A.0, (1 << 48) + 1, "x"),
        Err(OverlayError::KeyOutOfRange { .. })
    ));
    assert!(matches!(overlay.resolve("zeta"), Err(OverlayError::NotFound(_))));

    let listed: Vec<_> = overlay.namelist().into_iter().map(|b| b.name).collect();
    assert_eq!(listed, vec!["alpha", "beta", "delta", "epsilon", "gamma"]);
}

#[tokio::test]
async fn test_migrate_then_stale_source_fails() {
    let (overlay, transfer) = start(test_config("migrate")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let chunk = overlay.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];

    overlay.chunk_migrate(chunk, PEER_B, PEER_A).await.unwrap();
    assert_eq!(overlay.lookup_owner(chunk).await.unwrap(), PEER_B);
    assert_eq!(transfer.completed(), vec![(chunk, PEER_A, PEER_B)]);

    match overlay.chunk_migrate(chunk, PEER_B, PEER_A).await {
        Err(OverlayError::OwnershipMismatch {
            expected, actual, ..
        }) => {
            assert_eq!(expected, PEER_A);
            assert_eq!(actual, PEER_B);
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(overlay.migrations().len(), 1);
}

#[tokio::test]
async fn test_concurrent_migrations_of_different_chunks() {
    let (overlay, transfer) = start(test_config("parallel")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let chunks = overlay.chunk_create(4, None, Some(PEER_A)).await.unwrap();
    transfer.set_delay(Some(Duration::from_millis(200)));

    let overlay = Arc::new(overlay);
    let started = std::time::Instant::now();
    let mut running = Vec::new();
    for chunk in chunks.clone() {
        let overlay = overlay.clone();
        running.push(tokio::spawn(async move {
            overlay.chunk_migrate(chunk, PEER_B, PEER_A).await
        }));
    }
    for handle in running {
        handle.await.unwrap().unwrap();
    }
    // Serialized transfers would take at least 800ms
    assert!(started.elapsed() < Duration::from_millis(700));
    for chunk in chunks {
        assert_eq!(overlay.lookup_owner(chunk).await.unwrap(), PEER_B);
    }
}

#[tokio::test]
async fn test_graceful_shutdown_migrates_every_chunk() {
    let (overlay, _) = start(test_config("graceful")).await;
    join_cluster(&overlay, &[SUPERPEER_1, SUPERPEER_2], &[PEER_A, PEER_B, PEER_C]).await;
    let chunks = overlay.chunk_create(6, None, Some(PEER_A)).await.unwrap();

    let migrated = expect_removed(overlay.node_shutdown(PEER_A, true).await.unwrap());
    assert_eq!(migrated.len(), chunks.len());

    for chunk in &chunks {
        let owner = overlay.lookup_owner(*chunk).await.unwrap();
        assert!(owner == PEER_B || owner == PEER_C);
    }
    assert!(!overlay.node_listing().await.contains(PEER_A));
    assert!(matches!(
        overlay.chunklist(PEER_A, true).await,
        Err(OverlayError::UnknownNode(_))
    ));
}

#[tokio::test]
async fn test_graceful_shutdown_reports_unmigrated_chunks() {
    let (overlay, transfer) = start(test_config("incomplete")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let chunks = overlay.chunk_create(5, None, Some(PEER_A)).await.unwrap();

    let mut stuck = vec![chunks[1], chunks[3]];
    stuck.sort();
    for chunk in &stuck {
        transfer.fail_chunk(*chunk, 100);
    }

    match overlay.node_shutdown(PEER_A, true).await {
        Err(OverlayError::ShutdownIncomplete { chunks: remaining }) => {
            assert_eq!(remaining, stuck)
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("shutdown should be incomplete"),
    }

    for chunk in &chunks {
        let owner = overlay.lookup_owner(*chunk).await.unwrap();
        if stuck.contains(chunk) {
            assert_eq!(owner, PEER_A);
        } else {
            assert_eq!(owner, PEER_B);
        }
    }
    let node = overlay.registry().get(PEER_A).await.unwrap();
    assert_eq!(node.status, NodeStatus::Leaving);

    // Back in service, it takes new chunks again
    overlay.node_reactivate(PEER_A).await.unwrap();
    let node = overlay.registry().get(PEER_A).await.unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    let fresh = overlay.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];
    assert_eq!(overlay.lookup_owner(fresh).await.unwrap(), PEER_A);
    assert!(matches!(
        overlay.node_reactivate(PEER_A).await,
        Err(OverlayError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_rejoined_node_continues_chunk_ids() {
    let (overlay, _) = start(test_config("rejoin")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let before = overlay.chunk_create(2, None, Some(PEER_A)).await.unwrap();

    expect_removed(overlay.node_shutdown(PEER_A, true).await.unwrap());
    join_cluster(&overlay, &[], &[PEER_A]).await;

    let after = overlay.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];
    assert_eq!(after.creator(), PEER_A);
    assert!(!before.contains(&after));
    assert_eq!(after.local_id(), 3);
    assert_eq!(overlay.lookup_owner(after).await.unwrap(), PEER_A);
    for chunk in &before {
        assert_eq!(overlay.lookup_owner(*chunk).await.unwrap(), PEER_B);
    }
}

#[tokio::test]
async fn test_graceful_shutdown_times_out() {
    let mut config = test_config("timeout");
    config.departure.shutdown_timeout_ms = 150;
    config.migration.transfer_timeout_ms = 5000;
    let (overlay, transfer) = start(config).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let mut chunks = overlay.chunk_create(3, None, Some(PEER_A)).await.unwrap();
    chunks.sort();
    transfer.set_delay(Some(Duration::from_secs(3)));

    match overlay.node_shutdown(PEER_A, true).await {
        Err(OverlayError::ShutdownIncomplete { chunks: remaining }) => {
            assert_eq!(remaining, chunks)
        }
        other => panic!("unexpected: {:?}", other.err()),
    }
    // Aborted transfers released their chunk locks
    transfer.set_delay(None);
    for chunk in &chunks {
        assert_eq!(overlay.lookup_owner(*chunk).await.unwrap(), PEER_A);
    }
    assert!(overlay.coordinator().manager().active_tasks().is_empty());
}

#[tokio::test]
async fn test_failure_without_backups_is_data_loss() {
    let (overlay, _) = start(test_config("dataloss")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let mut chunks = overlay.chunk_create(4, None, Some(PEER_A)).await.unwrap();
    chunks.sort();
    let survivor = overlay.chunk_create(1, None, Some(PEER_B)).await.unwrap()[0];

    let recovery = match overlay.node_shutdown(PEER_A, false).await.unwrap() {
        DepartureOutcome::Recovering(handle) => handle,
        DepartureOutcome::Removed { .. } => panic!("failure should start recovery"),
    };
    assert_eq!(recovery.node(), PEER_A);

    match recovery.wait().await {
        Err(OverlayError::DataLoss { chunks: lost }) => {
            let mut lost = lost;
            lost.sort();
            assert_eq!(lost, chunks);
        }
        other => panic!("unexpected: {:?}", other.err()),
    }

    for chunk in &chunks {
        assert!(matches!(
            overlay.lookup_owner(*chunk).await,
            Err(OverlayError::DataLoss { .. })
        ));
    }
    assert_eq!(overlay.lookup_owner(survivor).await.unwrap(), PEER_B);
    assert!(!overlay.node_listing().await.contains(PEER_A));

    let summary = overlay.metadata_summary(SummaryScope::All).unwrap();
    assert_eq!(summary.iter().map(|s| s.lost_chunk_count).sum::<usize>(), 4);
}

#[tokio::test]
async fn test_failure_promotes_backups() {
    let mut config = test_config("promote");
    config.placement.backup_count = 1;
    let (overlay, transfer) = start(config).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B, PEER_C]).await;
    let chunks = overlay.chunk_create(3, None, Some(PEER_A)).await.unwrap();

    let mut backups = Vec::new();
    for chunk in &chunks {
        let record = overlay.directory().record(*chunk).await.unwrap();
        assert_eq!(record.backups.len(), 1);
        assert_ne!(record.backups[0], PEER_A);
        backups.push(record.backups[0]);
    }
    transfer.set_unreachable(PEER_A, true);

    let recovery = match overlay.node_shutdown(PEER_A, false).await.unwrap() {
        DepartureOutcome::Recovering(handle) => handle,
        DepartureOutcome::Removed { .. } => panic!("failure should start recovery"),
    };
    let report = recovery.wait().await.unwrap();
    assert_eq!(report.promoted.len(), chunks.len());
    assert!(report.lost.is_empty());

    for (chunk, backup) in chunks.iter().zip(backups) {
        assert_eq!(overlay.lookup_owner(*chunk).await.unwrap(), backup);
        let record = overlay.directory().record(*chunk).await.unwrap();
        assert!(!record.backups.contains(&backup));
    }
}

#[tokio::test]
async fn test_stalled_promotion_does_not_block_lookups() {
    let mut config = test_config("stalled");
    config.placement.backup_count = 1;
    config.migration.transfer_timeout_ms = 100;
    let (overlay, transfer) = start(config).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let chunk = overlay.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];
    transfer.set_stall_promotions(true);

    let recovery = match overlay.node_shutdown(PEER_A, false).await.unwrap() {
        DepartureOutcome::Recovering(handle) => handle,
        DepartureOutcome::Removed { .. } => panic!("failure should start recovery"),
    };
    let lookup = tokio::time::timeout(Duration::from_secs(5), overlay.lookup_owner(chunk))
        .await
        .expect("lookup blocked behind a stalled promotion");
    assert!(matches!(lookup, Err(OverlayError::DataLoss { .. })));
    assert!(matches!(
        recovery.wait().await,
        Err(OverlayError::DataLoss { .. })
    ));
}

#[tokio::test]
async fn test_heartbeat_timeout_triggers_recovery() {
    let mut config = test_config("heartbeat");
    config.registry.heartbeat_timeout_secs = 0;
    let (overlay, _) = start(config).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A, PEER_B]).await;
    let chunk = overlay.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];

    tokio::time::sleep(Duration::from_millis(1100)).await;
    overlay.heartbeat(SUPERPEER_1).await.unwrap();
    overlay.heartbeat(PEER_B).await.unwrap();

    assert_eq!(overlay.check_heartbeats().await, vec![PEER_A]);
    assert!(matches!(
        overlay.heartbeat(PEER_A).await,
        Err(OverlayError::InvalidTransition { .. }) | Err(OverlayError::UnknownNode(_))
    ));
    // Blocks until recovery has settled the chunk
    assert!(matches!(
        overlay.lookup_owner(chunk).await,
        Err(OverlayError::DataLoss { .. })
    ));
}

#[tokio::test]
async fn test_superpeer_membership_keeps_metadata() {
    let (overlay, _) = start(test_config("membership")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A]).await;
    let chunks = overlay.chunk_create(20, None, Some(PEER_A)).await.unwrap();
    for (i, chunk) in chunks.iter().enumerate() {
        overlay
            .namereg(PEER_A.0, chunk.local_id(), &format!("name-{}", i))
            .unwrap();
    }
    for id in 1..=8u32 {
        overlay.tmp_create(id, 10 * id as u64).unwrap();
    }

    join_cluster(&overlay, &[SUPERPEER_2, NodeId(0xC181)], &[]).await;
    let summary = overlay.metadata_summary(SummaryScope::All).unwrap();
    assert_eq!(summary.len(), 3);
    assert_eq!(summary.iter().map(|s| s.chunk_count).sum::<usize>(), 20);
    assert_eq!(summary.iter().map(|s| s.name_count).sum::<usize>(), 20);
    assert_eq!(summary.iter().map(|s| s.temp_count).sum::<usize>(), 8);

    expect_removed(overlay.node_shutdown(SUPERPEER_1, true).await.unwrap());
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(overlay.resolve(&format!("name-{}", i)).unwrap(), *chunk);
        assert_eq!(overlay.lookup_owner(*chunk).await.unwrap(), PEER_A);
    }
    assert_eq!(overlay.tmp_status().total_bytes, (1..=8).map(|i| 10 * i).sum::<u64>());
    assert!(matches!(
        overlay.metadata_summary(SummaryScope::Superpeer(SUPERPEER_1)),
        Err(OverlayError::UnknownNode(_))
    ));
}

#[tokio::test]
async fn test_last_superpeer_cannot_leave() {
    let (overlay, _) = start(test_config("last_superpeer")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A]).await;
    assert!(matches!(
        overlay.node_shutdown(SUPERPEER_1, true).await,
        Err(OverlayError::NoSuperpeer)
    ));
    assert!(overlay.node_listing().await.contains(SUPERPEER_1));
}

#[tokio::test]
async fn test_remove_chunk_drops_names() {
    let (overlay, _) = start(test_config("remove")).await;
    join_cluster(&overlay, &[SUPERPEER_1], &[PEER_A]).await;
    let chunk = overlay.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];
    overlay.namereg(PEER_A.0, chunk.local_id(), "doomed").unwrap();

    let record = overlay.remove_chunk(chunk).await.unwrap();
    assert_eq!(record.owner, PEER_A);
    assert!(matches!(overlay.resolve("doomed"), Err(OverlayError::NotFound(_))));
    assert!(matches!(
        overlay.lookup_owner(chunk).await,
        Err(OverlayError::UnknownChunk(_))
    ));
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let config = test_config("restart");
    let data_dir = config.cluster.data_dir.clone();
    let (overlay, _) = start(config.clone()).await;
    join_cluster(&overlay, &[SUPERPEER_1, SUPERPEER_2], &[PEER_A, PEER_B]).await;
    let chunks = overlay.chunk_create(3, None, Some(PEER_A)).await.unwrap();
    overlay.namereg(PEER_A.0, chunks[0].local_id(), "kept").unwrap();
    overlay.chunk_migrate(chunks[2], PEER_B, PEER_A).await.unwrap();
    overlay.tmp_create(7, 70).unwrap();
    overlay.save().await.unwrap();
    drop(overlay);

    let (restored, _) = start(config).await;
    assert_eq!(restored.node_listing().await.len(), 4);
    assert_eq!(restored.resolve("kept").unwrap(), chunks[0]);
    assert_eq!(restored.lookup_owner(chunks[2]).await.unwrap(), PEER_B);
    assert_eq!(restored.tmp_status().total_bytes, 70);

    // Local counters continue where they left off
    let next = restored.chunk_create(1, None, Some(PEER_A)).await.unwrap()[0];
    assert!(!chunks.contains(&next));

    let _ = std::fs::remove_dir_all(&data_dir);
}

/// Commands in the order an operator script would issue them
#[tokio::test]
async fn test_operator_session() {
    let (overlay, _) = start(test_config("session")).await;
    join_cluster(
        &overlay,
        &[SUPERPEER_1, SUPERPEER_2, NodeId(0xC181)],
        &[PEER_A, PEER_B, PEER_C],
    )
    .await;

    let listing = overlay.nodelist().await;
    assert_eq!(listing.lines().count(), 6);
    assert_eq!(
        overlay.metadata_summary(SummaryScope::All).unwrap().len(),
        3
    );

    for peer in [PEER_A, PEER_A, PEER_A, PEER_B, PEER_C] {
        overlay.chunk_create(10, None, Some(peer)).await.unwrap();
    }
    for (key, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")] {
        overlay.namereg(PEER_A.0, key, name).unwrap();
    }
    overlay.namereg(PEER_B.0, 1, "f").unwrap();
    overlay.namereg(PEER_C.0, 2, "g").unwrap();

    for (id, size) in [(1, 100), (2, 200), (3, 50), (4, 300), (5, 150)] {
        overlay.tmp_create(id, size).unwrap();
    }
    assert!(matches!(overlay.tmp_create(3, 1), Err(OverlayError::Conflict(_))));
    assert_eq!(overlay.tmp_status().total_bytes, 800);

    overlay
        .chunk_migrate(ChunkId::new(PEER_A, 1), PEER_C, PEER_A)
        .await
        .unwrap();
    overlay
        .chunk_migrate(ChunkId::new(PEER_B, 4), PEER_A, PEER_B)
        .await
        .unwrap();
    assert_eq!(overlay.resolve_owner("a").await.unwrap(), PEER_C);
    assert_eq!(overlay.chunklist(PEER_C, false).await.unwrap().len(), 10);
    assert_eq!(overlay.chunklist(PEER_C, true).await.unwrap().len(), 11);

    expect_removed(overlay.node_shutdown(SUPERPEER_2, true).await.unwrap());
    let migrated = expect_removed(overlay.node_shutdown(PEER_B, true).await.unwrap());
    assert_eq!(migrated.len(), 9);

    let summary = overlay.metadata_summary(SummaryScope::All).unwrap();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary.iter().map(|s| s.chunk_count).sum::<usize>(), 50);
    assert_eq!(summary.iter().map(|s| s.name_count).sum::<usize>(), 7);
    assert_eq!(summary.iter().map(|s| s.temp_count).sum::<usize>(), 5);
    assert_ne!(overlay.resolve_owner("f").await.unwrap(), PEER_B);
}
