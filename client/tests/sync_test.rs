//! Sync pass behavior against a fake server.

mod common;

use common::{batch, farm, FakeRemote, Harness};
use farmsync_client::{RemoteError, SyncEvent, SyncOutcome};
use farmsync_engine::{Clock, EntityKind, FailureKind, QueueStatus, SyncSummary};
use serde_json::json;

async fn pass(h: &Harness) -> SyncSummary {
    match h.client.trigger_sync().await.unwrap() {
        SyncOutcome::Completed(summary) => summary,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

#[tokio::test]
async fn offline_records_reach_the_server_parents_first() {
    let h = Harness::new().await;
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    let b = h.client.create(EntityKind::Batch, batch(&f.local_id)).await.unwrap();

    let summary = pass(&h).await;
    assert_eq!(summary.totals().succeeded, 2);
    assert_eq!(summary.totals().failed, 0);
    assert!(!summary.cancelled);

    let calls = h.remote.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].kind, EntityKind::Farm);
    assert_eq!(calls[1].kind, EntityKind::Batch);
    assert_eq!(calls[1].body["farmId"], "100");
    assert_eq!(calls[1].body["initialQuantity"], 500);
    assert_eq!(calls[1].body["clientId"], b.local_id.as_str());

    let f = h.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    let b = h.client.get(EntityKind::Batch, &b.local_id, false).await.unwrap();
    assert_eq!(f.server_id.as_deref(), Some("100"));
    assert_eq!(b.server_id.as_deref(), Some("200"));
    assert!(f.is_synced && b.is_synced);
    assert!(!f.needs_sync && !b.needs_sync);
    // Stored references stay local
    assert_eq!(b.data["farm_ref"], f.local_id.as_str());

    let status = h.client.sync_status().await;
    assert_eq!(status.pending, 0);
    assert_eq!(status.failed, 0);
    assert_eq!(status.per_kind[&EntityKind::Farm].synced, 1);
}

#[tokio::test]
async fn children_wait_for_their_parent() {
    let h = Harness::new().await;
    h.remote
        .fail_next(EntityKind::Farm, RemoteError::Transient("connection reset".into()));

    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    let b = h.client.create(EntityKind::Batch, batch(&f.local_id)).await.unwrap();

    let first = pass(&h).await;
    assert_eq!(first.kind(EntityKind::Farm).failed, 1);
    assert_eq!(first.kind(EntityKind::Batch).failed, 1);
    assert!(h.remote.calls_for(EntityKind::Batch).is_empty());

    let waiting = h
        .client
        .queue()
        .dequeue_batch(QueueStatus::Failed, Some(EntityKind::Batch), None)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].failure_kind, Some(FailureKind::UnresolvedDependency));
    assert_eq!(waiting[0].retry_count, 0);

    let farm_entry = h
        .client
        .queue()
        .dequeue_batch(QueueStatus::Failed, Some(EntityKind::Farm), None)
        .await
        .unwrap();
    assert_eq!(farm_entry[0].failure_kind, Some(FailureKind::Transient));
    assert_eq!(farm_entry[0].retry_count, 1);
    assert!(farm_entry[0].next_attempt_at.unwrap() > h.clock.now());

    // The farm is still backing off, so the batch can't go yet
    let second = pass(&h).await;
    assert_eq!(second.kind(EntityKind::Farm).attempted, 0);
    assert_eq!(second.kind(EntityKind::Batch).failed, 1);

    h.skip_backoff();
    let third = pass(&h).await;
    assert_eq!(third.totals().succeeded, 2);

    let sent = h.remote.calls_for(EntityKind::Batch);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body["farmId"], "100");

    let b = h.client.get(EntityKind::Batch, &b.local_id, false).await.unwrap();
    assert_eq!(b.server_id.as_deref(), Some("200"));
}

#[tokio::test]
async fn rejected_entries_wait_for_a_manual_retry() {
    let h = Harness::new().await;
    h.remote.fail_next(
        EntityKind::Farm,
        RemoteError::Rejected {
            status: 422,
            message: "name taken".into(),
        },
    );
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();

    let mut events = h.client.subscribe();
    pass(&h).await;

    h.skip_backoff();
    pass(&h).await;
    assert_eq!(h.remote.calls_for(EntityKind::Farm).len(), 1);

    let mut saw_rejection = false;
    while let Ok(event) = events.receiver.try_recv() {
        if let SyncEvent::EntryFailed { failure, .. } = event {
            assert_eq!(failure, FailureKind::Rejected);
            saw_rejection = true;
        }
    }
    assert!(saw_rejection);

    assert_eq!(h.client.retry_failed(None).await.unwrap(), 1);
    assert_eq!(pass(&h).await.totals().succeeded, 1);

    let f = h.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    assert!(f.is_synced);
}

#[tokio::test]
async fn transient_failures_park_at_the_retry_ceiling() {
    let h = Harness::new().await;
    let max = h.client.driver().settings().backoff.max_attempts;
    for _ in 0..max {
        h.remote
            .fail_next(EntityKind::Farm, RemoteError::Transient("503".into()));
    }
    h.client.create(EntityKind::Farm, farm("North")).await.unwrap();

    for _ in 0..max {
        pass(&h).await;
        h.skip_backoff();
    }
    // Parked: no further attempts
    pass(&h).await;
    assert_eq!(h.remote.calls_for(EntityKind::Farm).len(), max as usize);

    let parked = h
        .client
        .queue()
        .dequeue_batch(QueueStatus::Failed, Some(EntityKind::Farm), None)
        .await
        .unwrap();
    assert_eq!(parked[0].retry_count, max);

    assert_eq!(h.client.retry_failed(None).await.unwrap(), 0);
    assert_eq!(h.client.clear_failed().await.unwrap(), 1);
    assert_eq!(h.client.sync_status().await.failed, 0);
}

#[tokio::test]
async fn only_one_pass_runs_at_a_time() {
    let h = Harness::with_remote(FakeRemote::gated()).await;
    h.client.create(EntityKind::Farm, farm("North")).await.unwrap();

    let first = h.client.trigger_sync();
    let second = async {
        h.remote.entered.notified().await;
        let running = h.client.sync_status().await.running;
        let outcome = h.client.trigger_sync().await.unwrap();
        h.remote.release(1);
        (running, outcome)
    };
    let (first, (running, second)) = futures::join!(first, second);

    assert!(running);
    assert_eq!(second, SyncOutcome::AlreadyInProgress);
    assert_eq!(first.unwrap().summary().unwrap().totals().succeeded, 1);
    assert_eq!(h.remote.calls().len(), 1);
    assert!(!h.client.sync_status().await.running);
}

#[tokio::test]
async fn cancel_stops_between_entries() {
    let h = Harness::with_remote(FakeRemote::gated()).await;
    h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    h.client.create(EntityKind::Farm, farm("South")).await.unwrap();

    let first = h.client.trigger_sync();
    let cancel = async {
        h.remote.entered.notified().await;
        h.client.cancel_sync();
        h.remote.release(1);
    };
    let (first, ()) = futures::join!(first, cancel);

    let summary = first.unwrap().summary().cloned().unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.totals().succeeded, 1);
    assert_eq!(h.client.sync_status().await.pending, 1);

    h.remote.release(1);
    let rest = pass(&h).await;
    assert!(!rest.cancelled);
    assert_eq!(rest.totals().succeeded, 1);
}

#[tokio::test]
async fn losing_the_connection_ends_the_pass() {
    let h = Harness::with_remote(FakeRemote::gated()).await;
    h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    h.client.create(EntityKind::Farm, farm("South")).await.unwrap();

    let first = h.client.trigger_sync();
    let drop_link = async {
        h.remote.entered.notified().await;
        h.connectivity.set_online(false);
        h.remote.release(1);
    };
    let (first, ()) = futures::join!(first, drop_link);
    assert!(first.unwrap().summary().unwrap().cancelled);

    assert_eq!(h.client.trigger_sync().await.unwrap(), SyncOutcome::Offline);
    assert_eq!(h.remote.calls().len(), 1);
    assert_eq!(h.client.sync_status().await.pending, 1);
}

#[tokio::test]
async fn edits_before_the_first_sync_become_updates() {
    let h = Harness::new().await;
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    h.client
        .update(EntityKind::Farm, &f.local_id, json!({"capacity": 1200}))
        .await
        .unwrap();

    assert_eq!(pass(&h).await.totals().succeeded, 2);

    let calls = h.remote.calls();
    assert_eq!(calls[0].method, "create");
    assert_eq!(calls[1].method, "update");
    assert_eq!(calls[1].server_id.as_deref(), Some("100"));
    assert_eq!(calls[1].body["capacity"], 1200);

    let f = h.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    assert!(f.is_synced);
    assert!(!f.needs_sync);
}

#[tokio::test]
async fn delete_after_create_reaches_the_server() {
    let h = Harness::new().await;
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    h.client.delete(EntityKind::Farm, &f.local_id).await.unwrap();

    pass(&h).await;
    let methods: Vec<_> = h.remote.calls().iter().map(|c| c.method).collect();
    assert_eq!(methods, ["create", "delete"]);
    assert_eq!(h.remote.calls()[1].server_id.as_deref(), Some("100"));
}

#[tokio::test]
async fn never_synced_delete_completes_locally() {
    let h = Harness::new().await;
    let f = h
        .client
        .store()
        .create(EntityKind::Farm, farm("Scratch"), true)
        .await
        .unwrap();
    h.client.delete(EntityKind::Farm, &f.local_id).await.unwrap();

    let summary = pass(&h).await;
    assert_eq!(summary.totals().succeeded, 1);
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.client.sync_status().await.pending, 0);
}

#[tokio::test]
async fn a_pass_announces_itself() {
    let h = Harness::new().await;
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    let mut events = h.client.subscribe();

    pass(&h).await;

    assert_eq!(events.recv().await, Some(SyncEvent::PassStarted));
    match events.recv().await {
        Some(SyncEvent::EntrySynced {
            kind,
            local_id,
            server_id,
            ..
        }) => {
            assert_eq!(kind, EntityKind::Farm);
            assert_eq!(local_id, f.local_id);
            assert_eq!(server_id.as_deref(), Some("100"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    match events.recv().await {
        Some(SyncEvent::PassCompleted { summary }) => {
            assert_eq!(summary.totals().succeeded, 1)
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn reconnecting_triggers_a_pass() {
    let h = Harness::new().await;
    h.connectivity.set_online(false);
    let listener = h.client.driver().spawn_connectivity_listener();
    h.client.create(EntityKind::Farm, farm("North")).await.unwrap();

    let mut events = h.client.subscribe();
    h.connectivity.set_online(true);

    loop {
        match events.recv().await {
            Some(SyncEvent::PassCompleted { summary }) => {
                assert_eq!(summary.totals().succeeded, 1);
                break;
            }
            Some(_) => continue,
            None => panic!("event hub closed"),
        }
    }
    listener.abort();
    assert_eq!(h.remote.calls().len(), 1);
}

#[tokio::test]
async fn edits_to_a_deleted_record_are_ignored() {
    let h = Harness::new().await;
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    pass(&h).await;

    h.client.delete(EntityKind::Farm, &f.local_id).await.unwrap();
    let affected = h
        .client
        .update(EntityKind::Farm, &f.local_id, json!({"capacity": 5}))
        .await
        .unwrap();
    assert_eq!(affected, 0);

    let summary = pass(&h).await;
    assert_eq!(summary.totals().failed, 0);
    let methods: Vec<_> = h.remote.calls().iter().map(|c| c.method).collect();
    assert_eq!(methods, ["create", "delete"]);

    let f = h.client.get(EntityKind::Farm, &f.local_id, true).await.unwrap();
    assert!(f.data.get("capacity").is_none());
}

#[tokio::test]
async fn entries_stuck_in_syncing_are_sent_again() {
    let h = Harness::new().await;
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();

    let entry = h
        .client
        .queue()
        .dequeue_batch(QueueStatus::Pending, Some(EntityKind::Farm), None)
        .await
        .unwrap()
        .remove(0);
    h.client
        .queue()
        .mark_status(entry.id, QueueStatus::Syncing, None)
        .await
        .unwrap();

    // Still inside the grace window: left alone
    let early = pass(&h).await;
    assert_eq!(early.reset_stuck, 0);
    assert!(h.remote.calls().is_empty());

    h.clock.advance(chrono::Duration::minutes(10));
    let summary = pass(&h).await;
    assert_eq!(summary.reset_stuck, 1);
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.totals().succeeded, 1);
    assert_eq!(h.remote.calls_for(EntityKind::Farm).len(), 1);

    let entry = h.client.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Synced);
    assert_eq!(entry.retry_count, 1);

    let f = h.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    assert_eq!(f.server_id.as_deref(), Some("100"));
    assert!(!f.needs_sync);
}

#[tokio::test]
async fn acknowledging_one_entry_keeps_later_edits_pending() {
    let h = Harness::new().await;
    let f = h.client.create(EntityKind::Farm, farm("North")).await.unwrap();
    h.client
        .update(EntityKind::Farm, &f.local_id, json!({"capacity": 800}))
        .await
        .unwrap();

    let entries = h
        .client
        .queue()
        .dequeue_batch(QueueStatus::Pending, Some(EntityKind::Farm), None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);

    let cleared = h
        .client
        .store()
        .mark_synced(EntityKind::Farm, &f.local_id, Some("100"), Some(entries[0].id))
        .await
        .unwrap();
    assert_eq!(cleared, 0);

    let still = h.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    assert!(still.needs_sync);
    assert!(!still.is_synced);

    // A server copy must not overwrite the queued edit
    h.client
        .store()
        .assign_server_id(EntityKind::Farm, &f.local_id, "100")
        .await
        .unwrap();
    h.remote.set_listed(
        EntityKind::Farm,
        vec![json!({"id": "100", "name": "North (server)", "organizationId": common::ORG})],
    );
    let report = h.client.refresh(EntityKind::Farm).await;
    assert_eq!(report.skipped, 1);
    let kept = h.client.get(EntityKind::Farm, &f.local_id, false).await.unwrap();
    assert_eq!(kept.data["capacity"], 800);
    assert_eq!(kept.data["name"], "North");
}
