//! Pass-level behavior against an in-process relay.

mod common;

use common::{wait_for_event, Harness, Options};
use std::time::Duration;
use vaultsync_engine::{ItemStore, LocalItem, SyncError, SyncEvent};
use vaultsync_protocol::{now_millis, ClearMetadata, ItemType};

#[tokio::test]
async fn concurrent_edits_surface_as_one_conflict() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    let b = h.device();
    a.connect(&home).await;
    b.connect(&home).await;

    a.create(&home, "GitHub", "a1").await;
    a.engine.sync_vault(&home).await.unwrap();
    let id = a.only_item(&home).id;
    assert!(!id.is_provisional());

    let pulled = b.engine.sync_vault(&home).await.unwrap();
    assert_eq!(pulled.items_updated, 1);
    assert_eq!(b.engine.read_plaintext(&id).unwrap(), "a1");

    a.edit(&id, "GitHub", "a2").await;
    b.edit(&id, "GitHub", "b2").await;
    a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(h.relay.item(&id).unwrap().version, 2);

    let before = b.stored(&id).unwrap();
    let mut events = b.engine.subscribe();
    let status = b.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_conflicted, 1);
    assert_eq!(status.items_updated, 0);

    let conflicts = b.engine.conflicts();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.item_id, id);
    assert_eq!(conflict.local.data.as_deref(), Some("b2"));
    assert_eq!(conflict.local.version, 2);
    assert_eq!(conflict.server.data.as_deref(), Some("a2"));
    assert_eq!(conflict.server.version, 2);

    // The local copy is untouched until the user decides.
    assert_eq!(b.stored(&id).unwrap(), before);
    assert_eq!(h.relay.accepted_versions(&id), vec![1, 2]);

    match wait_for_event(&mut events, |e| matches!(e, SyncEvent::Conflict(_))).await {
        SyncEvent::Conflict(event) => assert_eq!(event.item_id, id),
        other => panic!("unexpected event {other:?}"),
    }

    // Edits are refused until the conflict is resolved.
    let err = b
        .engine
        .edit_item(&id, ClearMetadata::named("GitHub"), "b3")
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::ItemInConflict(id.clone()));

    // A second pass neither duplicates nor re-announces the conflict.
    let again = b.engine.sync_vault(&home).await.unwrap();
    assert_eq!(again.items_conflicted, 1);
    assert_eq!(b.engine.conflicts().len(), 1);
}

#[tokio::test]
async fn stale_edit_against_newer_relay_version_conflicts() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    let b = h.device();
    a.connect(&home).await;
    b.connect(&home).await;

    a.create(&home, "Bank", "v1").await;
    a.engine.sync_vault(&home).await.unwrap();
    let id = a.only_item(&home).id;
    b.engine.sync_vault(&home).await.unwrap();

    a.edit(&id, "Bank", "v2").await;
    a.engine.sync_vault(&home).await.unwrap();
    a.edit(&id, "Bank", "v3").await;
    a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(h.relay.item(&id).unwrap().version, 3);

    b.edit(&id, "Bank", "mine").await;
    let before = b.stored(&id).unwrap();
    assert_eq!(before.version, 2);
    assert_eq!(before.synced_version, Some(1));

    let status = b.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_conflicted, 1);
    let conflict = b.engine.conflict_tracker().get(&id).unwrap();
    assert_eq!(conflict.local.version, 2);
    assert_eq!(conflict.server.version, 3);
    assert_eq!(conflict.server.data.as_deref(), Some("v3"));
    assert_eq!(b.stored(&id).unwrap(), before);
    assert_eq!(h.relay_plaintext(&a, &id), "v3");
}

#[tokio::test]
async fn converged_pass_is_idempotent() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    a.connect(&home).await;

    a.create(&home, "GitHub", "one").await;
    a.create(&home, "Bank", "two").await;
    let first = a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(first.items_updated, 2);
    assert_eq!(h.relay.item_count(), 2);

    let items = a.engine.items(&home).unwrap();
    let second = a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(second.items_updated, 0);
    assert_eq!(second.items_conflicted, 0);
    assert!(second.errors.is_empty());
    assert_eq!(a.engine.items(&home).unwrap(), items);
    for item in &items {
        assert_eq!(h.relay.accepted_versions(&item.id), vec![1]);
    }
}

#[tokio::test]
async fn accepted_versions_strictly_increase() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    let b = h.device();
    a.connect(&home).await;
    b.connect(&home).await;

    a.create(&home, "Shared", "0").await;
    a.engine.sync_vault(&home).await.unwrap();
    let id = a.only_item(&home).id;
    b.engine.sync_vault(&home).await.unwrap();

    for round in 0..3 {
        a.edit(&id, "Shared", &format!("a{round}")).await;
        a.engine.sync_vault(&home).await.unwrap();
        b.engine.sync_vault(&home).await.unwrap();
        b.edit(&id, "Shared", &format!("b{round}")).await;
        b.engine.sync_vault(&home).await.unwrap();
        a.engine.sync_vault(&home).await.unwrap();
    }

    let versions = h.relay.accepted_versions(&id);
    assert_eq!(versions, (1..=7).collect::<Vec<_>>());
    assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(a.engine.read_plaintext(&id).unwrap(), "b2");
    assert!(b.engine.conflicts().is_empty());
}

#[tokio::test]
async fn undecryptable_item_does_not_fail_the_pass() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    let b = h.device();
    let foreign = h.device_with(Options {
        foreign_key: true,
        ..Options::default()
    });
    a.connect(&home).await;
    b.connect(&home).await;
    foreign.connect(&home).await;

    foreign.create(&home, "Foreign", "unreadable").await;
    foreign.engine.sync_vault(&home).await.unwrap();
    let foreign_id = foreign.only_item(&home).id;

    a.create(&home, "Bank", "readable").await;
    a.engine.sync_vault(&home).await.unwrap();

    let status = b.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 1);
    assert!(status.has_error_for(&foreign_id));
    assert!(b.stored(&foreign_id).is_none());
    assert_eq!(
        b.only_item(&home).clear_metadata,
        ClearMetadata::named("Bank")
    );
}

#[tokio::test]
async fn deletes_propagate_through_the_relay() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    let b = h.device();
    a.connect(&home).await;
    b.connect(&home).await;

    a.create(&home, "Old", "secret").await;
    a.engine.sync_vault(&home).await.unwrap();
    let id = a.only_item(&home).id;
    b.engine.sync_vault(&home).await.unwrap();

    a.engine.delete_item(&id).await.unwrap();
    assert!(a.engine.items(&home).unwrap().is_empty());
    assert!(a.stored(&id).unwrap().deleted);

    let status = a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 1);
    assert!(h.relay.item(&id).is_none());
    assert!(a.stored(&id).is_none());

    let status = b.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 1);
    assert!(b.stored(&id).is_none());
}

#[tokio::test]
async fn never_pushed_item_deletes_locally() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    a.connect(&home).await;

    let id = a.create(&home, "Draft", "x").await;
    assert!(id.is_provisional());
    a.engine.delete_item(&id).await.unwrap();
    assert!(a.store.is_empty());

    let status = a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 0);
    assert_eq!(h.relay.item_count(), 0);
}

#[tokio::test]
async fn offline_edits_push_after_connect() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();

    a.create(&home, "Offline", "typed on a plane").await;
    assert_eq!(
        a.engine.sync_vault(&home).await.unwrap_err(),
        SyncError::NotConnected
    );
    assert_eq!(a.engine.status().errors.len(), 1);

    a.connect(&home).await;
    let status = a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 1);
    let item = a.only_item(&home);
    assert!(!item.dirty);
    assert_eq!(item.synced_version, Some(1));
    assert_eq!(h.relay_plaintext(&a, &item.id), "typed on a plane");
}

#[tokio::test]
async fn lost_tracking_with_identical_content_adopts_relay_version() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device();
    let b = h.device();
    a.connect(&home).await;
    b.connect(&home).await;

    a.create(&home, "GitHub", "same").await;
    a.engine.sync_vault(&home).await.unwrap();
    let id = a.only_item(&home).id;

    let copy = |secret: &str| LocalItem {
        id: id.clone(),
        vault_id: home.clone(),
        item_type: ItemType::Login,
        encrypted_payload: b.encrypt(secret),
        clear_metadata: ClearMetadata::named("GitHub"),
        version: 0,
        updated_at: now_millis(),
        dirty: true,
        synced_version: None,
        deleted: false,
    };
    b.store.put(copy("same")).unwrap();

    let status = b.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 1);
    assert_eq!(status.items_conflicted, 0);
    let adopted = b.stored(&id).unwrap();
    assert!(!adopted.dirty);
    assert_eq!(adopted.synced_version, Some(1));
    assert_eq!(h.relay.accepted_versions(&id), vec![1]);

    // Differing content is never silently overwritten.
    let c = h.device();
    c.connect(&home).await;
    c.store.put(LocalItem {
        encrypted_payload: c.encrypt("different"),
        ..copy("unused")
    })
    .unwrap();
    let status = c.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_conflicted, 1);
    assert_eq!(c.engine.read_plaintext(&id).unwrap(), "different");
}

#[tokio::test]
async fn edit_waiting_on_the_create_push_lands_on_the_relay_id() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device_with(Options::slow(Duration::from_millis(100)));
    a.connect(&home).await;
    let mut events = a.engine.subscribe();

    let provisional = a.create(&home, "GitHub", "v1").await;
    let pass = tokio::spawn({
        let engine = a.engine.clone();
        let home = home.clone();
        async move { engine.sync_vault(&home).await }
    });
    // The pass is pushing the create; the edit queues behind it.
    tokio::time::sleep(Duration::from_millis(150)).await;
    a.edit(&provisional, "GitHub", "v2").await;
    pass.await.unwrap().unwrap();

    let id = match wait_for_event(&mut events, |e| matches!(e, SyncEvent::ItemIdAssigned { .. })).await {
        SyncEvent::ItemIdAssigned {
            provisional: assigned_from,
            id,
            vault_id,
        } => {
            assert_eq!(assigned_from, provisional);
            assert_eq!(vault_id, home);
            id
        }
        other => panic!("unexpected event {other:?}"),
    };
    assert!(!id.is_provisional());
    assert_eq!(a.engine.current_id(&provisional), id);
    assert_eq!(a.engine.read_plaintext(&provisional).unwrap(), "v2");
    let item = a.only_item(&home);
    assert_eq!(item.id, id);
    assert!(item.dirty);

    a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(h.relay_plaintext(&a, &id), "v2");
    assert_eq!(h.relay.accepted_versions(&id), vec![1, 2]);

    a.engine.delete_item(&provisional).await.unwrap();
    a.engine.sync_vault(&home).await.unwrap();
    assert!(h.relay.item(&id).is_none());
    assert!(a.engine.items(&home).unwrap().is_empty());
}

#[tokio::test]
async fn rejected_token_mid_pass_still_records_committed_creates() {
    let h = Harness::new();
    let home = h.home();
    let a = h.device_with(Options {
        unauthenticated_create: Some(2),
        ..Options::default()
    });
    a.connect(&home).await;
    let first = a.create(&home, "GitHub", "one").await;
    let second = a.create(&home, "GitLab", "two").await;

    let err = a.engine.sync_vault(&home).await.unwrap_err();
    assert!(err.is_auth(), "{err:?}");
    assert_eq!(h.relay.item_count(), 1);
    let recorded = [&first, &second]
        .into_iter()
        .filter(|id| !a.engine.current_id(id).is_provisional())
        .count();
    assert_eq!(recorded, 1);

    a.connect(&home).await;
    let status = a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 1);
    assert_eq!(h.relay.item_count(), 2);
    assert_eq!(a.engine.items(&home).unwrap().len(), 2);
    assert_eq!(a.engine.read_plaintext(&first).unwrap(), "one");
    assert_eq!(a.engine.read_plaintext(&second).unwrap(), "two");

    // Nothing left over for a third pass.
    let status = a.engine.sync_vault(&home).await.unwrap();
    assert_eq!(status.items_updated, 0);
    assert_eq!(h.relay.item_count(), 2);
}
