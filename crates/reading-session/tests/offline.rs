mod common;

use std::time::Duration;

use common::{guest, settle, user, World};
use reading_session::local_store::load_session;
use reading_session::{
    AccessMethod, Card, ReadingStep, SelectedCard, SessionError, SessionEvent, SessionMode,
    SessionPatch, SyncConfig, DEFAULT_DECK_ID,
};

fn card(n: u32) -> SelectedCard {
    SelectedCard {
        card: Card::new(format!("card-{n}"), format!("Card {n}")),
        position: n,
        is_reversed: n % 2 == 1,
    }
}

#[tokio::test]
async fn local_session_migrates_once_the_store_is_back() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));
    world.rows.set_online(false);

    let local_id = settle(host.engine.create(None)).await;
    assert!(local_id.starts_with("local_"));
    assert_eq!(host.engine.mode(), SessionMode::Local);
    assert!(host.engine.is_offline());
    assert!(host.engine.is_host());

    let fresh = host.engine.snapshot().expect("snapshot");
    assert_eq!(fresh.deck_id, DEFAULT_DECK_ID);
    assert_eq!(fresh.reading_step, ReadingStep::Setup);

    for n in 0..3 {
        settle(host.engine.draw_card(card(n)))
            .await
            .expect("draw while offline");
    }
    assert_eq!(host.engine.snapshot().expect("snapshot").selected_cards.len(), 3);
    let stored_locally = load_session(host.local.as_ref(), &local_id)
        .expect("local read")
        .expect("local copy");
    assert_eq!(stored_locally.selected_cards.len(), 3);

    // Still offline: the cycle leaves the session where it is.
    let report = settle(host.engine.run_sync_cycle()).await;
    assert_eq!(report.migrated_to, None);
    assert_eq!(world.rows.session_count(), 0);

    world.rows.set_online(true);
    let mut events = host.engine.subscribe();
    let report = settle(host.engine.run_sync_cycle()).await;
    let remote_id = report.migrated_to.expect("migrated");
    assert!(!remote_id.starts_with("local_"));

    assert_eq!(host.engine.session_id().as_deref(), Some(remote_id.as_str()));
    assert_eq!(host.engine.mode(), SessionMode::Remote);
    assert!(!host.engine.is_offline());

    let remote = world.rows.session(&remote_id).expect("remote row");
    assert_eq!(remote.selected_cards.len(), 3);
    assert_eq!(remote.reading_step, ReadingStep::Setup);
    assert_eq!(Some(remote), host.engine.snapshot());

    assert!(load_session(host.local.as_ref(), &local_id)
        .expect("local read")
        .is_none());
    assert!(load_session(host.local.as_ref(), &remote_id)
        .expect("local read")
        .is_some());

    let migrated = settle(async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Migrated { from, to }) => break Some((from, to)),
                Ok(_) => continue,
                Err(_) => break None,
            }
        }
    })
    .await;
    assert_eq!(migrated, Some((local_id, remote_id.clone())));

    let participants = world.rows.participants(&remote_id);
    assert_eq!(participants.len(), 1);
    assert!(participants[0].is_host());
}

#[tokio::test]
async fn local_session_can_be_reopened_from_storage() {
    let world = World::new();
    let host = world.client(guest("Ada"));
    world.rows.set_online(false);

    let local_id = settle(host.engine.create(Some("thoth"))).await;
    settle(host.engine.update(SessionPatch::question("Which path?")))
        .await
        .expect("local update");
    host.engine.cleanup().await;
    assert_eq!(host.engine.mode(), SessionMode::Idle);

    settle(host.engine.join(&local_id, AccessMethod::Invite))
        .await
        .expect("reopen local");
    let record = host.engine.snapshot().expect("snapshot");
    assert_eq!(record.deck_id, "thoth");
    assert_eq!(record.question.as_deref(), Some("Which path?"));
    assert!(host.engine.is_host());

    let err = settle(host.engine.join("local_missing", AccessMethod::Invite))
        .await
        .expect_err("unknown local id");
    assert!(matches!(err, SessionError::SessionNotFound(_)));
}

#[tokio::test]
async fn guest_rejoins_from_cache_and_reconnects() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));
    let bea = world.client(guest("Bea"));

    let id = settle(host.engine.create(None)).await;
    settle(host.engine.update(SessionPatch::step(ReadingStep::AskQuestion)))
        .await
        .expect("host update");
    settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect("guest joins");
    bea.engine.cleanup().await;

    world.rows.set_online(false);
    settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect("joins from cache");
    assert!(bea.engine.is_offline());
    assert_eq!(
        bea.engine.snapshot().map(|r| r.reading_step),
        Some(ReadingStep::AskQuestion)
    );

    let report = settle(bea.engine.run_sync_cycle()).await;
    assert!(!report.reconnected);

    world.rows.set_online(true);
    let report = settle(bea.engine.run_sync_cycle()).await;
    assert!(report.reconnected);
    assert!(!bea.engine.is_offline());
    assert!(bea.engine.participant_id().is_some());
}

#[tokio::test]
async fn join_without_cache_reports_network_unavailable() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));
    let bea = world.client(guest("Bea"));
    let id = settle(host.engine.create(None)).await;

    world.rows.set_online(false);
    let err = settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect_err("nothing cached");
    assert!(matches!(err, SessionError::NetworkUnavailable(_)));
    assert_eq!(bea.engine.mode(), SessionMode::Idle);
}

#[tokio::test]
async fn guest_sync_cycle_resyncs_from_the_row_store() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));
    let bea = world.client(guest("Bea"));

    let id = settle(host.engine.create(None)).await;
    settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect("guest joins");
    settle(host.engine.update(SessionPatch {
        interpretation: Some(Some("The tower falls".into())),
        ..SessionPatch::default()
    }))
    .await
    .expect("host update");

    let report = settle(bea.engine.run_sync_cycle()).await;
    assert!(report.resynced);
    assert_eq!(
        bea.engine.snapshot().and_then(|r| r.interpretation).as_deref(),
        Some("The tower falls")
    );

    let report = settle(host.engine.run_sync_cycle()).await;
    assert!(!report.resynced);
}

#[tokio::test]
async fn stale_session_is_expired_by_host_only() {
    let world = World::new();
    let config = SyncConfig {
        participant_stale_after_ms: 0,
        ..SyncConfig::default()
    };
    let host = world.client_with(user("u-ada", "Ada"), config.clone(), common::FakeMedia::new());
    let bea = world.client_with(guest("Bea"), config, common::FakeMedia::new());

    let id = settle(host.engine.create(None)).await;
    settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect("guest joins");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = settle(bea.engine.run_sync_cycle()).await;
    assert!(!report.expired);
    assert!(world.rows.session(&id).expect("row").is_active);

    let report = settle(host.engine.run_sync_cycle()).await;
    assert!(report.expired);
    assert!(!world.rows.session(&id).expect("row").is_active);

    // The next cycle does not re-check until the interval has passed.
    let report = settle(host.engine.run_sync_cycle()).await;
    assert!(!report.expired);
}

#[tokio::test(start_paused = true)]
async fn host_edits_made_offline_are_written_back_on_reconnect() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));
    let id = settle(host.engine.create(None)).await;
    let mut events = host.engine.subscribe();

    world.rows.set_online(false);
    settle(host.engine.update(SessionPatch::question("lost?")))
        .await
        .expect("update degrades while offline");
    assert!(host.engine.is_offline());
    assert_eq!(host.engine.mode(), SessionMode::Remote);
    let went_offline = settle(async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Offline) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await;
    assert!(went_offline);
    assert_eq!(world.rows.session(&id).expect("row").question, None);

    settle(host.engine.update(SessionPatch::step(ReadingStep::Drawing)))
        .await
        .expect("second offline update");
    let report = settle(host.engine.run_sync_cycle()).await;
    assert!(!report.reconnected);

    // Well past the resync window: the edits must not lose to the stale row.
    tokio::time::sleep(Duration::from_secs(11)).await;
    world.rows.set_online(true);
    let report = settle(host.engine.run_sync_cycle()).await;
    assert!(report.reconnected);
    assert!(!host.engine.is_offline());

    let row = world.rows.session(&id).expect("row");
    assert_eq!(row.question.as_deref(), Some("lost?"));
    assert_eq!(row.reading_step, ReadingStep::Drawing);
    let view = host.engine.snapshot().expect("snapshot");
    assert_eq!(view.question.as_deref(), Some("lost?"));
    assert_eq!(view.reading_step, ReadingStep::Drawing);

    settle(host.engine.update(SessionPatch::question("back online")))
        .await
        .expect("online update");
    assert_eq!(
        world.rows.session(&id).and_then(|r| r.question).as_deref(),
        Some("back online")
    );
    host.engine.cleanup().await;
}
