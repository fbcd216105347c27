mod common;

use common::{eventually, guest, settle, user, FakeMedia, World};
use reading_session::{AccessMethod, CallEvent, LinkState, SessionError, SessionEvent, SyncConfig};

fn connected(peers: &[(String, LinkState)], remote: &str) -> bool {
    peers
        .iter()
        .any(|(id, state)| id == remote && *state == LinkState::Connected)
}

#[tokio::test]
async fn call_membership_follows_join_and_host_leave() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));
    let bea = world.client(guest("Bea"));

    let id = settle(host.engine.create(None)).await;
    settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect("guest joins");
    let host_id = host.engine.participant_id().expect("host participant");
    let bea_id = bea.engine.participant_id().expect("guest participant");

    settle(host.engine.join_call()).await.expect("host starts call");
    assert!(host.engine.in_call());
    assert!(host.media.has_local_media_now());
    let call = world.rows.session(&id).expect("row").call_state();
    assert!(call.is_active);
    assert_eq!(call.host_participant_id.as_deref(), Some(host_id.as_str()));
    assert_eq!(call.participants, vec![host_id.clone()]);

    eventually("guest sees the call", || {
        bea.engine
            .snapshot()
            .map(|r| r.call_state().is_active)
            .unwrap_or(false)
    })
    .await;
    settle(bea.engine.join_call()).await.expect("guest joins call");
    eventually("host records both members", || {
        world
            .rows
            .session(&id)
            .map(|r| r.call_state().participants == vec![host_id.clone(), bea_id.clone()])
            .unwrap_or(false)
    })
    .await;

    settle(host.engine.leave_call()).await.expect("host leaves");
    assert!(!host.engine.in_call());
    assert!(!host.media.has_local_media_now());
    eventually("guest sees the call end", || {
        bea.engine
            .snapshot()
            .map(|r| {
                let call = r.call_state();
                !call.is_active && call.participants.is_empty()
            })
            .unwrap_or(false)
    })
    .await;
    eventually("guest drops the host link", || {
        bea.engine.call_peers().iter().all(|(id, _)| id != &host_id)
    })
    .await;
}

#[tokio::test]
async fn peers_negotiate_over_the_session_channel() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));
    let bea = world.client(guest("Bea"));

    let id = settle(host.engine.create(None)).await;
    settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect("guest joins");
    let host_id = host.engine.participant_id().expect("host participant");
    let bea_id = bea.engine.participant_id().expect("guest participant");

    settle(host.engine.join_call()).await.expect("host starts call");
    eventually("guest sees the call", || {
        bea.engine
            .snapshot()
            .map(|r| r.call_state().is_active)
            .unwrap_or(false)
    })
    .await;
    settle(bea.engine.join_call()).await.expect("guest joins call");

    eventually("host link connected", || {
        connected(&host.engine.call_peers(), &bea_id)
    })
    .await;
    eventually("guest link connected", || {
        connected(&bea.engine.call_peers(), &host_id)
    })
    .await;

    settle(bea.engine.leave_call()).await.expect("guest leaves");
    assert!(bea.engine.call_peers().is_empty());
    eventually("host closes the guest link", || host.engine.call_peers().is_empty()).await;
    assert!(host.engine.in_call());
    eventually("guest removed from call", || {
        world
            .rows
            .session(&id)
            .map(|r| {
                let call = r.call_state();
                call.is_active && call.participants == vec![host_id.clone()]
            })
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn failed_link_is_reported_and_dropped() {
    let world = World::new();
    let host = world.client_with(user("u-ada", "Ada"), SyncConfig::default(), FakeMedia::failing());
    let bea = world.client(guest("Bea"));

    let id = settle(host.engine.create(None)).await;
    settle(bea.engine.join(&id, AccessMethod::Invite))
        .await
        .expect("guest joins");
    let bea_id = bea.engine.participant_id().expect("guest participant");
    let mut events = host.engine.subscribe();

    settle(host.engine.join_call()).await.expect("host starts call");
    eventually("guest sees the call", || {
        bea.engine
            .snapshot()
            .map(|r| r.call_state().is_active)
            .unwrap_or(false)
    })
    .await;
    settle(bea.engine.join_call()).await.expect("guest joins call");

    let failed = settle(async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Call(CallEvent::PeerFailed { participant_id, .. })) => {
                    break Some(participant_id)
                }
                Ok(_) => continue,
                Err(_) => break None,
            }
        }
    })
    .await;
    assert_eq!(failed, Some(bea_id));
    eventually("failed link removed", || host.engine.call_peers().is_empty()).await;
    assert!(host.engine.in_call());
}

#[tokio::test]
async fn call_needs_a_connected_session() {
    let world = World::new();
    let host = world.client(user("u-ada", "Ada"));

    let err = settle(host.engine.join_call()).await.expect_err("no session");
    assert!(matches!(err, SessionError::NoActiveSession));

    world.rows.set_online(false);
    settle(host.engine.create(None)).await;
    let err = settle(host.engine.join_call()).await.expect_err("local session");
    assert!(matches!(err, SessionError::Call(_)));
    assert!(!host.media.has_local_media_now());
}
