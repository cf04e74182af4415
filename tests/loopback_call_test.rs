// Integration test: two call managers talking through the in-process
// switchboard, with fingerprint verification and fake media that connects
// as soon as negotiation completes.

use jingle_rust::calls::{
    CallDirection, CallManager, CallManagerConfig, CallOutcome, DeviceDiscoveryState,
    EndUserStateChanged, JingleSession,
};
use jingle_rust::jinglecore::address::Address;
use jingle_rust::jinglecore::media::{MediaKind, MediaSet};
use jingle_rust::jinglecore::protocol::{JingleAction, SessionId};
use jingle_rust::jinglecore::state::{EndUserState, SessionState};
use jingle_rust::jinglecore::verification::IdentityKey;
use jingle_rust::loopback::{
    FakeMediaOptions, KeyDirectory, LoopbackCrypto, LoopbackEndpoint, StaticRoster, Switchboard,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const ALICE: &str = "alice@example.org/laptop";
const BOB: &str = "bob@example.org/phone";

struct Party {
    address: Address,
    board: Arc<Switchboard>,
    manager: Arc<CallManager>,
    endpoint: LoopbackEndpoint,
    events: broadcast::Receiver<Arc<EndUserStateChanged>>,
}

fn addr(address: &str) -> Address {
    address.parse().expect("valid address")
}

fn audio() -> MediaSet {
    MediaKind::set_of(&[MediaKind::Audio])
}

fn key_of(device_id: u32) -> IdentityKey {
    IdentityKey::new(vec![device_id as u8; 33])
}

// Helper: attach an endpoint with verification enabled for `device_id`.
fn join(
    board: &Arc<Switchboard>,
    directory: &Arc<KeyDirectory>,
    own: &str,
    device_id: u32,
    contact: &str,
) -> Party {
    let _ = env_logger::builder().is_test(true).try_init();
    let address = addr(own);
    let (services, endpoint) = LoopbackEndpoint::services(
        board.transport(address.clone()),
        StaticRoster::new([addr(contact)]),
        LoopbackCrypto::new(&address, directory.clone()),
        FakeMediaOptions {
            emit_candidates: true,
            auto_connect: true,
            fail_creation: false,
        },
    );
    let config = CallManagerConfig {
        own_device_id: Some(device_id),
        ..Default::default()
    };
    let manager = CallManager::new(services, config);
    let events = manager.events().end_user_state.subscribe();
    board.attach(&address, &manager);
    Party {
        address,
        board: board.clone(),
        manager,
        endpoint,
        events,
    }
}

// Helper: Alice and Bob sharing one key directory.
fn alice_and_bob() -> (Party, Party) {
    let board = Switchboard::new(Duration::from_secs(5));
    let directory = KeyDirectory::new();
    directory.register(&addr(ALICE), 1, key_of(1));
    directory.register(&addr(BOB), 2, key_of(2));
    let alice = join(&board, &directory, ALICE, 1, BOB);
    let bob = join(&board, &directory, BOB, 2, ALICE);
    (alice, bob)
}

async fn wait_for(party: &mut Party, wanted: EndUserState) -> Arc<EndUserStateChanged> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = party.events.recv().await.expect("event bus open");
            if event.state == wanted {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {:?}", party.address, wanted))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// Helper: Alice calls, Bob answers, both sides connect.
async fn connected_call(
    alice: &mut Party,
    bob: &mut Party,
    media: MediaSet,
) -> (SessionId, Arc<JingleSession>, Arc<JingleSession>) {
    let sid = alice
        .manager
        .propose(&bob.address.bare(), media)
        .await
        .unwrap();
    let incoming = wait_for(bob, EndUserState::IncomingCall).await;
    assert_eq!(incoming.session_id, sid);
    let callee = bob.manager.find_session(&sid).await.expect("callee session");
    callee.accept_call().await.unwrap();
    wait_for(alice, EndUserState::Connected).await;
    wait_for(bob, EndUserState::Connected).await;
    let caller = alice.manager.find_session(&sid).await.expect("caller session");
    (sid, caller, callee)
}

#[tokio::test]
async fn test_audio_call_end_to_end() {
    let (mut alice, mut bob) = alice_and_bob();
    let (sid, caller, callee) = connected_call(&mut alice, &mut bob, audio()).await;

    assert_eq!(caller.state().await, SessionState::SessionAccepted);
    assert_eq!(callee.state().await, SessionState::SessionAccepted);
    assert!(caller.is_initiator().await);
    assert_eq!(caller.media().await, audio());
    assert_eq!(alice.manager.proposal_state(&bob.address, &sid).await, None);

    callee.end_call().await.unwrap();
    wait_for(&mut alice, EndUserState::Ended).await;
    settle().await;

    assert!(caller.is_terminated());
    assert!(!alice.manager.is_busy().await);
    assert!(!bob.manager.is_busy().await);
    for (party, direction) in [
        (&alice, CallDirection::Outgoing),
        (&bob, CallDirection::Incoming),
    ] {
        let log = party.endpoint.call_log.entries();
        assert_eq!(log.len(), 1, "{}", party.address);
        assert_eq!(log[0].direction, direction);
        assert_eq!(log[0].session_id, sid);
        assert!(matches!(log[0].outcome, CallOutcome::Success { .. }));
    }
    let engine = alice.endpoint.media.last_engine().expect("engine");
    assert!(engine.is_closed());
    assert_eq!(engine.close_count(), 1);
}

#[tokio::test]
async fn test_candidates_reach_both_engines() {
    let (mut alice, mut bob) = alice_and_bob();
    connected_call(&mut alice, &mut bob, audio()).await;
    settle().await;

    let alice_engine = alice.endpoint.media.last_engine().expect("engine");
    let bob_engine = bob.endpoint.media.last_engine().expect("engine");
    assert!(!alice_engine.remote_candidates().is_empty());
    assert!(!bob_engine.remote_candidates().is_empty());
}

#[tokio::test]
async fn test_declined_call() {
    let (mut alice, mut bob) = alice_and_bob();
    let sid = alice
        .manager
        .propose(&bob.address.bare(), audio())
        .await
        .unwrap();
    wait_for(&mut bob, EndUserState::IncomingCall).await;
    let callee = bob.manager.find_session(&sid).await.expect("callee session");
    callee.reject_call().await.unwrap();
    wait_for(&mut alice, EndUserState::DeclinedOrBusy).await;

    let log = alice.endpoint.call_log.entries();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].outcome, CallOutcome::Missed);
    assert!(!alice.manager.is_busy().await);
}

#[tokio::test]
async fn test_video_upgrade_accepted() {
    let (mut alice, mut bob) = alice_and_bob();
    let (_, caller, callee) = connected_call(&mut alice, &mut bob, audio()).await;

    caller.add_media(MediaKind::Video).await.unwrap();
    wait_for(&mut bob, EndUserState::IncomingContentAdd).await;
    let addition = callee
        .pending_content_addition()
        .await
        .expect("pending addition");
    assert_eq!(addition.summary.media(), MediaKind::set_of(&[MediaKind::Video]));
    callee.accept_content_add(&addition.summary).await.unwrap();
    settle().await;

    let both = MediaKind::set_of(&[MediaKind::Audio, MediaKind::Video]);
    assert_eq!(caller.media().await, both);
    assert_eq!(callee.media().await, both);
    assert_eq!(caller.pending_content_addition().await, None);
    assert_eq!(caller.end_user_state().await, EndUserState::Connected);
    let engine = alice.endpoint.media.last_engine().expect("engine");
    assert_eq!(engine.active_media(), both);
}

#[tokio::test]
async fn test_video_upgrade_keeps_fingerprints_encrypted() {
    let (mut alice, mut bob) = alice_and_bob();
    let (_, caller, callee) = connected_call(&mut alice, &mut bob, audio()).await;

    caller.add_media(MediaKind::Video).await.unwrap();
    wait_for(&mut bob, EndUserState::IncomingContentAdd).await;
    let addition = callee
        .pending_content_addition()
        .await
        .expect("pending addition");
    callee.accept_content_add(&addition.summary).await.unwrap();
    settle().await;

    for (sender, action) in [
        (&alice.address, JingleAction::SessionInitiate),
        (&alice.address, JingleAction::ContentAdd),
        (&bob.address, JingleAction::SessionAccept),
        (&bob.address, JingleAction::ContentAccept),
    ] {
        let sent = alice.board.sent_iqs(sender, action);
        assert_eq!(sent.len(), 1, "{action}");
        let payload = sent[0].contents.as_ref().expect("contents");
        assert!(payload.is_encrypted(), "{action} in the clear");
        assert!(
            payload
                .visible()
                .contents
                .values()
                .all(|c| c.transport.fingerprint.is_none()),
            "{action} leaks a fingerprint"
        );
    }
    let both = MediaKind::set_of(&[MediaKind::Audio, MediaKind::Video]);
    assert_eq!(caller.media().await, both);
    assert_eq!(callee.media().await, both);
}

#[tokio::test]
async fn test_video_upgrade_rejected() {
    let (mut alice, mut bob) = alice_and_bob();
    let (_, caller, callee) = connected_call(&mut alice, &mut bob, audio()).await;

    caller.add_media(MediaKind::Video).await.unwrap();
    wait_for(&mut bob, EndUserState::IncomingContentAdd).await;
    callee.reject_content_add().await.unwrap();
    settle().await;

    assert_eq!(caller.pending_content_addition().await, None);
    assert_eq!(caller.media().await, audio());
    assert_eq!(caller.state().await, SessionState::SessionAccepted);
    assert_eq!(callee.media().await, audio());
    let engine = alice.endpoint.media.last_engine().expect("engine");
    assert_eq!(engine.active_media(), audio());
}

#[tokio::test]
async fn test_ice_restart_keeps_call_up() {
    let (mut alice, mut bob) = alice_and_bob();
    let (_, caller, callee) = connected_call(&mut alice, &mut bob, audio()).await;
    settle().await;
    let engine = alice.endpoint.media.last_engine().expect("engine");
    let before = engine
        .remote_description()
        .expect("remote description")
        .credentials();

    caller.restart_ice().await.unwrap();
    settle().await;

    let after = engine
        .remote_description()
        .expect("remote description")
        .credentials();
    assert_ne!(before, after);
    assert_eq!(caller.state().await, SessionState::SessionAccepted);
    assert_eq!(callee.state().await, SessionState::SessionAccepted);
}

#[tokio::test]
async fn test_identity_mismatch_is_a_security_error() {
    let board = Switchboard::new(Duration::from_secs(5));
    // Alice holds a stale identity key for Bob
    let alice_directory = KeyDirectory::new();
    alice_directory.register(&addr(ALICE), 1, key_of(1));
    alice_directory.register(&addr(BOB), 2, key_of(99));
    let bob_directory = KeyDirectory::new();
    bob_directory.register(&addr(ALICE), 1, key_of(1));
    bob_directory.register(&addr(BOB), 2, key_of(2));
    let mut alice = join(&board, &alice_directory, ALICE, 1, BOB);
    let mut bob = join(&board, &bob_directory, BOB, 2, ALICE);

    let sid = alice
        .manager
        .propose(&bob.address.bare(), audio())
        .await
        .unwrap();
    wait_for(&mut bob, EndUserState::IncomingCall).await;
    let callee = bob.manager.find_session(&sid).await.expect("callee session");
    callee.accept_call().await.unwrap();

    wait_for(&mut alice, EndUserState::SecurityError).await;
    settle().await;
    let record = bob
        .manager
        .terminal_session_state(&alice.address, &sid)
        .await
        .expect("terminal record");
    assert_eq!(record.end_user_state, EndUserState::SecurityError);
    assert!(!alice.manager.is_busy().await);
}

#[tokio::test]
async fn test_offline_callee_fails_proposal() {
    let board = Switchboard::new(Duration::from_secs(5));
    let directory = KeyDirectory::new();
    let alice = join(&board, &directory, ALICE, 1, BOB);
    let sid = alice
        .manager
        .propose(&addr(BOB).bare(), audio())
        .await
        .unwrap();
    settle().await;

    assert_eq!(
        alice.manager.proposal_state(&addr(BOB), &sid).await,
        Some(DeviceDiscoveryState::Failed)
    );
    alice.manager.retract_proposal(&addr(BOB)).await.unwrap();
    assert_eq!(alice.manager.proposal_state(&addr(BOB), &sid).await, None);
    let log = alice.endpoint.call_log.entries();
    assert_eq!(log.last().map(|e| e.outcome), Some(CallOutcome::Missed));
}
