//! Integration tests for the voice handshake: correlation through the
//! controller, timeouts and explicit cancellation.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use common::secret::ExposeSecret;
use vc_test_utils::{
    test_config, voice_server, voice_state, JoinResponse, MockGateway, ScriptedWorkerSpawner,
    WorkerProbes, CHANNEL, ENDPOINT, GUILD, OTHER_CHANNEL, OTHER_GUILD, OTHER_USER, TOKEN, USER,
};
use voice_controller::{Config, VcError, VoiceManagerHandle};
use worker_protocol::SessionInit;

fn start(gateway: &Arc<MockGateway>, config: Config) -> (VoiceManagerHandle, WorkerProbes) {
    let (spawner, workers) = ScriptedWorkerSpawner::new();
    let controller = VoiceManagerHandle::new(config, Arc::clone(gateway), Arc::new(spawner));
    (controller, workers)
}

/// Poll until the gateway has seen the join for `GUILD` (the handshake has
/// subscribed by then).
async fn wait_for_join(gateway: &MockGateway) {
    for _ in 0..100 {
        if gateway.joins(GUILD) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("join request never sent");
}

/// Connect through a gateway answering in `order`, returning the `Init`.
async fn init_for(order: JoinResponse) -> SessionInit {
    let gateway = Arc::new(MockGateway::builder().respond(order).build());
    let (controller, mut workers) = start(&gateway, test_config());

    let connect = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(GUILD, CHANNEL, USER).await })
    };
    let mut worker = workers.next().await;
    let init = worker.accept_init().await;
    connect.await.unwrap().unwrap();

    controller.cancel();
    init
}

#[tokio::test]
async fn test_delivery_order_does_not_change_init() {
    let state_first = init_for(JoinResponse::StateFirst).await;
    let server_first = init_for(JoinResponse::ServerFirst).await;

    assert_eq!(state_first.guild_id, server_first.guild_id);
    assert_eq!(state_first.user_id, server_first.user_id);
    assert_eq!(
        state_first.session_id.expose_secret(),
        server_first.session_id.expose_secret()
    );
    assert_eq!(
        state_first.token.expose_secret(),
        server_first.token.expose_secret()
    );
    assert_eq!(state_first.endpoint, server_first.endpoint);
    assert_eq!(server_first.endpoint, ENDPOINT);
}

#[tokio::test]
async fn test_unrelated_events_are_ignored_and_last_write_wins() {
    let gateway = Arc::new(MockGateway::silent());
    let (controller, mut workers) = start(&gateway, test_config());

    let connect = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(GUILD, CHANNEL, USER).await })
    };
    wait_for_join(&gateway).await;

    // Another member, another channel, another guild: none of these match.
    gateway.publish_voice_state(voice_state(GUILD, Some(CHANNEL), OTHER_USER, "other-user"));
    gateway.publish_voice_state(voice_state(GUILD, Some(OTHER_CHANNEL), USER, "other-channel"));
    gateway.publish_voice_server(voice_server(OTHER_GUILD, "other-guild", "elsewhere:1"));

    // Two matching states before the server: the later one is used.
    gateway.publish_voice_state(voice_state(GUILD, Some(CHANNEL), USER, "stale"));
    gateway.publish_voice_state(voice_state(GUILD, Some(CHANNEL), USER, "fresh"));
    gateway.publish_voice_server(voice_server(GUILD, TOKEN, ENDPOINT));

    let mut worker = workers.next().await;
    let init = worker.accept_init().await;
    assert_eq!(init.session_id.expose_secret(), "fresh");
    assert_eq!(init.token.expose_secret(), TOKEN);
    assert_eq!(init.endpoint, ENDPOINT);

    connect.await.unwrap().unwrap();
    controller.cancel();
}

#[tokio::test]
async fn test_handshake_subscriptions_are_released_on_success() {
    let gateway = Arc::new(MockGateway::answering());
    let (controller, mut workers) = start(&gateway, test_config());

    let connect = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(GUILD, CHANNEL, USER).await })
    };
    let mut worker = workers.next().await;
    worker.accept_init().await;
    connect.await.unwrap().unwrap();

    // Only the controller's own implicit-leave subscription remains.
    assert_eq!(gateway.voice_state_subscribers(), 1);
    assert_eq!(gateway.voice_server_subscribers(), 0);

    controller.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_handshake_times_out_when_server_update_never_arrives() {
    let gateway = Arc::new(
        MockGateway::builder()
            .respond(JoinResponse::StateOnly)
            .build(),
    );
    let (controller, mut workers) = start(&gateway, test_config());

    let started = tokio::time::Instant::now();
    let result = controller.connect(GUILD, CHANNEL, USER).await;
    assert!(matches!(result, Err(VcError::HandshakeTimeout(g)) if g == GUILD));
    assert!(started.elapsed() >= Duration::from_secs(10));

    // Nothing registered, subscriptions released, channel left, worker gone.
    assert!(controller.session(GUILD).await.unwrap().is_none());
    assert_eq!(gateway.voice_state_subscribers(), 1);
    assert_eq!(gateway.voice_server_subscribers(), 0);
    assert_eq!(gateway.leaves(GUILD), 1);

    let worker = workers.try_next().expect("worker should have been spawned");
    assert!(worker.is_terminated());

    controller.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_can_be_disabled() {
    let gateway = Arc::new(MockGateway::silent());
    let config = Config {
        handshake_timeout_seconds: 0,
        ..test_config()
    };
    let (controller, mut workers) = start(&gateway, config);

    let connect = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(GUILD, CHANNEL, USER).await })
    };

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(!connect.is_finished());

    gateway.publish_voice_server(voice_server(GUILD, TOKEN, ENDPOINT));
    gateway.publish_voice_state(voice_state(GUILD, Some(CHANNEL), USER, "late"));

    let mut worker = workers.next().await;
    worker.accept_init().await;
    assert!(connect.await.unwrap().is_ok());

    controller.cancel();
}

#[tokio::test]
async fn test_cancel_connect_tears_down_pending_handshake() {
    let gateway = Arc::new(MockGateway::silent());
    let (controller, mut workers) = start(&gateway, test_config());

    let connect = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(GUILD, CHANNEL, USER).await })
    };
    let worker = workers.next().await;
    wait_for_join(&gateway).await;

    controller.cancel_connect(GUILD).await.unwrap();

    let result = connect.await.unwrap();
    assert!(matches!(result, Err(VcError::Cancelled)));
    assert!(worker.is_terminated());
    assert!(controller.session(GUILD).await.unwrap().is_none());
    assert_eq!(gateway.voice_server_subscribers(), 0);
    assert_eq!(gateway.leaves(GUILD), 1);

    // A late update for the cancelled handshake changes nothing.
    gateway.publish_voice_server(voice_server(GUILD, TOKEN, ENDPOINT));
    assert!(controller.session(GUILD).await.unwrap().is_none());

    // Nothing left to cancel.
    let again = controller.cancel_connect(GUILD).await;
    assert!(matches!(again, Err(VcError::NotConnected(_))));

    controller.cancel();
}

#[tokio::test]
async fn test_cancel_connect_does_not_touch_active_session() {
    let gateway = Arc::new(MockGateway::answering());
    let (controller, mut workers) = start(&gateway, test_config());

    let connect = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.connect(GUILD, CHANNEL, USER).await })
    };
    let mut worker = workers.next().await;
    worker.accept_init().await;
    connect.await.unwrap().unwrap();

    let result = controller.cancel_connect(GUILD).await;
    assert!(matches!(result, Err(VcError::NotConnected(_))));
    assert!(controller.session(GUILD).await.unwrap().is_some());
    assert!(!worker.is_terminated());

    controller.cancel();
}
