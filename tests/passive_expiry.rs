//! Passive retention with expiry: parked sessions disappear after their lifetime
//! and the server announces it.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bare_ws::testing::{RecordingServerHandler, ServerEvent};
use bare_ws::{Client, Server, ServerOptions};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

fn expiring_options() -> ServerOptions {
    ServerOptions {
        local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        remember_disconnected_clients: true,
        remove_passive_clients_after_expiration: true,
        passive_client_lifetime: Duration::from_millis(200),
        send_user_id_to_client: true,
        ..ServerOptions::default()
    }
}

async fn recv(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn parked_sessions_expire_and_announce_it() {
    let server = Server::new(expiring_options());
    let (handler, mut events) = RecordingServerHandler::new();
    server.add_handler(handler);
    server.start(None).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new("127.0.0.1", port, "/");
    client.connect(None).await.unwrap();
    let user_id = client.user_id().unwrap();
    let _ = recv(&mut events).await;

    client.disconnect("done", None).await.unwrap();
    let _ = recv(&mut events).await;

    match recv(&mut events).await {
        ServerEvent::PassiveExpired(id) => assert_eq!(id, user_id),
        other => panic!("expected the expiry event, got {other:?}"),
    }

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn an_expired_id_reconnects_as_a_fresh_adoption() {
    let server = Server::new(expiring_options());
    let (handler, mut events) = RecordingServerHandler::new();
    server.add_handler(handler);
    server.start(None).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new("127.0.0.1", port, "/");
    client.connect(None).await.unwrap();
    let user_id = client.user_id().unwrap();
    let _ = recv(&mut events).await;
    client.disconnect("done", None).await.unwrap();
    let _ = recv(&mut events).await;

    match recv(&mut events).await {
        ServerEvent::PassiveExpired(id) => assert_eq!(id, user_id),
        other => panic!("expected the expiry event, got {other:?}"),
    }

    // The entry is gone, so the id is simply adopted again.
    let returning = Client::new("127.0.0.1", port, "/").with_user_id(user_id.clone());
    returning.connect(None).await.unwrap();
    match recv(&mut events).await {
        ServerEvent::Connected(id) => assert_eq!(id, user_id),
        other => panic!("expected connected, got {other:?}"),
    }

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn reconnecting_before_expiry_keeps_the_session_alive() {
    let server = Server::new(expiring_options());
    let (handler, mut events) = RecordingServerHandler::new();
    server.add_handler(handler);
    server.start(None).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new("127.0.0.1", port, "/");
    client.connect(None).await.unwrap();
    let user_id = client.user_id().unwrap();
    let _ = recv(&mut events).await;
    client.disconnect("brb", None).await.unwrap();
    let _ = recv(&mut events).await;

    // Come back well inside the lifetime; the parked entry is reclaimed, so no
    // expiry event may fire afterwards.
    sleep(Duration::from_millis(50)).await;
    let returning = Client::new("127.0.0.1", port, "/").with_user_id(user_id.clone());
    returning.connect(None).await.unwrap();
    match recv(&mut events).await {
        ServerEvent::Connected(id) => assert_eq!(id, user_id),
        other => panic!("expected connected, got {other:?}"),
    }

    sleep(Duration::from_millis(400)).await;
    assert!(
        events.try_recv().is_err(),
        "no expiry may fire for a reclaimed session"
    );
    assert_eq!(server.client_count(), 1);

    server.shutdown(None).await.unwrap();
}
