//! Re-identification across disconnects: passive sessions are reclaimed by their
//! user id, and a live id refuses a second claimant with `409 Conflict`.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bare_ws::testing::{RecordingServerHandler, ServerEvent};
use bare_ws::{Client, Server, ServerOptions};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

fn retaining_options() -> ServerOptions {
    ServerOptions {
        local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        remember_disconnected_clients: true,
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

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn disconnected_client_reclaims_its_session() {
    let server = Server::new(retaining_options());
    let (handler, mut events) = RecordingServerHandler::new();
    server.add_handler(handler);
    server.start(None).await.unwrap();
    let port = server.local_addr().unwrap().port();

    // First visit: no identity hint; the server assigns one and discloses it.
    let first = Client::new("127.0.0.1", port, "/");
    first.connect(None).await.unwrap();
    let assigned = first.user_id().expect("server should disclose the id");

    match recv(&mut events).await {
        ServerEvent::Connected(id) => assert_eq!(id, assigned),
        other => panic!("expected connected, got {other:?}"),
    }

    first.disconnect("see you", None).await.unwrap();
    match recv(&mut events).await {
        ServerEvent::Disconnected { client_id, .. } => assert_eq!(client_id, assigned),
        other => panic!("expected disconnected, got {other:?}"),
    }
    wait_until(|| server.client_count() == 0).await;

    // Second visit presents the id; the parked session comes back as-is.
    let second = Client::new("127.0.0.1", port, "/").with_user_id(assigned.clone());
    second.connect(None).await.unwrap();
    match recv(&mut events).await {
        ServerEvent::Connected(id) => assert_eq!(id, assigned),
        other => panic!("expected reconnected, got {other:?}"),
    }
    assert_eq!(server.client_count(), 1);
    let session = server.get_client_by_id(&assigned).unwrap();
    assert_eq!(session.id(), assigned);

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn live_id_gets_a_409_conflict() {
    let server = Server::new(retaining_options());
    let (handler, mut events) = RecordingServerHandler::new();
    server.add_handler(handler);
    server.start(None).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let holder = Client::new("127.0.0.1", port, "/");
    holder.connect(None).await.unwrap();
    let user_id = holder.user_id().unwrap();
    let _ = recv(&mut events).await;

    // Same id while the holder is still connected: exactly one 101 happened, this
    // one gets the 409.
    let intruder = Client::new("127.0.0.1", port, "/").with_user_id(user_id.clone());
    let err = intruder.connect(None).await.unwrap_err();
    let rendered = format!("{err}");
    assert!(rendered.contains("409"), "expected a 409, got: {rendered}");
    assert!(!intruder.is_connected());

    assert_eq!(server.client_count(), 1);
    assert!(events.try_recv().is_err(), "no second connect event");

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn without_retention_ids_are_not_remembered() {
    let options = ServerOptions {
        remember_disconnected_clients: false,
        ..retaining_options()
    };
    let server = Server::new(options);
    let (handler, mut events) = RecordingServerHandler::new();
    server.add_handler(handler);
    server.start(None).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let first = Client::new("127.0.0.1", port, "/");
    first.connect(None).await.unwrap();
    let assigned = first.user_id().unwrap();
    let _ = recv(&mut events).await;
    first.disconnect("bye", None).await.unwrap();
    let _ = recv(&mut events).await;
    wait_until(|| server.client_count() == 0).await;

    // The id comes back, but with retention off identification never runs; a
    // fresh session with a fresh id is created instead.
    let second = Client::new("127.0.0.1", port, "/").with_user_id(assigned.clone());
    second.connect(None).await.unwrap();
    match recv(&mut events).await {
        ServerEvent::Connected(id) => assert_ne!(id, assigned),
        other => panic!("expected connected, got {other:?}"),
    }

    server.shutdown(None).await.unwrap();
}
