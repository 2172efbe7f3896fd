//! Terminal WebSocket tests over a real listener.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::Method;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

mod common;
use common::{TestApp, test_app};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, id: &str, token: &str) -> Client {
    let url = format!("ws://{addr}/ws/terminal/{id}?token={token}");
    let (stream, _) = connect_async(url).await.expect("websocket handshake");
    stream
}

/// Next close code the server sends, skipping anything else.
async fn expect_close(client: &mut Client) -> u16 {
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = client.next().await {
            match msg {
                Ok(Message::Close(Some(frame))) => return Some(u16::from(frame.code)),
                Ok(Message::Close(None)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .expect("timed out waiting for close");
    next.expect("server closed without a close code")
}

/// Read text frames until `needle` has been seen.
async fn read_until(client: &mut Client, needle: &str) -> String {
    let mut seen = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !seen.contains(needle) {
            match client.next().await {
                Some(Ok(Message::Text(text))) => seen.push_str(text.as_str()),
                Some(Ok(_)) => {}
                other => panic!("terminal ended early: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for terminal output");
    seen
}

async fn running_project(app: &TestApp, tenant_id: i64) -> (i64, String) {
    let id = app.create_project(tenant_id, "shell").await;
    let (_, record) = app
        .request(tenant_id, Method::POST, &format!("/projects/{id}/start"), None)
        .await;
    let handle = record["container_id"].as_str().unwrap().to_string();
    (id, handle)
}

async fn wait_for_closed_channels(app: &TestApp, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while app.runtime.channels_closed() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("terminal channel was not closed");
}

#[tokio::test]
async fn test_invalid_token_closes_with_policy_violation() {
    let app = test_app().await;
    let (id, _) = running_project(&app, 1).await;
    let addr = app.spawn_server().await;

    let mut client = connect(addr, &id.to_string(), "not-a-token").await;
    assert_eq!(expect_close(&mut client).await, 1008);
    assert_eq!(app.runtime.channels_opened(), 0);
}

#[tokio::test]
async fn test_other_tenant_closes_with_policy_violation() {
    let app = test_app().await;
    let (id, _) = running_project(&app, 1).await;
    let addr = app.spawn_server().await;

    let mut client = connect(addr, &id.to_string(), &app.token(2)).await;
    assert_eq!(expect_close(&mut client).await, 1008);
    assert_eq!(app.runtime.channels_opened(), 0);
}

#[tokio::test]
async fn test_idle_project_closes_with_policy_violation() {
    let app = test_app().await;
    let id = app.create_project(1, "cold").await;
    let addr = app.spawn_server().await;

    let mut client = connect(addr, &id.to_string(), &app.token(1)).await;
    assert_eq!(expect_close(&mut client).await, 1008);
}

#[tokio::test]
async fn test_malformed_project_id_closes_with_policy_violation() {
    let app = test_app().await;
    let addr = app.spawn_server().await;

    let mut client = connect(addr, "abc", &app.token(1)).await;
    assert_eq!(expect_close(&mut client).await, 1008);
}

#[tokio::test]
async fn test_terminal_round_trip_and_disconnect() {
    let app = test_app().await;
    let (id, _) = running_project(&app, 1).await;
    let addr = app.spawn_server().await;

    let mut client = connect(addr, &id.to_string(), &app.token(1)).await;
    client
        .send(Message::Text("echo hello\n".into()))
        .await
        .unwrap();
    let output = read_until(&mut client, "echo hello").await;
    assert!(output.contains("echo hello"));
    assert_eq!(app.runtime.channels_opened(), 1);

    client.close(None).await.unwrap();
    wait_for_closed_channels(&app, 1).await;
}

#[tokio::test]
async fn test_terminal_after_reconciled_restart() {
    let app = test_app().await;
    let (id, first) = running_project(&app, 1).await;

    app.runtime.remove_out_of_band(&first);
    let report = app.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.desynced, 1);

    let addr = app.spawn_server().await;

    // Reset records refuse terminals until started again.
    let mut refused = connect(addr, &id.to_string(), &app.token(1)).await;
    assert_eq!(expect_close(&mut refused).await, 1008);

    let (_, restarted) = app
        .request(1, Method::POST, &format!("/projects/{id}/start"), None)
        .await;
    assert_ne!(restarted["container_id"].as_str().unwrap(), first);

    let mut client = connect(addr, &id.to_string(), &app.token(1)).await;
    client.send(Message::Text("pwd\n".into())).await.unwrap();
    read_until(&mut client, "pwd").await;

    drop(client);
    wait_for_closed_channels(&app, 1).await;
}
