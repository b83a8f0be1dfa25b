use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use libvbox::testing::{FakeLauncher, MemoryIdentity, MemoryObjectStore};
use libvbox::{Collaborators, CoordinatorConfig, LifecycleCoordinator, UserRecord};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use vbox_server::{AppState, app, build_cors};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);
const MAX_SAVE_BYTES: usize = 5 * 1024 * 1024;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryObjectStore>,
    identity: Arc<MemoryIdentity>,
    launcher: Arc<FakeLauncher>,
}

async fn start_server() -> TestServer {
    let store = Arc::new(MemoryObjectStore::with_objects([
        ("projects/b1/index.ts", "let a = 1;"),
        ("projects/b1/src/app.ts", "app"),
    ]));
    let identity = Arc::new(
        MemoryIdentity::new()
            .with_user(UserRecord::new("alice").owning("b1"))
            .with_user(UserRecord::new("bob").sharing("b1"))
            .with_user(UserRecord::new("mallory")),
    );
    let launcher = Arc::new(FakeLauncher::new());
    let coordinator = LifecycleCoordinator::new(
        CoordinatorConfig {
            max_save_bytes: MAX_SAVE_BYTES,
            ..Default::default()
        },
        Collaborators {
            store: store.clone(),
            identity: identity.clone(),
            suggestions: None,
            launcher: launcher.clone(),
        },
    );
    let state = Arc::new(AppState {
        coordinator,
        max_frame_bytes: vbox_protocol::frame_limit_for(MAX_SAVE_BYTES),
    });
    let router = app(state, build_cors(&["*".to_string()]).expect("cors"));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestServer {
        addr,
        store,
        identity,
        launcher,
    }
}

fn ws_url(addr: SocketAddr, user: &str, box_id: &str) -> String {
    format!("ws://{addr}/ws?userId={user}&boxId={box_id}")
}

async fn connect(addr: SocketAddr, user: &str) -> Ws {
    let (ws, _) = timeout(WAIT, connect_async(ws_url(addr, user, "b1")))
        .await
        .expect("connect timeout")
        .expect("connect");
    ws
}

async fn handshake_status(url: String) -> u16 {
    match timeout(WAIT, connect_async(url)).await.expect("connect timeout") {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("handshake unexpectedly accepted"),
    }
}

async fn next_frame(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("frame timeout")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("json frame");
        }
    }
}

async fn wait_for_event(ws: &mut Ws, event: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == "event" && frame["event"] == event {
            return frame;
        }
    }
}

async fn request(ws: &mut Ws, request_id: u64, mut body: Value) -> Value {
    body["requestId"] = json!(request_id);
    ws.send(Message::text(body.to_string())).await.expect("send");
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == "reply" && frame["requestId"] == request_id {
            return frame["response"].clone();
        }
    }
}

#[tokio::test]
async fn handshake_rejections_use_http_status() {
    let server = start_server().await;

    let missing_user = format!("ws://{}/ws?boxId=b1", server.addr);
    assert_eq!(handshake_status(missing_user).await, 400);
    assert_eq!(handshake_status(ws_url(server.addr, "mallory", "b1")).await, 403);
    assert_eq!(handshake_status(ws_url(server.addr, "ghost", "b1")).await, 403);

    server.identity.set_unavailable(true);
    assert_eq!(handshake_status(ws_url(server.addr, "alice", "b1")).await, 502);
}

#[tokio::test]
async fn owner_loads_and_edits() {
    let server = start_server().await;
    let mut alice = connect(server.addr, "alice").await;

    let loaded = wait_for_event(&mut alice, "loaded").await;
    let names: Vec<&str> = loaded["files"]
        .as_array()
        .expect("files")
        .iter()
        .filter_map(|node| node["name"].as_str())
        .collect();
    assert!(names.contains(&"index.ts"));
    assert!(names.contains(&"src"));

    let got = request(
        &mut alice,
        1,
        json!({"event": "getFile", "fileId": "projects/b1/index.ts"}),
    )
    .await;
    assert_eq!(got["status"], "ok");
    assert_eq!(got["data"], "let a = 1;");

    let saved = request(
        &mut alice,
        2,
        json!({"event": "saveFile", "fileId": "projects/b1/index.ts", "body": "let a = 2;"}),
    )
    .await;
    assert_eq!(saved["status"], "ok");

    let missing = request(
        &mut alice,
        3,
        json!({"event": "getFile", "fileId": "projects/b1/nope.ts"}),
    )
    .await;
    assert_eq!(missing["status"], "error");
    assert_eq!(missing["code"], "not_found");

    // Saves are written behind the reply; poll storage.
    timeout(WAIT, async {
        while server.store.body("projects/b1/index.ts").as_deref() != Some("let a = 2;") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("save never reached storage");
}

async fn wait_for_body_len(server: &TestServer, key: &str, len: usize) {
    timeout(WAIT, async {
        while server.store.body(key).map(|b| b.len()) != Some(len) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("save never reached storage");
}

#[tokio::test]
async fn oversized_save_is_rejected_with_notice() {
    let server = start_server().await;
    let mut alice = connect(server.addr, "alice").await;
    wait_for_event(&mut alice, "loaded").await;

    let body = "a".repeat(7 * 1024 * 1024);
    let frame = json!({
        "event": "saveFile",
        "requestId": 1,
        "fileId": "projects/b1/index.ts",
        "body": body,
    });
    alice.send(Message::text(frame.to_string())).await.expect("send");

    let mut reply = None;
    let mut notice = None;
    while reply.is_none() || notice.is_none() {
        let frame = next_frame(&mut alice).await;
        if frame["type"] == "reply" && frame["requestId"] == 1 {
            reply = Some(frame["response"].clone());
        } else if frame["type"] == "event" && frame["event"] == "rateLimit" {
            notice = Some(frame);
        }
    }
    let reply = reply.unwrap();
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["code"], "rate_limited");
    let message = notice.unwrap()["message"].as_str().unwrap().to_string();
    assert!(message.contains("file size too large"), "{message}");

    let saved = request(
        &mut alice,
        2,
        json!({"event": "saveFile", "fileId": "projects/b1/index.ts", "body": "small"}),
    )
    .await;
    assert_eq!(saved["status"], "ok");
    wait_for_body_len(&server, "projects/b1/index.ts", 5).await;
}

#[tokio::test]
async fn escaped_save_under_cap_is_accepted() {
    let server = start_server().await;
    let mut alice = connect(server.addr, "alice").await;
    wait_for_event(&mut alice, "loaded").await;

    // Quotes double in size on the wire; control characters grow sixfold.
    let quotes = "\"".repeat(4 * 1024 * 1024);
    let saved = request(
        &mut alice,
        1,
        json!({"event": "saveFile", "fileId": "projects/b1/index.ts", "body": quotes}),
    )
    .await;
    assert_eq!(saved["status"], "ok");
    wait_for_body_len(&server, "projects/b1/index.ts", 4 * 1024 * 1024).await;

    let controls = "\u{1}".repeat(1024 * 1024);
    let saved = request(
        &mut alice,
        2,
        json!({"event": "saveFile", "fileId": "projects/b1/src/app.ts", "body": controls}),
    )
    .await;
    assert_eq!(saved["status"], "ok");
    wait_for_body_len(&server, "projects/b1/src/app.ts", 1024 * 1024).await;
}

#[tokio::test]
async fn malformed_request_gets_error_reply() {
    let server = start_server().await;
    let mut alice = connect(server.addr, "alice").await;
    wait_for_event(&mut alice, "loaded").await;

    let response = request(&mut alice, 9, json!({"event": "formatDisk"})).await;
    assert_eq!(response["status"], "error");
    assert_eq!(response["code"], "invalid_request");
}

#[tokio::test]
async fn shared_user_waits_for_owner() {
    let server = start_server().await;
    let mut bob = connect(server.addr, "bob").await;

    let disabled = wait_for_event(&mut bob, "disableAccess").await;
    assert_eq!(disabled["message"], "The virtualbox owner is not connected.");

    let denied = request(
        &mut bob,
        1,
        json!({"event": "getFile", "fileId": "projects/b1/index.ts"}),
    )
    .await;
    assert_eq!(denied["code"], "access_denied");

    let mut alice = connect(server.addr, "alice").await;
    wait_for_event(&mut alice, "loaded").await;
    wait_for_event(&mut bob, "loaded").await;

    alice.close(None).await.expect("close");
    wait_for_event(&mut bob, "ownerDisconnected").await;
}

#[tokio::test]
async fn terminal_output_reaches_collaborators() {
    let server = start_server().await;
    let mut alice = connect(server.addr, "alice").await;
    wait_for_event(&mut alice, "loaded").await;
    let mut bob = connect(server.addr, "bob").await;
    wait_for_event(&mut bob, "loaded").await;

    let created = request(&mut alice, 1, json!({"event": "createTerminal", "id": "t1"})).await;
    assert_eq!(created["status"], "ok");
    assert_eq!(server.launcher.spawn_count(), 1);

    server.launcher.emit_output(0, "hello\r\n");
    let output = wait_for_event(&mut bob, "terminalResponse").await;
    assert_eq!(output["id"], "t1");
    assert_eq!(output["data"], "hello\r\n");
}

#[tokio::test]
async fn health_reports_active_boxes() {
    let server = start_server().await;
    let url = format!("http://{}/health", server.addr);

    let before: Value = reqwest::get(&url).await.expect("get").json().await.expect("json");
    assert_eq!(before["status"], "ok");
    assert_eq!(before["activeBoxes"], 0);

    let mut alice = connect(server.addr, "alice").await;
    wait_for_event(&mut alice, "loaded").await;
    let after: Value = reqwest::get(&url).await.expect("get").json().await.expect("json");
    assert_eq!(after["activeBoxes"], 1);
}
