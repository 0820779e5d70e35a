//! Socket-level tests of the RPC hub: frame parsing, binding rules, input
//! delivery, and disconnect semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

use session_relay::events::SessionEvent;
use session_relay::hub::RpcHub;
use session_relay::registry::Registry;
use session_relay::router::Router;
use session_relay::threads::ThreadMappings;

struct Fixture {
    _tmp: tempfile::TempDir,
    hub: Arc<RpcHub>,
    router: Arc<Router>,
    registry: Arc<Registry>,
    events: UnboundedReceiver<SessionEvent>,
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(tmp.path().join("registry.json")).unwrap());
    let threads = Arc::new(ThreadMappings::open(tmp.path().join("threads.json")));
    let (tx, rx) = mpsc::unbounded_channel();
    let hub = RpcHub::new(tmp.path().join("relay.sock"));
    let router = Router::new(registry.clone(), threads, hub.clone(), tx);

    {
        let hub = hub.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let _ = hub.run(router).await;
        });
    }
    // Wait for the listener to come up.
    let path = hub.socket_path().clone();
    for _ in 0..100 {
        if UnixStream::connect(&path).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Fixture {
        _tmp: tmp,
        hub,
        router,
        registry,
        events: rx,
    }
}

async fn connect(hub: &RpcHub) -> UnixStream {
    UnixStream::connect(hub.socket_path()).await.unwrap()
}

fn session_start_line(id: &str, project_dir: &str) -> String {
    format!(
        "{{\"type\":\"session_start\",\"id\":\"{id}\",\"projectDir\":\"{project_dir}\",\"cwd\":\"/w\",\"command\":[\"claude\"],\"jsonlFile\":\"{id}.jsonl\",\"pid\":4242}}\n"
    )
}

async fn wait_bound(hub: &RpcHub, id: &str) {
    for _ in 0..200 {
        if hub.has_session(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session '{id}' never bound");
}

#[tokio::test]
async fn input_round_trip_delivers_text_then_carriage_return() {
    let f = fixture().await;
    let mut client = connect(&f.hub).await;
    client
        .write_all(session_start_line("A", "/tmp").as_bytes())
        .await
        .unwrap();
    wait_bound(&f.hub, "A").await;

    f.router.send_input("A", "hello").unwrap();

    let (read_half, _write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let first = timeout(Duration::from_secs(1), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, r#"{"type":"input","text":"hello"}"#);

    let second = timeout(Duration::from_millis(150), lines.next_line())
        .await
        .expect("carriage return must follow within 150ms")
        .unwrap()
        .unwrap();
    assert_eq!(second, r#"{"type":"input","text":"\r"}"#);
}

#[tokio::test]
async fn connection_close_surfaces_one_session_end() {
    let mut f = fixture().await;
    let mut client = connect(&f.hub).await;
    client
        .write_all(session_start_line("A", "/tmp").as_bytes())
        .await
        .unwrap();
    wait_bound(&f.hub, "A").await;
    drop(client);

    let mut ends = 0;
    while let Ok(Some(event)) = timeout(Duration::from_secs(2), f.events.recv()).await {
        if matches!(event, SessionEvent::SessionEnd { ref session_id } if session_id == "A") {
            ends += 1;
            break;
        }
    }
    assert_eq!(ends, 1);
    assert!(!f.hub.has_session("A"));

    // Nothing further arrives for this session.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = f.events.try_recv() {
        assert!(!matches!(event, SessionEvent::SessionEnd { .. }));
    }
}

#[tokio::test]
async fn explicit_session_end_frame_closes_the_binding() {
    let mut f = fixture().await;
    let mut client = connect(&f.hub).await;
    client
        .write_all(session_start_line("A", "/tmp").as_bytes())
        .await
        .unwrap();
    wait_bound(&f.hub, "A").await;

    client
        .write_all(b"{\"type\":\"session_end\",\"sessionId\":\"A\"}\n")
        .await
        .unwrap();

    let mut saw_end = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(2), f.events.recv()).await {
        if matches!(event, SessionEvent::SessionEnd { ref session_id } if session_id == "A") {
            saw_end = true;
            break;
        }
    }
    assert!(saw_end);
    assert!(!f.hub.has_session("A"));
}

#[tokio::test]
async fn fenced_id_gets_its_connection_dropped() {
    let f = fixture().await;
    f.registry.mark_reconciling("B");

    let mut client = connect(&f.hub).await;
    client
        .write_all(session_start_line("B", "/tmp").as_bytes())
        .await
        .unwrap();

    let (read_half, _write_half) = client.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let eof = timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("connection should close promptly")
        .unwrap();
    assert!(eof.is_none(), "expected EOF for fenced session");
    assert!(!f.hub.has_session("B"));
}

#[tokio::test]
async fn malformed_frames_are_skipped_not_fatal() {
    let f = fixture().await;
    let mut client = connect(&f.hub).await;
    client.write_all(b"this is not json\n").await.unwrap();
    client
        .write_all(session_start_line("A", "/tmp").as_bytes())
        .await
        .unwrap();
    wait_bound(&f.hub, "A").await;
}

#[tokio::test]
async fn permission_response_goes_to_the_originating_connection() {
    let mut f = fixture().await;

    // Runner connection binds the session.
    let mut runner = connect(&f.hub).await;
    runner
        .write_all(session_start_line("A", "/tmp").as_bytes())
        .await
        .unwrap();
    wait_bound(&f.hub, "A").await;

    // Out-of-band hook connection carries the permission request.
    let mut hook = connect(&f.hub).await;
    hook.write_all(
        b"{\"type\":\"permission_request\",\"requestId\":\"r1\",\"sessionId\":\"A\",\"toolName\":\"Bash\",\"toolInput\":{\"command\":\"ls\"}}\n",
    )
    .await
    .unwrap();

    let mut saw_request = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(2), f.events.recv()).await {
        if matches!(event, SessionEvent::PermissionRequest { ref request_id, .. } if request_id == "r1")
        {
            saw_request = true;
            break;
        }
    }
    assert!(saw_request);

    f.router.send_permission_decision(
        "r1",
        session_relay::protocol::PermissionDecision::allow(),
    );

    let (hook_read, _hook_write) = hook.into_split();
    let mut hook_lines = BufReader::new(hook_read).lines();
    let line = timeout(Duration::from_secs(1), hook_lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(line.contains("\"type\":\"permission_response\""));
    assert!(line.contains("\"requestId\":\"r1\""));
    assert!(line.contains("\"behavior\":\"allow\""));
}

#[tokio::test]
async fn second_session_start_replaces_the_binding() {
    let f = fixture().await;
    let mut first = connect(&f.hub).await;
    first
        .write_all(session_start_line("A", "/tmp").as_bytes())
        .await
        .unwrap();
    wait_bound(&f.hub, "A").await;

    let mut second = connect(&f.hub).await;
    second
        .write_all(session_start_line("A", "/tmp").as_bytes())
        .await
        .unwrap();
    // Give the hub a beat to rebind, then verify input lands on the newer
    // connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.router.send_input("A", "ping").unwrap();

    let (second_read, _second_write) = second.into_split();
    let mut lines = BufReader::new(second_read).lines();
    let line = timeout(Duration::from_secs(1), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(line.contains("\"text\":\"ping\""));
    drop(first);
}
