//! End-to-end connection tests: a pair of peers over an in-memory duplex
//! stream, exercised under both framings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use taiwa::{
    raw_json, Binder, Connection, ConnectionOptions, Error, Framing, Handler, HandlerResult,
    Message, Preempter, Request, RequestId,
};

/// Shared state of the test service: an accumulator plus named waiters.
#[derive(Default)]
struct ServiceState {
    total: Mutex<i64>,
    waiters: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ServiceState {
    fn waiter(&self, label: &str) -> Arc<Semaphore> {
        self.waiters
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }
}

/// Handles `unblock`, `peek` and `cancel` before the queue, so they work
/// even while the main handler is busy.
struct ServicePreempter {
    state: Arc<ServiceState>,
    conn: Connection,
}

#[async_trait]
impl Preempter for ServicePreempter {
    async fn preempt(&self, _cancel: &CancellationToken, request: &Request) -> HandlerResult {
        match request.method.as_str() {
            "unblock" => {
                let label: String = request.decode_params()?;
                self.state.waiter(&label).add_permits(1);
                Ok(None)
            }
            "peek" => Ok(Some(raw_json(&*self.state.total.lock().unwrap())?)),
            "cancel" => {
                let id: RequestId = request.decode_params()?;
                self.conn.cancel(&id);
                Ok(None)
            }
            _ => Err(Error::NotHandled),
        }
    }
}

struct ServiceHandler {
    state: Arc<ServiceState>,
    conn: Connection,
}

#[async_trait]
impl Handler for ServiceHandler {
    async fn handle(&self, cancel: &CancellationToken, request: &Request) -> HandlerResult {
        match request.method.as_str() {
            "no_args" => {
                let params: Option<serde_json::Value> = request.decode_params()?;
                if params.is_some() {
                    return Err(Error::InvalidParams("expected no params".to_string()));
                }
                Ok(Some(raw_json(&true)?))
            }
            "one_string" => {
                let s: String = request.decode_params()?;
                Ok(Some(raw_json(&format!("got:{s}"))?))
            }
            "one_number" => {
                let n: i64 = request.decode_params()?;
                Ok(Some(raw_json(&format!("got:{n}"))?))
            }
            "join" => {
                let parts: Vec<String> = request.decode_params()?;
                Ok(Some(raw_json(&parts.join("/"))?))
            }
            "set" => {
                let value: i64 = request.decode_params()?;
                *self.state.total.lock().unwrap() = value;
                Ok(None)
            }
            "add" => {
                let value: i64 = request.decode_params()?;
                *self.state.total.lock().unwrap() += value;
                Ok(None)
            }
            "get" => Ok(Some(raw_json(&*self.state.total.lock().unwrap())?)),
            "nothing" => Ok(None),
            "wait" => {
                let label: String = request.decode_params()?;
                let waiter = self.state.waiter(&label);
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    permit = waiter.acquire() => {
                        permit.expect("test semaphore is never closed").forget();
                        Ok(Some(raw_json(&true)?))
                    }
                }
            }
            "fork" => {
                let label: String = request.decode_params()?;
                let id = request.id.clone().expect("fork is always a call");
                let waiter = self.state.waiter(&label);
                let conn = self.conn.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        permit = waiter.acquire() => {
                            permit.expect("test semaphore is never closed").forget();
                            Ok(true)
                        }
                    };
                    let _ = conn.respond(&id, result).await;
                });
                Err(Error::AsyncResponse)
            }
            _ => Err(Error::NotHandled),
        }
    }
}

fn service_binder(framing: Framing) -> impl Binder {
    let state = Arc::new(ServiceState::default());
    move |conn: &Connection| ConnectionOptions {
        framing,
        preempter: Arc::new(ServicePreempter {
            state: state.clone(),
            conn: conn.clone(),
        }),
        handler: Arc::new(ServiceHandler {
            state: state.clone(),
            conn: conn.clone(),
        }),
    }
}

/// Two service peers over one in-memory stream. Each side keeps its own
/// accumulator.
fn pair(framing: Framing) -> (Connection, Connection) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let left = Connection::new(Box::new(a), &service_binder(framing));
    let right = Connection::new(Box::new(b), &service_binder(framing));
    (left, right)
}

#[tokio::test]
async fn test_basic_calls_both_framings_both_directions() {
    for framing in [Framing::Raw, Framing::Header] {
        let (left, right) = pair(framing);
        for conn in [&left, &right] {
            let result: bool = conn.call("no_args", ()).await.unwrap();
            assert!(result);

            let result: String = conn.call("one_string", "fish").await.unwrap();
            assert_eq!(result, "got:fish");

            let result: String = conn.call("one_number", 10).await.unwrap();
            assert_eq!(result, "got:10");

            let result: String = conn.call("join", ["a", "b", "c"]).await.unwrap();
            assert_eq!(result, "a/b/c");
        }
        left.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_invalid_params_and_unknown_method() {
    let (left, _right) = pair(Framing::Header);

    let err = left
        .call::<_, bool>("no_args", "surprise")
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Response(e) if e.code == -32602), "got {err:?}");

    let err = left.call::<_, bool>("missing", ()).await.unwrap_err();
    assert!(matches!(&err, Error::Response(e) if e.code == -32601), "got {err:?}");
}

#[tokio::test]
async fn test_preempt_accumulator() {
    for framing in [Framing::Raw, Framing::Header] {
        let (left, _right) = pair(framing);
        left.notify("set", 3).await.unwrap();
        left.notify("add", 5).await.unwrap();
        let total: i64 = left.call("get", ()).await.unwrap();
        assert_eq!(total, 8);
    }
}

#[tokio::test]
async fn test_cancel_fails_a_waiting_call() {
    for framing in [Framing::Raw, Framing::Header] {
        let (left, _right) = pair(framing);
        let mut call = left.request("wait", "b").await;
        left.notify("cancel", call.id()).await.unwrap();
        let err = call.response::<bool>().await.unwrap_err();
        assert!(matches!(&err, Error::Response(e) if e.code == -32800), "got {err:?}");
    }
}

#[tokio::test]
async fn test_queue_order_with_preempt_bypass() {
    for framing in [Framing::Raw, Framing::Header] {
        let (left, _right) = pair(framing);

        // park the main handler on a waiter
        let mut blocked = left.request("wait", "a").await;

        // these stay queued behind the waiter...
        left.notify("set", 1).await.unwrap();
        left.notify("add", 2).await.unwrap();
        left.notify("add", 3).await.unwrap();
        left.notify("add", 4).await.unwrap();

        // ...while the preempter answers immediately
        let peeked: i64 = left.call("peek", ()).await.unwrap();
        assert_eq!(peeked, 0);
        assert!(!blocked.is_ready());

        left.notify("unblock", "a").await.unwrap();
        let released: bool = blocked.response().await.unwrap();
        assert!(released);

        // queued work ran in order once the waiter finished
        let total: i64 = left.call("get", ()).await.unwrap();
        assert_eq!(total, 10);
    }
}

#[tokio::test]
async fn test_fork_defers_the_response() {
    for framing in [Framing::Raw, Framing::Header] {
        let (left, right) = pair(framing);

        let mut forked = left.request("fork", "c").await;
        let fork_id = forked.id().clone();

        // the deferred call does not occupy the handler
        left.notify("set", 7).await.unwrap();
        let total: i64 = left.call("get", ()).await.unwrap();
        assert_eq!(total, 7);
        assert!(!forked.is_ready());

        left.notify("unblock", "c").await.unwrap();
        let result: bool = forked.response().await.unwrap();
        assert!(result);

        // a second respond for the same id is a no-op
        right.respond(&fork_id, Ok(false)).await.unwrap();
        let total: i64 = left.call("get", ()).await.unwrap();
        assert_eq!(total, 7);
    }
}

#[tokio::test]
async fn test_graceful_close_is_idempotent() {
    let (left, right) = pair(Framing::Header);
    let result: bool = left.call("no_args", ()).await.unwrap();
    assert!(result);

    left.close().await.unwrap();
    left.close().await.unwrap();
    left.wait().await.unwrap();

    // the peer sees a clean end of stream
    right.wait().await.unwrap();
    assert!(right.is_done());
}

#[tokio::test]
async fn test_connection_failure_resolves_pending_calls() {
    let (left, _right) = pair(Framing::Header);
    let mut stuck = left.request("wait", "never").await;
    left.close().await.unwrap();
    let err = stuck.wait().await.unwrap_err();
    assert!(matches!(err, Error::Closed), "got {err:?}");

    // calls issued after the failure resolve immediately
    let err = left.call::<_, bool>("no_args", ()).await.unwrap_err();
    assert!(matches!(err, Error::Closed), "got {err:?}");
}

#[tokio::test]
async fn test_call_without_result_is_an_internal_error() {
    let (left, _right) = pair(Framing::Header);
    // "nothing" completes without producing a result, which is only legal
    // for notifications
    let err = left
        .call::<_, serde_json::Value>("nothing", ())
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Response(e) if e.code == -32603), "got {err:?}");
}

#[tokio::test]
async fn test_notify_after_close_fails() {
    let (left, _right) = pair(Framing::Header);
    left.close().await.unwrap();
    let err = left.notify("set", 1).await.unwrap_err();
    assert!(matches!(err, Error::Closed), "got {err:?}");
}

// --- manual peer tests: hand-written frames through the other half ---

fn header_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(body);
    frame
}

fn manual_peer() -> (
    Connection,
    Box<dyn taiwa::MessageReader>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(Box::new(a), &|_conn: &Connection| ConnectionOptions::default());
    let (peer_read, peer_write) = tokio::io::split(b);
    (conn, Framing::Header.reader(peer_read), peer_write)
}

#[tokio::test]
async fn test_unknown_response_id_is_dropped_silently() {
    let (_conn, mut peer_reader, mut peer_write) = manual_peer();

    // nobody is waiting for id 99; the engine must shrug it off
    peer_write
        .write_all(&header_frame(br#"{"jsonrpc":"2.0","id":99,"result":true}"#))
        .await
        .unwrap();
    // a call afterwards still gets its method-not-found reply
    peer_write
        .write_all(&header_frame(br#"{"jsonrpc":"2.0","id":1,"method":"nope"}"#))
        .await
        .unwrap();

    let (message, _) = peer_reader.read().await.unwrap();
    match message {
        Message::Response(response) => {
            assert_eq!(response.id, RequestId::number(1));
            assert_eq!(response.result.unwrap_err().code, -32601);
        }
        other => panic!("expected a response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_string_ids_are_served_and_echoed_back() {
    let (_conn, mut peer_reader, mut peer_write) = manual_peer();

    peer_write
        .write_all(&header_frame(br#"{"jsonrpc":"2.0","id":"abc","method":"nope"}"#))
        .await
        .unwrap();

    let (message, _) = peer_reader.read().await.unwrap();
    match message {
        Message::Response(response) => {
            assert_eq!(response.id, RequestId::string("abc"));
            assert_eq!(response.result.unwrap_err().code, -32601);
        }
        other => panic!("expected a response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_responses_correlate_out_of_order() {
    let (conn, mut peer_reader, mut peer_write) = manual_peer();

    let mut first = conn.request("m1", ()).await;
    let mut second = conn.request("m2", ()).await;

    let first_id = match peer_reader.read().await.unwrap().0 {
        Message::Request(request) => request.id.unwrap(),
        other => panic!("expected a request, got {other:?}"),
    };
    let second_id = match peer_reader.read().await.unwrap().0 {
        Message::Request(request) => request.id.unwrap(),
        other => panic!("expected a request, got {other:?}"),
    };
    assert_ne!(first_id, second_id);

    // answer in reverse order; correlation is by identifier only
    let body = format!(r#"{{"jsonrpc":"2.0","id":{second_id},"result":"two"}}"#);
    peer_write.write_all(&header_frame(body.as_bytes())).await.unwrap();
    let body = format!(r#"{{"jsonrpc":"2.0","id":{first_id},"result":"one"}}"#);
    peer_write.write_all(&header_frame(body.as_bytes())).await.unwrap();

    assert_eq!(second.response::<String>().await.unwrap(), "two");
    assert_eq!(first.response::<String>().await.unwrap(), "one");
}

#[tokio::test]
async fn test_version_mismatch_is_fatal() {
    let (conn, _peer_reader, mut peer_write) = manual_peer();

    let mut call = conn.request("m", ()).await;
    peer_write
        .write_all(&header_frame(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#))
        .await
        .unwrap();

    let err = conn.wait().await.unwrap_err();
    assert!(matches!(err, Error::Version(_)), "got {err:?}");
    // the pending call receives the synthesised terminal error
    let err = call.wait().await.unwrap_err();
    assert!(matches!(err, Error::Version(_)), "got {err:?}");
}

#[tokio::test]
async fn test_malformed_frame_is_fatal_under_raw_framing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (a, b) = tokio::io::duplex(4096);
    let conn = Connection::new(Box::new(a), &|_conn: &Connection| ConnectionOptions {
        framing: Framing::Raw,
        ..ConnectionOptions::default()
    });
    let (_peer_read, mut peer_write) = tokio::io::split(b);

    peer_write.write_all(b"this is not json").await.unwrap();
    let err = conn.wait().await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)), "got {err:?}");
}
