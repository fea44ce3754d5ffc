//! The connection engine.
//!
//! A [`Connection`] is a symmetric JSON-RPC endpoint over one duplex byte
//! stream: it issues outbound calls and notifications while serving
//! inbound ones, with no designated client or server end.
//!
//! Three tasks run per connection, joined by bounded channels:
//!
//! 1. the *reader* decodes frames, correlates responses to pending calls
//!    and forwards requests downstream;
//! 2. the *queue manager* offers every request to the
//!    [`Preempter`](crate::handler::Preempter) before queueing it;
//! 3. the *deliverer* runs the [`Handler`](crate::handler::Handler) over
//!    the queue strictly in order and writes the replies.
//!
//! All writes funnel through a single ownership slot, so frames are never
//! interleaved.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorCode, ErrorObject};
use crate::frame::{Framing, MessageReader, MessageWriter};
use crate::handler::{DefaultHandler, Handler, HandlerResult, Preempter};
use crate::message::{raw_json, Message, Request, RequestId, Response};
use crate::transport::BoxedStream;

/// Per-connection configuration produced by a [`Binder`].
pub struct ConnectionOptions {
    /// The wire framing.
    pub framing: Framing,
    /// First-stage inbound handler.
    pub preempter: Arc<dyn Preempter>,
    /// Main inbound handler.
    pub handler: Arc<dyn Handler>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            preempter: Arc::new(DefaultHandler),
            handler: Arc::new(DefaultHandler),
        }
    }
}

/// A per-connection factory: given the bare connection, produce the
/// framing and handlers to install before the engine starts.
///
/// The connection is `Clone`, so a binder may capture it for use inside
/// its handlers (issuing calls back to the peer, deferred responds,
/// cancellation).
pub trait Binder: Send + Sync {
    fn bind(&self, conn: &Connection) -> ConnectionOptions;
}

impl<F> Binder for F
where
    F: Fn(&Connection) -> ConnectionOptions + Send + Sync,
{
    fn bind(&self, conn: &Connection) -> ConnectionOptions {
        self(conn)
    }
}

/// A bidirectional JSON-RPC 2.0 connection.
#[derive(Clone)]
pub struct Connection {
    state: Arc<ConnState>,
}

struct ConnState {
    seq: AtomicI64,
    /// Single-slot writer ownership: whoever holds the guard holds the
    /// write token. Emptied at teardown so later writes fail with
    /// [`Error::Closed`].
    writer: tokio::sync::Mutex<Option<Box<dyn MessageWriter>>>,
    pending: Mutex<PendingTable>,
    /// Inbound calls still awaiting their reply, keyed by id. The token
    /// is the call's handling context; removal is what makes replies
    /// at-most-once.
    inbound: Mutex<HashMap<RequestId, CancellationToken>>,
    /// Cancelled by [`Connection::close`]; the reader treats it as a
    /// recognised closing condition.
    shutdown: CancellationToken,
    done: watch::Sender<Option<Result<(), Error>>>,
}

struct PendingTable {
    calls: HashMap<RequestId, oneshot::Sender<Result<Response, Error>>>,
    /// Once the connection has failed, new calls resolve immediately
    /// with this error.
    failed: Option<Error>,
}

/// An inbound request travelling through the pipeline.
struct Incoming {
    request: Request,
    cancel: CancellationToken,
}

impl Connection {
    /// Bind a duplex stream into a running connection.
    pub fn new(stream: BoxedStream, binder: &dyn Binder) -> Connection {
        let (done, _) = watch::channel(None);
        let state = Arc::new(ConnState {
            seq: AtomicI64::new(0),
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(PendingTable {
                calls: HashMap::new(),
                failed: None,
            }),
            inbound: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            done,
        });
        let conn = Connection {
            state: state.clone(),
        };

        let options = binder.bind(&conn);
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = options.framing.reader(read_half);
        let writer = options.framing.writer(write_half);
        *state
            .writer
            .try_lock()
            .expect("writer slot is free at construction") = Some(writer);

        tokio::spawn(run(state, reader, options.preempter, options.handler));
        conn
    }

    /// Send a notification and return the writer's verdict.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), Error> {
        let params = raw_json(&params)?;
        log::debug!("notify {method:?}");
        let message = Message::Request(Request::notification(method, Some(params)));
        write_message(&self.state, &message).await.map(|_| ())
    }

    /// Issue a call with a freshly allocated identifier.
    ///
    /// The returned handle resolves once the matching response, a local
    /// failure, or the connection's demise delivers a result; a failed
    /// initial write surfaces from [`PendingCall::wait`] as well.
    pub async fn request<P: Serialize>(&self, method: &str, params: P) -> PendingCall {
        let id = RequestId::number(self.state.seq.fetch_add(1, Ordering::SeqCst) + 1);
        let params = match raw_json(&params) {
            Ok(params) => params,
            Err(e) => return PendingCall::resolved(id, Err(e)),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.state.pending.lock().unwrap();
            if let Some(failed) = pending.failed.clone() {
                let _ = tx.send(Err(failed));
            } else {
                pending.calls.insert(id.clone(), tx);
            }
        }

        log::debug!("call {method:?} (id {})", id.quoted());
        let message = Message::Request(Request::call(id.clone(), method, Some(params)));
        if let Err(e) = write_message(&self.state, &message).await {
            // undo the registration and park the error in the handle
            let tx = self.state.pending.lock().unwrap().calls.remove(&id);
            if let Some(tx) = tx {
                let _ = tx.send(Err(e));
            }
        }
        PendingCall {
            id,
            rx,
            received: None,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Issue a call and wait for its decoded result.
    pub async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<T, Error> {
        self.request(method, params).await.response().await
    }

    /// Cancel the handling context of an inbound call. A no-op when the
    /// id is unknown or the call already replied.
    ///
    /// This is the hook for layering a cancellation protocol on top of
    /// JSON-RPC: a preempter decodes the peer's cancel notification and
    /// calls this with the carried id.
    pub fn cancel(&self, id: &RequestId) {
        let token = self.state.inbound.lock().unwrap().get(id).cloned();
        if let Some(token) = token {
            log::debug!("cancelling inbound request {}", id.quoted());
            token.cancel();
        }
    }

    /// Deliver the deferred response for a call whose handler returned
    /// [`Error::AsyncResponse`]. Exactly one respond completes the call;
    /// later ones are no-ops.
    pub async fn respond<R: Serialize>(
        &self,
        id: &RequestId,
        result: Result<R, Error>,
    ) -> Result<(), Error> {
        let outcome = match result {
            Ok(value) => Ok(raw_json(&value)?),
            Err(e) => Err(e.to_error_object()),
        };
        if self.state.inbound.lock().unwrap().remove(id).is_none() {
            return Ok(());
        }
        let response = match outcome {
            Ok(result) => Response::success(id.clone(), result),
            Err(error) => Response::failure(id.clone(), error),
        };
        write_message(&self.state, &Message::Response(response))
            .await
            .map(|_| ())
    }

    /// Close the connection and wait until all in-flight inbound handling
    /// has completed. Idempotent; later calls return immediately.
    pub async fn close(&self) -> Result<(), Error> {
        self.state.shutdown.cancel();
        let mut done = self.state.done.subscribe();
        let _ = done.wait_for(|status| status.is_some()).await;
        Ok(())
    }

    /// Block until the engine terminates; returns the terminal error, if
    /// any. Graceful shutdown yields `Ok`.
    pub async fn wait(&self) -> Result<(), Error> {
        let mut done = self.state.done.subscribe();
        let result = match done.wait_for(|status| status.is_some()).await {
            Ok(status) => status.clone().unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };
        result
    }

    /// Whether the engine has terminated. Non-blocking.
    pub fn is_done(&self) -> bool {
        self.state.done.borrow().is_some()
    }
}

/// The result handle of an outbound call.
pub struct PendingCall {
    id: RequestId,
    rx: oneshot::Receiver<Result<Response, Error>>,
    received: Option<Result<Response, Error>>,
    state: Weak<ConnState>,
}

impl PendingCall {
    fn resolved(id: RequestId, result: Result<Response, Error>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            id,
            rx,
            received: None,
            state: Weak::new(),
        }
    }

    /// The identifier allocated to the call.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Whether a result has already arrived. Non-blocking.
    pub fn is_ready(&mut self) -> bool {
        if self.received.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.received = Some(result);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.received = Some(Err(Error::Closed));
                true
            }
        }
    }

    /// Wait for the raw response.
    ///
    /// Exactly one of a peer response, a local failure, or the connection
    /// error is delivered. Callers own their timeouts: wrap this in
    /// `tokio::time::timeout` or a `select!` as needed; abandoning the
    /// handle does not cancel the remote side.
    pub async fn wait(&mut self) -> Result<Response, Error> {
        if self.received.is_none() {
            let result = (&mut self.rx).await.unwrap_or(Err(Error::Closed));
            self.received = Some(result);
        }
        self.received.clone().unwrap_or(Err(Error::Closed))
    }

    /// Wait for the response and decode its result.
    pub async fn response<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let response = self.wait().await?;
        match response.result {
            Ok(result) => serde_json::from_str(result.get())
                .map_err(|e| Error::Parse(format!("failed to decode result: {e}"))),
            Err(error) => Err(Error::Response(error)),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // an abandoned call frees its correlation slot
        if self.received.is_none() {
            if let Some(state) = self.state.upgrade() {
                if let Ok(mut pending) = state.pending.lock() {
                    pending.calls.remove(&self.id);
                }
            }
        }
    }
}

/// Supervises the three pipeline tasks and performs teardown.
async fn run(
    state: Arc<ConnState>,
    reader: Box<dyn MessageReader>,
    preempter: Arc<dyn Preempter>,
    handler: Arc<dyn Handler>,
) {
    let (seq_tx, seq_rx) = mpsc::channel(8);
    let (deliver_tx, deliver_rx) = mpsc::channel(1);

    let read_task = tokio::spawn(read_loop(state.clone(), reader, seq_tx));
    let queue_task = tokio::spawn(queue_loop(state.clone(), preempter, seq_rx, deliver_tx));
    let deliver_task = tokio::spawn(deliver_loop(state.clone(), handler, deliver_rx));

    let read_status = read_task
        .await
        .unwrap_or_else(|e| Err(Error::Internal(format!("reader task failed: {e}"))));
    let _ = queue_task.await;
    let _ = deliver_task.await;

    let error = read_status.err();
    if let Some(error) = &error {
        log::debug!("connection failed: {error}");
        // unwind handlers stranded by the failure
        for token in state.inbound.lock().unwrap().values() {
            token.cancel();
        }
    }

    // every still-pending call gets the synthesised terminal error
    let failure = error.clone().unwrap_or(Error::Closed);
    let waiters: Vec<_> = {
        let mut pending = state.pending.lock().unwrap();
        pending.failed = Some(failure.clone());
        pending.calls.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
        let _ = tx.send(Err(failure.clone()));
    }

    if let Some(mut writer) = state.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }

    let _ = state.done.send_replace(Some(match error {
        Some(error) => Err(error),
        None => Ok(()),
    }));
}

/// Single consumer of the framing reader: correlates responses, wraps
/// requests into inbound entries. Returns `Ok` on a graceful end of the
/// stream and `Err` on a fatal framing or I/O failure.
async fn read_loop(
    state: Arc<ConnState>,
    mut reader: Box<dyn MessageReader>,
    seq_tx: mpsc::Sender<Incoming>,
) -> Result<(), Error> {
    loop {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => return Ok(()),
            read = reader.read() => match read {
                Ok((message, _len)) => message,
                Err(e) if e.is_closing() => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        match message {
            Message::Response(response) => {
                let waiter = state.pending.lock().unwrap().calls.remove(&response.id);
                match waiter {
                    Some(tx) => {
                        log::debug!("response for call {}", response.id.quoted());
                        let _ = tx.send(Ok(response));
                    }
                    // a response nobody is waiting for is dropped
                    None => log::trace!("dropping response for unknown id {}", response.id.quoted()),
                }
            }
            Message::Request(request) => {
                log::debug!("received {:?} (id {:?})", request.method, request.id);
                let cancel = CancellationToken::new();
                if let Some(id) = &request.id {
                    state
                        .inbound
                        .lock()
                        .unwrap()
                        .insert(id.clone(), cancel.clone());
                }
                let entry = Incoming { request, cancel };
                if seq_tx.send(entry).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Offers each entry to the preempter, then queues it for the deliverer.
/// When the queue is non-empty both "receive next" and "send head" are
/// offered at once, so a slow deliverer never stalls preemption.
async fn queue_loop(
    state: Arc<ConnState>,
    preempter: Arc<dyn Preempter>,
    mut seq_rx: mpsc::Receiver<Incoming>,
    deliver_tx: mpsc::Sender<Incoming>,
) {
    let mut queue: VecDeque<Incoming> = VecDeque::new();
    loop {
        if queue.is_empty() {
            match seq_rx.recv().await {
                Some(entry) => {
                    if let Some(entry) = preempt(&state, preempter.as_ref(), entry).await {
                        queue.push_back(entry);
                    }
                }
                None => break,
            }
        } else {
            tokio::select! {
                received = seq_rx.recv() => match received {
                    Some(entry) => {
                        if let Some(entry) = preempt(&state, preempter.as_ref(), entry).await {
                            queue.push_back(entry);
                        }
                    }
                    None => break,
                },
                permit = deliver_tx.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(entry) = queue.pop_front() {
                            permit.send(entry);
                        }
                    }
                    Err(_) => return,
                },
            }
        }
    }
    // the reader is gone; hand the backlog over before closing the queue
    for entry in queue {
        if deliver_tx.send(entry).await.is_err() {
            break;
        }
    }
}

/// One preemption step. Returns the entry back when it should be queued.
async fn preempt(
    state: &Arc<ConnState>,
    preempter: &dyn Preempter,
    entry: Incoming,
) -> Option<Incoming> {
    if entry.cancel.is_cancelled() {
        reply(state, &entry, Err(Error::Cancelled)).await;
        return None;
    }
    match preempter.preempt(&entry.cancel, &entry.request).await {
        Err(Error::NotHandled) => Some(entry),
        Err(Error::AsyncResponse) => None,
        result => {
            reply(state, &entry, result).await;
            None
        }
    }
}

/// Runs the main handler over queued entries, strictly in order.
async fn deliver_loop(
    state: Arc<ConnState>,
    handler: Arc<dyn Handler>,
    mut deliver_rx: mpsc::Receiver<Incoming>,
) {
    while let Some(entry) = deliver_rx.recv().await {
        if entry.cancel.is_cancelled() {
            reply(&state, &entry, Err(Error::Cancelled)).await;
            continue;
        }
        match handler.handle(&entry.cancel, &entry.request).await {
            Err(Error::NotHandled) => {
                let method = entry.request.method.clone();
                reply(&state, &entry, Err(Error::MethodNotFound(method))).await;
            }
            Err(Error::AsyncResponse) => {}
            result => reply(&state, &entry, result).await,
        }
    }
}

/// Finalise an inbound entry.
///
/// Calls get at most one wire response: whoever removes the table entry
/// writes it. The write does not consult the handle token, so a reply
/// still flows for a cancelled call. Notifications never produce a wire
/// reply.
async fn reply(state: &Arc<ConnState>, entry: &Incoming, result: HandlerResult) {
    let Some(id) = &entry.request.id else {
        match result {
            Ok(None) => {}
            Ok(Some(_)) => log::error!(
                "notification {:?} produced an unwanted response",
                entry.request.method
            ),
            Err(e) => log::error!("notification {:?} failed: {e}", entry.request.method),
        }
        return;
    };

    if state.inbound.lock().unwrap().remove(id).is_none() {
        log::warn!("duplicate reply for request {} dropped", id.quoted());
        return;
    }

    let response = match result {
        Ok(Some(result)) => Response::success(id.clone(), result),
        Ok(None) => Response::failure(
            id.clone(),
            ErrorObject::with_message(
                ErrorCode::InternalError,
                format!("method {:?} did not produce a result", entry.request.method),
            ),
        ),
        Err(e) => Response::failure(id.clone(), e.to_error_object()),
    };
    if let Err(e) = write_message(state, &Message::Response(response)).await {
        log::error!("failed to write reply for request {}: {e}", id.quoted());
    }
}

/// Take the write token, write one frame, release the token.
async fn write_message(state: &ConnState, message: &Message) -> Result<u64, Error> {
    let mut slot = state.writer.lock().await;
    match slot.as_mut() {
        Some(writer) => writer.write(message).await,
        None => Err(Error::Closed),
    }
}
