//! # taiwa - bidirectional JSON-RPC 2.0
//!
//! A symmetric JSON-RPC 2.0 peer over a single duplex byte stream: one
//! [`Connection`] simultaneously issues outbound calls and notifications
//! and serves inbound ones. There is no designated client or server end.
//!
//! ## Features
//!
//! - **Two framings**: bare JSON objects or LSP-style `Content-Length`
//!   headers, chosen per connection
//! - **Correlation**: outbound calls return a [`PendingCall`] handle that
//!   resolves when the matching response (or the connection's failure)
//!   arrives
//! - **Two-stage inbound pipeline**: a non-blocking [`Preempter`] sees
//!   every request before it is queued for the [`Handler`], so
//!   cancellation and status probes never wait behind a slow method
//! - **Deferred replies**: a handler may return [`Error::AsyncResponse`]
//!   and complete the call later with [`Connection::respond`]
//! - **Transports**: TCP and unix sockets, in-memory pipes, arbitrary
//!   reader/writer pairs, plus an idle-timeout listener wrapper
//!
//! ## Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), taiwa::Error> {
//! use std::sync::Arc;
//! use taiwa::{serve, Connection, ConnectionOptions, Dialer, Listener, PipeListener};
//!
//! let listener = Arc::new(PipeListener::new());
//! let dialer = listener.dialer().expect("pipe listeners always dial");
//! let server = serve(listener, Arc::new(|_conn: &Connection| ConnectionOptions::default()));
//!
//! let conn = Connection::new(
//!     dialer.dial().await?,
//!     &|_conn: &Connection| ConnectionOptions::default(),
//! );
//! let pong: String = conn.call("ping", ()).await?;
//! conn.close().await?;
//! server.close().await?;
//! # Ok(()) }
//! ```

pub mod conn;
pub mod error;
pub mod frame;
pub mod handler;
pub mod message;
pub mod serve;
pub mod transport;

pub use conn::{Binder, Connection, ConnectionOptions, PendingCall};
pub use error::{Error, ErrorCode, ErrorObject};
pub use frame::{Framing, MessageReader, MessageWriter};
pub use handler::{DefaultHandler, Handler, HandlerResult, Preempter};
pub use message::{raw_json, Message, Request, RequestId, Response};
pub use serve::{serve, Server};
pub use transport::{
    stdio, BoxedStream, Dialer, Duplex, IdleListener, Listener, NetDialer, NetListener,
    PipeListener, StreamPair,
};
