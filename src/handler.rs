//! Capability interfaces for inbound messages.
//!
//! Inbound handling is two-staged: every decoded request is first offered
//! to the [`Preempter`], and only queued for the [`Handler`] when the
//! preempter declines with [`Error::NotHandled`]. This keeps cancellation
//! and other out-of-order signals from ever sitting behind a long-running
//! handler.

use async_trait::async_trait;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::message::Request;

/// What a handling stage produced.
///
/// `Ok(Some(_))` is a result for the wire, `Ok(None)` means "done, nothing
/// to report" (only legal for notifications); [`Error::NotHandled`] falls
/// through to the next stage, [`Error::AsyncResponse`] leaves the call
/// open for a deferred [`Connection::respond`](crate::conn::Connection::respond);
/// any other error becomes an error response.
pub type HandlerResult = Result<Option<Box<RawValue>>, Error>;

/// Runs before a request is queued. Must not block and must not issue new
/// messages on the connection; intended for cancellation notifications,
/// trivial answers and status probes.
#[async_trait]
pub trait Preempter: Send + Sync {
    async fn preempt(&self, cancel: &CancellationToken, request: &Request) -> HandlerResult;
}

/// Runs after queueing, strictly in arrival order. May block; the token is
/// cancelled when [`Connection::cancel`](crate::conn::Connection::cancel)
/// is invoked for the request's id.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, request: &Request) -> HandlerResult;
}

/// Declines every message, letting calls fall through to a method-not-found
/// response.
pub struct DefaultHandler;

#[async_trait]
impl Preempter for DefaultHandler {
    async fn preempt(&self, _cancel: &CancellationToken, _request: &Request) -> HandlerResult {
        Err(Error::NotHandled)
    }
}

#[async_trait]
impl Handler for DefaultHandler {
    async fn handle(&self, _cancel: &CancellationToken, _request: &Request) -> HandlerResult {
        Err(Error::NotHandled)
    }
}
