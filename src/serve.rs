//! The accept loop: binds every accepted stream to a connection.

use std::sync::Arc;

use tokio::sync::watch;

use crate::conn::{Binder, Connection};
use crate::error::Error;
use crate::transport::Listener;

/// A running server accepting incoming connections.
pub struct Server {
    state: Arc<ServerState>,
}

struct ServerState {
    listener: Arc<dyn Listener>,
    done: watch::Sender<Option<Result<(), Error>>>,
}

/// Start accepting connections from the listener, binding each accepted
/// stream into a [`Connection`] through the binder.
///
/// Returns immediately; use [`Server::wait`] to block on the server and
/// [`Server::close`] to stop it.
pub fn serve(listener: Arc<dyn Listener>, binder: Arc<dyn Binder>) -> Server {
    let (done, _) = watch::channel(None);
    let state = Arc::new(ServerState { listener, done });
    tokio::spawn(run(state.clone(), binder));
    Server { state }
}

impl Server {
    /// Block until the accept loop has exited and every accepted
    /// connection has terminated. Returns the terminal accept error, if
    /// any; a closed listener is a graceful end.
    pub async fn wait(&self) -> Result<(), Error> {
        let mut done = self.state.done.subscribe();
        let result = match done.wait_for(|status| status.is_some()).await {
            Ok(status) => status.clone().unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };
        result
    }

    /// Stop accepting new connections. Idempotent.
    pub async fn close(&self) -> Result<(), Error> {
        self.state.listener.close().await
    }
}

async fn run(state: Arc<ServerState>, binder: Arc<dyn Binder>) {
    let mut conns: Vec<Connection> = Vec::new();
    let mut terminal: Option<Error> = None;

    loop {
        match state.listener.accept().await {
            Ok(stream) => {
                conns.retain(|conn| !conn.is_done());
                log::debug!("accepted connection ({} active)", conns.len() + 1);
                conns.push(Connection::new(stream, binder.as_ref()));
            }
            Err(e) => {
                if !e.is_closing() {
                    terminal = Some(e);
                }
                break;
            }
        }
    }

    // wait for all active connections to finish before reporting
    for conn in &conns {
        let _ = conn.wait().await;
    }

    let _ = state.done.send_replace(Some(match terminal {
        Some(error) => Err(error),
        None => Ok(()),
    }));
}
