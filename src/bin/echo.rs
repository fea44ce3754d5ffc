//! Echo demo: a served echo peer and a dialing client in one process,
//! wired through an in-memory pipe listener.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use taiwa::{
    raw_json, serve, Connection, ConnectionOptions, DefaultHandler, Error, Handler, HandlerResult,
    Listener, PipeListener, Request,
};

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, _cancel: &CancellationToken, request: &Request) -> HandlerResult {
        match request.method.as_str() {
            "echo" => {
                let params = request.params.clone().unwrap_or(raw_json(&())?);
                Ok(Some(params))
            }
            "ping" => Ok(Some(raw_json(&"pong")?)),
            _ => Err(Error::NotHandled),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let listener = Arc::new(PipeListener::new());
    let dialer = listener.dialer().expect("pipe listeners always dial");

    let server = serve(
        listener,
        Arc::new(|_conn: &Connection| ConnectionOptions {
            handler: Arc::new(EchoHandler),
            ..ConnectionOptions::default()
        }),
    );

    let client = Connection::new(dialer.dial().await?, &|_conn: &Connection| {
        ConnectionOptions {
            handler: Arc::new(DefaultHandler),
            ..ConnectionOptions::default()
        }
    });

    let pong: String = client.call("ping", ()).await?;
    println!("ping -> {pong}");

    let echoed: serde_json::Value = client
        .call("echo", json!({"greeting": "hello", "n": 3}))
        .await?;
    println!("echo -> {echoed}");

    client.close().await?;
    server.close().await?;
    server.wait().await
}
