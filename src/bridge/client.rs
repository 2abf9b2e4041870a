//! Client side of the control channel.
//!
//! Wrapper processes use [`BridgeClient`] for every backend exchange. The
//! client owns its correlation ids and matches responses by id; response
//! lines that are malformed or carry an unknown id are dropped silently -
//! the bridge must never crash on backend noise.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::bridge::protocol::{self, Request, Response, decode_line, write_frame};
use crate::config::BridgeConfig;
use crate::error::{Result, ScryError};

/// Connected control channel client.
#[derive(Debug)]
pub struct BridgeClient {
    reader: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: AtomicU64,
}

impl BridgeClient {
    /// Connect to a running backend. Does not spawn one: that is
    /// [`ensure_backend`](super::auto_start::ensure_backend)'s job.
    pub async fn connect(config: &BridgeConfig) -> Result<Self> {
        let addr = config.control_addr();
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            ScryError::BackendConnection(format!("Failed to connect to backend at {addr}: {e}"))
        })?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream (tests connect to custom addresses).
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
            next_id: AtomicU64::new(1),
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A response whose id does not match, or that fails to decode, is
    /// skipped; the call resolves on the first frame addressed to this
    /// request. A backend-side `{error}` becomes [`ScryError::Backend`].
    pub async fn send(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let request = Request::new(&id, method, params);

        write_frame(&mut self.writer, &request).await.map_err(|e| {
            ScryError::BackendProtocol(format!("Failed to send request: {e}"))
        })?;

        loop {
            let line = self
                .reader
                .next_line()
                .await
                .map_err(|e| ScryError::BackendProtocol(format!("Failed to read response: {e}")))?
                .ok_or_else(|| {
                    ScryError::BackendConnection("Backend closed the connection".to_string())
                })?;

            let response: Response = match decode_line(&line) {
                Ok(Some(response)) => response,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Dropping malformed response line");
                    continue;
                }
            };

            if response.id != id {
                tracing::debug!(got = %response.id, expected = %id, "Dropping unmatched response");
                continue;
            }

            return match response.error {
                Some(error) => Err(ScryError::Backend(error.message)),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
        }
    }

    /// Liveness check against the backend.
    pub async fn ping(&mut self) -> Result<()> {
        let result = self.send(protocol::METHOD_PING, None).await?;
        match result.get("ok").and_then(Value::as_bool) {
            Some(true) => Ok(()),
            _ => Err(ScryError::BackendProtocol(format!("Unexpected ping reply: {result}"))),
        }
    }

    /// Fetch the tool catalogue.
    pub async fn list_tools(&mut self) -> Result<Value> {
        self.send(protocol::METHOD_LIST_TOOLS, None).await
    }

    /// Invoke a tool by name.
    pub async fn call_tool(&mut self, name: &str, args: Value) -> Result<Value> {
        self.send(
            protocol::METHOD_CALL_TOOL,
            Some(json!({"name": name, "args": args})),
        )
        .await
    }

    /// Backend status: version, PID, gateway state, queue counters.
    pub async fn status(&mut self) -> Result<Value> {
        self.send(protocol::METHOD_STATUS, None).await
    }

    /// Ask the backend to shut down gracefully.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.send(protocol::METHOD_SHUTDOWN, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// A scripted backend: answers each request line with fixed raw lines.
    async fn scripted_backend(replies: Vec<String>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let mut replies = replies.into_iter();

            while let Ok(Some(_request)) = lines.next_line().await {
                match replies.next() {
                    Some(reply) => {
                        write_half.write_all(reply.as_bytes()).await.unwrap();
                        write_half.write_all(b"\n").await.unwrap();
                    }
                    None => break,
                }
            }
        });
        addr
    }

    async fn client_for(addr: std::net::SocketAddr) -> BridgeClient {
        BridgeClient::from_stream(TcpStream::connect(addr).await.unwrap())
    }

    #[tokio::test]
    async fn send_matches_response_by_id() {
        // First client-chosen id is "1".
        let addr = scripted_backend(vec![r#"{"id":"1","result":{"ok":true}}"#.to_string()]).await;
        let mut client = client_for(addr).await;

        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn noise_before_the_real_response_is_dropped() {
        let addr = scripted_backend(vec![format!(
            "{}\n{}\n{}",
            "{garbage",
            r#"{"id":"999","result":"stale"}"#,
            r#"{"id":"1","result":{"ok":true}}"#
        )])
        .await;
        let mut client = client_for(addr).await;

        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn backend_error_surfaces_as_backend_variant() {
        let addr =
            scripted_backend(vec![r#"{"id":"1","error":{"message":"Unknown method"}}"#.to_string()])
                .await;
        let mut client = client_for(addr).await;

        let result = client.send("frobnicate", None).await;
        match result {
            Err(ScryError::Backend(message)) => assert_eq!(message, "Unknown method"),
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_connection_is_a_connection_error() {
        let addr = scripted_backend(vec![]).await;
        let mut client = client_for(addr).await;

        let result = client.ping().await;
        assert!(matches!(result, Err(ScryError::BackendConnection(_))));
    }

    #[tokio::test]
    async fn connect_failure_names_the_address() {
        let mut config = BridgeConfig::default();
        config.control_port = 1; // nothing listens on port 1

        let err = BridgeClient::connect(&config).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("127.0.0.1:1"), "got: {message}");
    }

    #[tokio::test]
    async fn ids_increment_across_requests() {
        let addr = scripted_backend(vec![
            r#"{"id":"1","result":{"ok":true}}"#.to_string(),
            r#"{"id":"2","result":{"ok":true}}"#.to_string(),
        ])
        .await;
        let mut client = client_for(addr).await;

        client.ping().await.unwrap();
        client.ping().await.unwrap();
    }
}
