//! Control channel server.
//!
//! Accepts loopback TCP connections from wrapper processes and serves the
//! newline-delimited JSON protocol defined in [`protocol`](super::protocol).
//! Requests on one connection are answered in the order their frames are
//! decoded; connections are independent of each other.
//!
//! Every decodable request gets a response frame. Tool faults are folded into
//! error-flagged content payloads, malformed frames get a best-effort error
//! response when an id can be salvaged, and nothing a client sends can take
//! the server down.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::bridge::protocol::{
    self, Request, Response, decode_line, salvage_id, write_frame,
};
use crate::error::{Result, ScryError};
use crate::gateway::Connector;
use crate::jobs::JobQueue;
use crate::tools::ToolRegistry;

/// Everything request dispatch needs, wired once at backend startup.
pub struct ControlContext {
    pub registry: ToolRegistry,
    pub queue: Arc<JobQueue>,
    pub connector: Arc<Connector>,
    /// Flipped to `true` when a client asks the backend to shut down.
    pub shutdown: watch::Sender<bool>,
}

/// The control channel listener. Bound once at startup; accepting and
/// connection handling are driven by the backend main loop.
pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    /// Bind the fixed loopback address. Failure here is an unrecoverable
    /// startup error (non-zero exit), not something to retry.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ScryError::Startup(format!("Failed to bind control channel on {addr}: {e}"))
        })?;
        tracing::info!(addr = %listener.local_addr()?, "Control channel listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.listener.accept().await?)
    }
}

/// Serve one wrapper connection until it closes.
pub async fn handle_connection(stream: TcpStream, ctx: Arc<ControlContext>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let request = match decode_line::<Request>(&line) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed control frame");
                // Answer if the frame at least carried an id; drop otherwise.
                if let Some(id) = salvage_id(&line) {
                    let response = Response::err(id, format!("Malformed request: {e}"));
                    write_frame(&mut write_half, &response).await?;
                }
                continue;
            }
        };

        let (response, should_shutdown) = dispatch(request, &ctx).await;
        write_frame(&mut write_half, &response).await?;

        if should_shutdown {
            let _ = ctx.shutdown.send(true);
            break;
        }
    }
    Ok(())
}

/// Dispatch one request. Returns the response and whether the backend should
/// shut down afterwards.
async fn dispatch(request: Request, ctx: &ControlContext) -> (Response, bool) {
    let id = request.id;

    match request.method.as_str() {
        protocol::METHOD_PING => (Response::ok(id, json!({"ok": true})), false),

        protocol::METHOD_LIST_TOOLS => {
            let tools = ctx.registry.list_tools();
            (Response::ok(id, json!({"tools": tools})), false)
        }

        protocol::METHOD_CALL_TOOL => {
            let params = request.params.unwrap_or(Value::Null);
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            if name.is_empty() {
                return (Response::err(id, "call_tool requires params.name"), false);
            }
            let args = params.get("args").cloned().unwrap_or(Value::Null);
            let content = ctx.registry.call_tool(name, args).await;
            (Response::ok(id, content), false)
        }

        protocol::METHOD_STATUS => {
            let metrics = ctx.queue.queue_metrics().await;
            let status = json!({
                "version": env!("CARGO_PKG_VERSION"),
                "pid": std::process::id(),
                "gateway_connected": ctx.connector.is_connected(),
                "jobs": metrics,
            });
            (Response::ok(id, status), false)
        }

        protocol::METHOD_SHUTDOWN => {
            tracing::info!("Shutdown requested over control channel");
            (Response::ok(id, json!({"ok": true})), true)
        }

        other => {
            tracing::debug!(method = other, "Unknown control method");
            (Response::err(id, "Unknown method"), false)
        }
    }
}
