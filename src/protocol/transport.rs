//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with a provider child process:
//! - Writing JSON-RPC requests and notifications to stdin
//! - Routing JSON-RPC responses read from stdout back to their callers
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! A background reader task owns stdout. Each request registers a oneshot
//! sender under its id, so concurrent requests (a health probe racing a
//! listing call) never steal each other's responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::ProtocolError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// State shared between the transport and its reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<PendingMap>,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    provider_id: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Create a transport from the provider's stdin/stdout.
    ///
    /// Must be called within a Tokio runtime: the stdout reader runs as a task.
    pub fn new<W, R>(provider_id: &str, stdin: W, stdout: R, request_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::default());
        let reader_task = tokio::spawn(read_responses(
            provider_id.to_string(),
            BufReader::new(stdout),
            Arc::clone(&shared),
        ));

        Self {
            provider_id: provider_id.to_string(),
            writer: tokio::sync::Mutex::new(Some(Box::new(stdin))),
            shared,
            reader_task,
            request_timeout,
        }
    }

    /// Whether the provider's stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, ProtocolError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        // The reader drains pending entries after flagging `closed`, so an
        // entry inserted after the drain is caught here.
        if self.is_closed() {
            self.shared.pending().remove(&id);
            return Err(self.closed_error());
        }

        let line = serde_json::to_string(&req).map_err(|e| ProtocolError::TransportError {
            provider: self.provider_id.clone(),
            reason: format!("failed to serialize request: {e}"),
        });
        let written = match line {
            Ok(line) => self.write_line(line).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.shared.pending().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(ProtocolError::Timeout {
                    provider: self.provider_id.clone(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.request_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Send a request and unwrap its `result`, converting errors to `ProtocolError`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ProtocolError> {
        let response = self.request(method, params).await?;
        extract_result(response)
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ProtocolError> {
        let notification = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notification).map_err(|e| {
            ProtocolError::TransportError {
                provider: self.provider_id.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.write_line(line).await
    }

    /// Close the provider's stdin. Servers treat EOF on stdin as a shutdown request.
    pub async fn close_stdin(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(provider = %self.provider_id, error = %e, "stdin shutdown failed");
            }
        }
    }

    async fn write_line(&self, mut line: String) -> Result<(), ProtocolError> {
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| ProtocolError::TransportError {
            provider: self.provider_id.clone(),
            reason: "stdin already closed".into(),
        })?;

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProtocolError::TransportError {
                provider: self.provider_id.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::TransportError {
                provider: self.provider_id.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    fn closed_error(&self) -> ProtocolError {
        ProtocolError::TransportError {
            provider: self.provider_id.clone(),
            reason: "provider stdout closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Reader loop: route each response line to the request waiting on its id.
async fn read_responses<R>(provider_id: String, mut reader: BufReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin,
{
    // Raw bytes: a log line that is not valid UTF-8 must not end the channel.
    let mut line_buf: Vec<u8> = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(provider = %provider_id, error = %e, "stdout read failed");
                break;
            }
        }

        let trimmed = line_buf.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        // Non-JSON lines are provider log output.
        let Ok(message) = serde_json::from_slice::<JsonRpcResponse>(trimmed) else {
            tracing::trace!(
                provider = %provider_id,
                line = %String::from_utf8_lossy(trimmed),
                "skipping non-protocol output"
            );
            continue;
        };

        let Some(id) = message.response_id() else {
            tracing::trace!(
                provider = %provider_id,
                method = message.method.as_deref().unwrap_or_default(),
                "ignoring provider-initiated message"
            );
            continue;
        };

        let waiter = shared.pending().remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have timed out and dropped its receiver.
                if tx.send(message).is_err() {
                    tracing::debug!(provider = %provider_id, id, "response arrived after caller gave up");
                }
            }
            None => {
                tracing::debug!(provider = %provider_id, id, "response for unknown request id");
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    let abandoned = std::mem::take(&mut *shared.pending());
    if !abandoned.is_empty() {
        tracing::debug!(
            provider = %provider_id,
            count = abandoned.len(),
            "failing pending requests after stdout closed"
        );
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `ProtocolError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, ProtocolError> {
    if let Some(err) = response.error {
        return Err(ProtocolError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(ProtocolError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Spawn a fake provider that answers every request with `{"echo": method}`,
    /// printing a log line first to prove non-JSON output is skipped.
    fn echo_provider(server_in: DuplexStream, mut server_out: DuplexStream) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = req.get("id").cloned() else {
                    continue;
                };
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"echo": req["method"]},
                });
                server_out.write_all(b"starting up...\n").await.unwrap();
                server_out
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });
    }

    fn transport_pair(timeout: Duration) -> (StdioTransport, DuplexStream, DuplexStream) {
        let (client_in, server_in) = duplex(4096);
        let (server_out, client_out) = duplex(4096);
        let transport = StdioTransport::new("test", client_in, client_out, timeout);
        (transport, server_in, server_out)
    }

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn test_request_round_trip_skips_log_lines() {
        let (transport, server_in, server_out) = transport_pair(Duration::from_secs(5));
        echo_provider(server_in, server_out);

        let result = transport.call("ping", None).await.unwrap();
        assert_eq!(result["echo"], "ping");
    }

    #[tokio::test]
    async fn test_non_utf8_log_line_is_skipped() {
        let (transport, server_in, mut server_out) = transport_pair(Duration::from_secs(5));
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let reply = serde_json::json!({"jsonrpc": "2.0", "id": req["id"], "result": {}});
                server_out.write_all(b"log \xff\xfe latin1 caf\xe9\n").await.unwrap();
                server_out
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        transport.call("ping", None).await.unwrap();
        assert!(!transport.is_closed());
        // The channel keeps working afterwards.
        transport.call("ping", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_responses() {
        let (transport, server_in, server_out) = transport_pair(Duration::from_secs(5));
        echo_provider(server_in, server_out);

        let (a, b, c) = tokio::join!(
            transport.call("tools/list", None),
            transport.call("ping", None),
            transport.call("prompts/list", None),
        );
        assert_eq!(a.unwrap()["echo"], "tools/list");
        assert_eq!(b.unwrap()["echo"], "ping");
        assert_eq!(c.unwrap()["echo"], "prompts/list");
    }

    #[tokio::test]
    async fn test_request_times_out_when_provider_is_silent() {
        let (transport, _server_in, _server_out) = transport_pair(Duration::from_millis(50));
        let err = transport.call("ping", None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_closed_stdout_fails_requests() {
        let (transport, _server_in, server_out) = transport_pair(Duration::from_secs(5));
        drop(server_out);

        let err = transport.call("ping", None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TransportError { .. }));
    }

    #[tokio::test]
    async fn test_write_after_close_stdin_fails() {
        let (transport, _server_in, _server_out) = transport_pair(Duration::from_secs(5));
        transport.close_stdin().await;
        let err = transport.notify("notifications/initialized", None).await.unwrap_err();
        assert!(err.to_string().contains("stdin already closed"));
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            id: Some(1),
            method: None,
            result: Some(serde_json::json!({"text": "hello"})),
            error: None,
        };
        let result = extract_result(resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: Some(1),
            method: None,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let err = extract_result(resp).unwrap_err();
        match err {
            ProtocolError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            _ => panic!("expected ServerError"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            id: Some(1),
            method: None,
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, ProtocolError::ServerError { .. }));
    }
}
