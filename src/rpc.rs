use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::frame::Frame;
use crate::metrics;
use crate::transport::Transport;

pub type HandlerResult = Result<Option<Value>, RpcError>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Handler for one inbound method. `Ok(None)` replies with `null` data.
pub type MethodHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Boxes an async closure into a [`MethodHandler`].
pub fn handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

type PendingMap = DashMap<String, oneshot::Sender<Result<Value, RpcError>>>;

/// Removes the pending entry when the caller stops waiting, whatever the reason.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Symmetric request/response/notify multiplexer over a single transport.
///
/// Both sides may call and serve methods. Outbound calls are correlated by a
/// UUID `id`; inbound requests run in their own task so a slow handler never
/// holds up the frames behind it.
pub struct RpcPeer {
    transport: Arc<dyn Transport>,
    handlers: DashMap<String, MethodHandler>,
    pending: PendingMap,
    sealed: AtomicBool,
}

impl RpcPeer {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handlers: DashMap::new(),
            pending: DashMap::new(),
            sealed: AtomicBool::new(false),
        })
    }

    /// Installs the handler for `method`, replacing any earlier one.
    /// Fails once the first inbound message has been handled.
    pub fn register_handler(&self, method: &str, handler: MethodHandler) -> Result<(), RpcError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(RpcError::HandlersSealed(method.to_string()));
        }
        self.handlers.insert(method.to_string(), handler);
        Ok(())
    }

    /// Fire-and-forget request. Resolves once the frame is handed to the transport.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let text = Frame::request(None, method, params).encode()?;
        trace!(method, "Sending notification");
        self.transport.send_text(text).await?;
        Ok(())
    }

    /// Sends a request and waits up to `timeout` for the matching response.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };
        metrics::ROOM_RPC_CALLS_TOTAL.with_label_values(&[method]).inc();

        let text = Frame::request(Some(id.clone()), method, params).encode()?;
        debug!(method, request_id = %id, "Sending request");

        // The deadline covers the send too: a stalled writer must not hold the caller.
        match tokio::time::timeout(timeout, self.send_and_wait(text, rx)).await {
            Ok(result) => result,
            Err(_) => {
                metrics::ROOM_RPC_TIMEOUTS_TOTAL.with_label_values(&[method]).inc();
                warn!(method, request_id = %id, ?timeout, "Request timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn send_and_wait(
        &self,
        text: String,
        rx: oneshot::Receiver<Result<Value, RpcError>>,
    ) -> Result<Value, RpcError> {
        self.transport.send_text(text).await?;
        rx.await.unwrap_or(Err(RpcError::TransportClosed))
    }

    /// Routes one inbound frame. Never fails: bad frames are logged and dropped.
    pub fn handle_message(self: &Arc<Self>, raw: &str) {
        self.sealed.store(true, Ordering::Release);

        match Frame::parse(raw) {
            Ok(Frame::Request { id, method, params }) => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.dispatch(id, method, params).await });
            }
            Ok(Frame::Response {
                request_id,
                data,
                error,
            }) => self.resolve(request_id, data, error),
            Err(e) => warn!(error = %e, "Dropping unusable frame"),
        }
    }

    async fn dispatch(&self, id: Option<String>, method: String, params: Value) {
        let handler = self.handlers.get(&method).map(|h| h.value().clone());
        let outcome = match handler {
            None => Err(RpcError::NoHandler(method.clone())),
            // A nested task turns a handler panic into a JoinError.
            Some(h) => match tokio::spawn(h(params)).await {
                Ok(result) => result,
                Err(e) => Err(RpcError::Handler(format!("handler panicked: {}", e))),
            },
        };

        if let Err(e) = &outcome {
            error!(method = %method, request_id = ?id, error = %e, "Request handler failed");
        }

        let Some(request_id) = id else {
            return;
        };
        let reply = match outcome {
            Ok(data) => Frame::response(request_id, data.unwrap_or(Value::Null)),
            Err(e) => Frame::error_response(request_id, e.to_string()),
        };

        let sent = match reply.encode() {
            Ok(text) => self.transport.send_text(text).await.map_err(RpcError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(method = %method, error = %e, "Failed to send response");
        }
    }

    fn resolve(&self, request_id: String, data: Value, error: Option<String>) {
        let Some((_, tx)) = self.pending.remove(&request_id) else {
            metrics::ROOM_RPC_UNMATCHED_RESPONSES_TOTAL.inc();
            warn!(request_id = %request_id, "Dropping response with no pending call");
            return;
        };

        let result = match error {
            Some(message) => Err(RpcError::Remote(message)),
            None => Ok(data),
        };
        if tx.send(result).is_err() {
            debug!(request_id = %request_id, "Caller stopped waiting before the response arrived");
        }
    }

    /// Wakes every pending caller with [`RpcError::TransportClosed`].
    pub fn fail_pending(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RpcError::TransportClosed));
            }
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub async fn close(&self) {
        self.fail_pending();
        self.transport.close().await;
    }
}
