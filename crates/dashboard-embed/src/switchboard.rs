//! Request/response and fire-and-forget calls over a [`MessagePort`].
//!
//! Both ends of an embedding speak the same envelope, tagged by
//! `switchboardAction`. A `get` carries a `messageId` that the other side
//! echoes in exactly one `reply` or `error`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use message_channel::{ChannelError, MessagePort, PortReceiver, PortSender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const LOG_TARGET: &str = "switchboard";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "switchboardAction", rename_all = "lowercase")]
pub enum SwitchboardMessage {
    Emit {
        method: String,
        #[serde(default)]
        args: Value,
    },
    Get {
        method: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        args: Value,
    },
    Reply {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(default)]
        result: Value,
    },
    Error {
        #[serde(rename = "messageId")]
        message_id: String,
        error: String,
    },
}

#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("switchboard closed")]
    Closed,
    #[error("remote method `{method}` failed: {message}")]
    Remote { method: String, message: String },
    #[error("switchboard codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<ChannelError> for SwitchboardError {
    fn from(_: ChannelError) -> Self {
        SwitchboardError::Closed
    }
}

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
type Method = Arc<dyn Fn(Value) -> MethodFuture + Send + Sync>;
type PendingReply = oneshot::Sender<Result<Value, String>>;

/// An emitted call waiting its turn on the emit worker.
struct EmitJob {
    method: String,
    call: MethodFuture,
}

struct Inner {
    name: String,
    debug: bool,
    sender: PortSender,
    closed: AtomicBool,
    pending: Mutex<HashMap<String, PendingReply>>,
    methods: Mutex<HashMap<String, Method>>,
    emits: mpsc::UnboundedSender<EmitJob>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to one end of a switchboard conversation.
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchboard")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Switchboard {
    /// Takes ownership of `port` and starts listening on it. Must be called
    /// from within a tokio runtime.
    pub fn new(port: MessagePort, name: impl Into<String>, debug: bool) -> Self {
        let name = name.into();
        let (sender, receiver) = port.split();
        let (emits, emit_jobs) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            name: name.clone(),
            debug,
            sender,
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            emits,
            tasks: Mutex::new(Vec::new()),
        });
        let listener = tokio::spawn(listen(Arc::downgrade(&inner), receiver));
        let emit_worker = tokio::spawn(run_emits(name, emit_jobs));
        inner.tasks.lock().extend([listener, emit_worker]);
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Registers a handler the other side can reach with `emit` or `get`.
    /// A later registration under the same name replaces the earlier one.
    pub fn define_method<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: Method = Arc::new(move |args: Value| -> MethodFuture { Box::pin(handler(args)) });
        self.inner.methods.lock().insert(method.into(), handler);
    }

    /// Sends a one-way call. No reply is expected.
    pub fn emit(&self, method: &str, args: Value) -> Result<(), SwitchboardError> {
        self.inner.ensure_open()?;
        self.inner.log(format_args!("emit {method}"));
        self.inner.post(&SwitchboardMessage::Emit {
            method: method.to_string(),
            args,
        })
    }

    /// Calls `method` on the other side and waits for its reply. There is no
    /// deadline; a peer that never answers leaves the call pending until the
    /// switchboard is closed.
    pub async fn get(&self, method: &str, args: Value) -> Result<Value, SwitchboardError> {
        let message_id = format!("{}_{}", self.inner.name, Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        {
            // `close` flips the flag under this lock, so nothing is inserted
            // after the table has been failed.
            let mut pending = self.inner.pending.lock();
            self.inner.ensure_open()?;
            pending.insert(message_id.clone(), tx);
        }

        self.inner.log(format_args!("get {method} ({message_id})"));
        let request = SwitchboardMessage::Get {
            method: method.to_string(),
            message_id: message_id.clone(),
            args,
        };
        if let Err(err) = self.inner.post(&request) {
            self.inner.pending.lock().remove(&message_id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(SwitchboardError::Remote {
                method: method.to_string(),
                message,
            }),
            Err(_) => Err(SwitchboardError::Closed),
        }
    }

    /// [`Switchboard::get`] with the reply decoded into `T`.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Value,
    ) -> Result<T, SwitchboardError> {
        let value = self.get(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Stops listening and fails every call still waiting for a reply.
    pub fn close(&self) {
        {
            let mut pending = self.inner.pending.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            pending.clear();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.log("closed");
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), SwitchboardError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SwitchboardError::Closed)
        } else {
            Ok(())
        }
    }

    fn log(&self, message: impl std::fmt::Display) {
        if self.debug {
            debug!(target: LOG_TARGET, name = %self.name, "{message}");
        }
    }

    fn post(&self, message: &SwitchboardMessage) -> Result<(), SwitchboardError> {
        let value = serde_json::to_value(message)?;
        self.sender.post_message(value)?;
        Ok(())
    }

    fn method(&self, name: &str) -> Option<Method> {
        self.methods.lock().get(name).cloned()
    }

    fn resolve(&self, message_id: &str, outcome: Result<Value, String>) {
        match self.pending.lock().remove(message_id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => warn!(
                target: LOG_TARGET,
                name = %self.name,
                message_id,
                "reply for unknown request"
            ),
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with `Closed`.
        self.pending.lock().clear();
    }

    fn dispatch(&self, raw: Value) {
        let message = match serde_json::from_value::<SwitchboardMessage>(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    name = %self.name,
                    error = %err,
                    "dropping malformed switchboard message"
                );
                return;
            }
        };

        match message {
            SwitchboardMessage::Emit { method, args } => match self.method(&method) {
                Some(handler) => {
                    let call = handler(args);
                    if self.emits.send(EmitJob { method, call }).is_err() {
                        self.log("emit worker stopped");
                    }
                }
                None => self.log(format_args!("no handler for emitted {method}")),
            },
            SwitchboardMessage::Get {
                method,
                message_id,
                args,
            } => {
                let handler = self.method(&method);
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let reply = match handler {
                        Some(handler) => match handler(args).await {
                            Ok(result) => SwitchboardMessage::Reply { message_id, result },
                            Err(error) => SwitchboardMessage::Error { message_id, error },
                        },
                        None => SwitchboardMessage::Error {
                            message_id,
                            error: format!("unknown method `{method}`"),
                        },
                    };
                    let sent = serde_json::to_value(&reply)
                        .map_err(SwitchboardError::from)
                        .and_then(|value| sender.post_message(value).map_err(Into::into));
                    if let Err(err) = sent {
                        warn!(target: LOG_TARGET, method = %method, error = %err, "failed to send reply");
                    }
                });
            }
            SwitchboardMessage::Reply { message_id, result } => {
                self.resolve(&message_id, Ok(result));
            }
            SwitchboardMessage::Error { message_id, error } => {
                self.resolve(&message_id, Err(error));
            }
        }
    }
}

/// Runs emit handlers one at a time in arrival order, off the listener task
/// so a handler may itself wait on a `get`.
async fn run_emits(name: String, mut jobs: mpsc::UnboundedReceiver<EmitJob>) {
    while let Some(EmitJob { method, call }) = jobs.recv().await {
        if let Err(err) = call.await {
            warn!(
                target: LOG_TARGET,
                name = %name,
                method = %method,
                error = %err,
                "emit handler failed"
            );
        }
    }
}

async fn listen(inner: Weak<Inner>, mut receiver: PortReceiver) {
    while let Some(raw) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(raw);
    }
    if let Some(inner) = inner.upgrade() {
        inner.log("peer port closed");
        inner.fail_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_channel::MessageChannel;
    use serde_json::json;
    use std::time::Duration;

    fn pair() -> (Switchboard, Switchboard) {
        let (ours, theirs) = MessageChannel::new().into_ports();
        (
            Switchboard::new(ours, "host", false),
            Switchboard::new(theirs, "guest", false),
        )
    }

    #[test]
    fn wire_format_uses_switchboard_action_tags() {
        let get = SwitchboardMessage::Get {
            method: "getScrollSize".into(),
            message_id: "host_1".into(),
            args: Value::Null,
        };
        assert_eq!(
            serde_json::to_value(&get).unwrap(),
            json!({
                "switchboardAction": "get",
                "method": "getScrollSize",
                "messageId": "host_1",
                "args": null
            })
        );

        let reply: SwitchboardMessage = serde_json::from_value(json!({
            "switchboardAction": "reply",
            "messageId": "host_1",
            "result": {"width": 10}
        }))
        .unwrap();
        assert_eq!(
            reply,
            SwitchboardMessage::Reply {
                message_id: "host_1".into(),
                result: json!({"width": 10})
            }
        );
    }

    #[tokio::test]
    async fn get_resolves_with_remote_reply() {
        let (host, guest) = pair();
        guest.define_method("getScrollSize", |_| async {
            Ok(json!({"width": 800, "height": 600}))
        });

        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            host.get("getScrollSize", Value::Null),
        )
        .await
        .expect("reply timeout")
        .expect("reply");
        assert_eq!(reply, json!({"width": 800, "height": 600}));
    }

    #[tokio::test]
    async fn unknown_method_is_a_remote_error() {
        let (host, _guest) = pair();
        let err = tokio::time::timeout(Duration::from_secs(2), host.get("nope", Value::Null))
            .await
            .expect("reply timeout")
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::Remote { ref method, .. } if method == "nope"));
    }

    #[tokio::test]
    async fn emits_are_handled_in_order() {
        let (host, guest) = pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        guest.define_method("guestToken", move |args| {
            let tx = tx.clone();
            async move {
                let token = args["guestToken"].as_str().unwrap_or_default().to_string();
                if token == "tok1" {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                let _ = tx.send(token);
                Ok(Value::Null)
            }
        });

        host.emit("guestToken", json!({"guestToken": "tok1"})).unwrap();
        host.emit("guestToken", json!({"guestToken": "tok2"})).unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("tok1"));
        assert_eq!(rx.recv().await.as_deref(), Some("tok2"));
    }

    #[tokio::test]
    async fn emit_handler_can_call_back_over_the_same_switchboard() {
        let (host, guest) = pair();
        host.define_method("getScrollSize", |_| async {
            Ok(json!({"width": 800, "height": 600}))
        });
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let callback = guest.clone();
        guest.define_method("guestToken", move |_| {
            let callback = callback.clone();
            let tx = tx.clone();
            async move {
                let outcome = callback
                    .get("getScrollSize", Value::Null)
                    .await
                    .map_err(|err| err.to_string());
                let _ = tx.send(outcome);
                Ok(Value::Null)
            }
        });

        host.emit("guestToken", json!({"guestToken": "tok1"})).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("emit handler stalled")
            .expect("outcome");
        assert_eq!(outcome, Ok(json!({"width": 800, "height": 600})));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_racing_close_never_hangs() {
        for _ in 0..50 {
            let (ours, _theirs) = MessageChannel::new().into_ports();
            let host = Switchboard::new(ours, "host", false);
            let waiting = {
                let host = host.clone();
                tokio::spawn(async move { host.get("getActiveTabs", Value::Null).await })
            };
            let closing = {
                let host = host.clone();
                tokio::spawn(async move { host.close() })
            };
            closing.await.expect("join");

            let result = tokio::time::timeout(Duration::from_secs(2), waiting)
                .await
                .expect("get left pending after close")
                .expect("join");
            assert!(matches!(result, Err(SwitchboardError::Closed)));
        }
    }

    #[tokio::test]
    async fn close_fails_pending_and_later_calls() {
        let (ours, _theirs) = MessageChannel::new().into_ports();
        let host = Switchboard::new(ours, "host", false);

        let waiting = {
            let host = host.clone();
            tokio::spawn(async move { host.get("getActiveTabs", Value::Null).await })
        };
        tokio::task::yield_now().await;
        host.close();

        let result = waiting.await.expect("join");
        assert!(matches!(result, Err(SwitchboardError::Closed)));
        assert!(matches!(
            host.emit("guestToken", Value::Null),
            Err(SwitchboardError::Closed)
        ));
    }

    #[tokio::test]
    async fn dropped_peer_fails_pending_calls() {
        let (ours, theirs) = MessageChannel::new().into_ports();
        let host = Switchboard::new(ours, "host", false);
        let waiting = {
            let host = host.clone();
            tokio::spawn(async move { host.get("getScrollSize", Value::Null).await })
        };
        tokio::task::yield_now().await;
        drop(theirs);

        let result = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("timeout")
            .expect("join");
        assert!(matches!(result, Err(SwitchboardError::Closed)));
    }
}
