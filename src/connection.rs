//! Connection facade: one transport shared by many concurrent callers.
//!
//! A [`Connection`] owns two background tasks for its whole life:
//!
//! - the reader loop, which resolves responses and routes notifications
//! - the keepalive loop, which calls a no-op method on an interval
//!
//! Both start in [`Connection::connect`] and stop in [`Connection::close`]
//! (or when the server hangs up).
//!
//! # Example
//!
//! ```ignore
//! use muxrpc::{Connection, ConnectionConfig};
//! use serde_json::json;
//!
//! let conn = Connection::connect(ConnectionConfig::new("127.0.0.1", 4000)).await?;
//! conn.set_notification_handler(|n| println!("{}: {:?}", n.method, n.params));
//!
//! let balance = conn.call("getBalance", Some(json!({"currency": "btc"}))).await?;
//! conn.call_async("getStats", None, |outcome| println!("{:?}", outcome)).await?;
//!
//! conn.close().await;
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ClientError, Result};
use crate::framing::{write_message, Framing};
use crate::keepalive;
use crate::message::{self, Notification};
use crate::reader::{self, NotificationHandler, NotificationSlot};
use crate::registry::{CallRegistry, Consumer, Outcome};
use crate::transport::{self, TransportReader, TransportWriter};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting calls.
    Open,
    /// `close()` was requested; the reader is tearing down.
    Closing,
    /// The reader has exited and every pending call has been failed.
    Closed,
}

/// State shared between the facade and its background tasks.
pub(crate) struct Shared {
    pub(crate) registry: CallRegistry,
    /// Outbound writes are serialized so whole messages never interleave.
    writer: tokio::sync::Mutex<TransportWriter>,
    pub(crate) framing: Framing,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) notification_handler: Arc<NotificationSlot>,
}

impl Shared {
    pub(crate) fn is_open(&self) -> bool {
        *self.state.borrow() == ConnectionState::Open
    }

    /// Register `consumer` under a fresh id and write the request.
    ///
    /// The consumer is registered before any byte is written, so a response
    /// cannot overtake its own registration.
    pub(crate) async fn send_call(
        self: &Arc<Self>,
        method: &str,
        params: Option<&Value>,
        consumer: Consumer,
    ) -> Result<u64> {
        let id = self.begin_call(consumer)?;
        self.transmit_call(id, method, params).await?;
        Ok(id)
    }

    fn begin_call(&self, consumer: Consumer) -> Result<u64> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        self.registry.register_next(consumer)
    }

    /// Write the request for an already registered call. On failure the
    /// registration is withdrawn.
    async fn transmit_call(self: &Arc<Self>, id: u64, method: &str, params: Option<&Value>) -> Result<()> {
        let written = match message::encode_request(id, method, params) {
            Ok(body) => self.write(body).await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            self.registry.cancel(id);
            return Err(e);
        }

        debug!(id, method, "sent call");
        Ok(())
    }

    /// Write one framed message.
    ///
    /// The write runs on its own task, so a caller dropped mid-write never
    /// leaves a partial frame on the wire.
    pub(crate) async fn write(self: &Arc<Self>, body: String) -> Result<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.write_frame(&body).await })
            .await
            .map_err(|e| ClientError::Protocol(format!("Writer task failed: {}", e)))?
    }

    async fn write_frame(&self, body: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, self.framing, body)
            .await
            .map_err(|e| match e.downcast::<std::io::Error>() {
                Ok(io) => ClientError::Io(io),
                Err(other) => ClientError::Protocol(format!("{:#}", other)),
            })
    }
}

/// Withdraws a call's registration when the awaiting future goes away.
///
/// Once the response has been delivered the id is no longer registered and
/// the cancel is a no-op; ids are never reused.
struct CancelOnDrop<'a> {
    registry: &'a CallRegistry,
    id: u64,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.registry.cancel(self.id).is_some() {
            debug!(id = self.id, "call abandoned before its response");
        }
    }
}

/// A multiplexed RPC connection.
///
/// All methods take `&self`; wrap the connection in an `Arc` to share it
/// between tasks.
pub struct Connection {
    shared: Arc<Shared>,
    call_timeout: Option<Duration>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Open the transport described by `config` and start the background loops.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionFailed` if the transport cannot be
    /// established.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let (reader, writer) = transport::open(&config).await?;
        Ok(Self::with_transport(reader, writer, &config))
    }

    /// Run the connection over an already established bidirectional stream.
    ///
    /// `config` supplies framing, keepalive and timeout settings; host and
    /// port are ignored. Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, config: &ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let (reader, writer) = transport::into_halves(read, write);
        Self::with_transport(reader, writer, config)
    }

    /// Run the connection over separate read and write halves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(
        reader: TransportReader,
        writer: TransportWriter,
        config: &ConnectionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        let shared = Arc::new(Shared {
            registry: CallRegistry::new(),
            writer: tokio::sync::Mutex::new(writer),
            framing: config.framing,
            state,
            notification_handler: Arc::new(NotificationSlot::default()),
        });

        let reader_task = tokio::spawn(reader::run(reader, Arc::clone(&shared)));

        let keepalive_task = config.keepalive_interval.map(|interval| {
            tokio::spawn(keepalive::run(
                Arc::clone(&shared),
                interval,
                config.keepalive_method.clone(),
            ))
        });

        Self {
            shared,
            call_timeout: config.call_timeout,
            reader_task: Mutex::new(Some(reader_task)),
            keepalive_task: Mutex::new(keepalive_task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_open()
    }

    /// Call `method` and wait for its response.
    ///
    /// Suspends the calling task until the response bearing this call's id
    /// arrives, regardless of how other calls' responses are ordered.
    ///
    /// # Errors
    ///
    /// - `ClientError::NotConnected` if the connection is not open (nothing is sent)
    /// - `ClientError::Remote` if the server answered with an error object
    /// - `ClientError::ConnectionClosed` if the connection dropped first
    /// - `ClientError::Timeout` if a call timeout is configured and expires
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (consumer, rx) = Consumer::slot();
        let id = self.shared.begin_call(consumer)?;
        let _registration = CancelOnDrop {
            registry: &self.shared.registry,
            id,
        };
        self.shared
            .transmit_call(id, method, params.as_ref())
            .await?;

        let received = match self.call_timeout {
            Some(limit) => match timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // The registration is withdrawn on return; a late
                    // response becomes an unknown-id anomaly
                    warn!(id, method, "Call timed out after {:?}", limit);
                    return Err(ClientError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        // Sender dropped without a value: the call was removed unanswered
        received.unwrap_or(Err(ClientError::ConnectionClosed))
    }

    /// Call with serializable params and deserialize the result.
    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a call whose outcome is handed to `callback`.
    ///
    /// Returns the call id once the request has been written. The callback
    /// runs exactly once, on a blocking-pool thread, with the result or the
    /// error (including `ConnectionClosed` if the connection drops first).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotConnected` if the connection is not open, or
    /// the write error if the request could not be sent. In both cases the
    /// callback is not invoked.
    pub async fn call_async<F>(&self, method: &str, params: Option<Value>, callback: F) -> Result<u64>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.shared
            .send_call(method, params.as_ref(), Consumer::callback(callback))
            .await
    }

    /// Invoke an arbitrary remote method by name.
    ///
    /// Arguments map onto params positionally: none → no params, one → that
    /// value, several → a JSON array.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call(method, args_to_params(args)).await
    }

    /// Send a notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.shared.is_open() {
            return Err(ClientError::NotConnected);
        }
        let body = message::encode_notification(method, params.as_ref())?;
        self.shared.write(body).await
    }

    /// Install the handler for server notifications, replacing any previous one.
    ///
    /// The handler runs on a dedicated thread, in arrival order, and never
    /// blocks the reader. Notifications arriving with no handler installed
    /// are discarded.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        self.shared.notification_handler.set(Some(handler));
    }

    pub fn clear_notification_handler(&self) {
        self.shared.notification_handler.set(None);
    }

    /// Ids of calls still awaiting a response, sorted.
    pub fn pending_ids(&self) -> Vec<u64> {
        self.shared.registry.pending_ids()
    }

    /// Close the transport and stop both background loops.
    ///
    /// Pending calls are failed with `ConnectionClosed` by the reader as it
    /// exits. Calling `close` more than once is harmless.
    pub async fn close(&self) {
        let was_open = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if was_open {
            info!("Closing connection");
        }

        if let Some(task) = take_task(&self.keepalive_task) {
            task.abort();
            let _ = task.await;
        }

        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!("Transport shutdown failed: {}", e);
            }
        }

        if let Some(task) = take_task(&self.reader_task) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Reader task panicked: {}", e);
                }
            }
        }
    }

    /// Wait until the connection has fully closed, for whatever reason.
    pub async fn closed(&self) {
        let mut state_rx = self.shared.state.subscribe();
        let _ = state_rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The reader notices the state change, drains and exits on its own
        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if let Some(task) = take_task(&self.keepalive_task) {
            task.abort();
        }
    }
}

fn take_task(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn args_to_params(mut args: Vec<Value>) -> Option<Value> {
    match args.len() {
        0 => None,
        1 => args.pop(),
        _ => Some(Value::Array(args)),
    }
}
