//! Client-side attribute proxies.
//!
//! A [`RemoteAttribute`] offers the same get/set/subscribe contract as a
//! local attribute, with the failure modes of a network boundary made
//! explicit: every call is bounded by a timeout, reads may fall back to a
//! cached value marked stale, and writes are never retried implicitly.
//!
//! One background task owns the TCP connection. When it drops, the task
//! reconnects with capped exponential backoff, re-subscribes everything
//! that was subscribed, and re-emits the then-current value of each
//! subscription once, so observers recover without replaying history.

use crate::error::{ScopeError, ScopeResult};
use crate::remote::protocol::{
    read_frame, write_frame, ComponentSummary, Frame, Operation, Request, Response,
    ResponseStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub addr: SocketAddr,
    /// Bound on every individual request.
    pub request_timeout: Duration,
    /// Transparent retries for idempotent operations (get, subscribe).
    pub max_retries: u32,
    /// Pause between those retries.
    pub retry_delay: Duration,
    /// Initial reconnect backoff; doubles up to `max_backoff`.
    pub reconnect_backoff: Duration,
    pub max_backoff: Duration,
}

impl RemoteClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            request_timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
            reconnect_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

// =============================================================================
// Client core
// =============================================================================

struct Command {
    op: Operation,
    component: String,
    attribute: String,
    payload: Vec<u8>,
    reply: oneshot::Sender<ScopeResult<Response>>,
}

type RawSubscriber = mpsc::UnboundedSender<serde_json::Value>;

#[derive(Debug)]
struct ClientInner {
    config: RemoteClientConfig,
    commands: mpsc::Sender<Command>,
    connected: AtomicBool,
    subscriptions: Mutex<HashMap<(String, String), Vec<RawSubscriber>>>,
}

impl ClientInner {
    fn deliver(&self, component: &str, attribute: &str, value: serde_json::Value) {
        let key = (component.to_string(), attribute.to_string());
        let mut subs = lock(&self.subscriptions);
        if let Some(senders) = subs.get_mut(&key) {
            senders.retain(|tx| tx.send(value.clone()).is_ok());
            if senders.is_empty() {
                subs.remove(&key);
            }
        }
    }

    fn subscription_keys(&self) -> Vec<(String, String)> {
        lock(&self.subscriptions).keys().cloned().collect()
    }
}

/// Connection to one attribute server. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    inner: Arc<ClientInner>,
}

impl RemoteClient {
    /// Establish the initial connection and start the background IO task.
    pub async fn connect(config: RemoteClientConfig) -> ScopeResult<Self> {
        let stream = timeout(config.request_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| ScopeError::Timeout(format!("connecting to {}", config.addr)))?
            .map_err(|e| ScopeError::Unreachable(format!("{}: {e}", config.addr)))?;
        info!(addr = %config.addr, "connected to attribute server");

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let inner = Arc::new(ClientInner {
            config,
            commands: commands_tx,
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(HashMap::new()),
        });

        tokio::spawn(io_task(inner.clone(), commands_rx, stream));
        Ok(Self { inner })
    }

    /// Whether the background task currently holds a live connection.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    pub async fn ping(&self) -> ScopeResult<()> {
        self.request_retried(Operation::Ping, "", "", Vec::new())
            .await
            .map(|_| ())
    }

    /// Introspect the remote tree.
    pub async fn list_components(&self) -> ScopeResult<Vec<ComponentSummary>> {
        let payload = self
            .request_retried(Operation::ListComponents, "", "", Vec::new())
            .await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// A proxy for one remote component.
    pub fn component(&self, name: impl Into<String>) -> RemoteComponent {
        RemoteComponent {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// One bounded request, no retries.
    async fn request(
        &self,
        op: Operation,
        component: &str,
        attribute: &str,
        payload: Vec<u8>,
    ) -> ScopeResult<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command {
            op,
            component: component.to_string(),
            attribute: attribute.to_string(),
            payload,
            reply: reply_tx,
        };
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| ScopeError::Unreachable("client task stopped".into()))?;

        let response = match timeout(self.inner.config.request_timeout, reply_rx).await {
            Err(_) => {
                return Err(ScopeError::Timeout(format!(
                    "{op:?} {component}/{attribute}"
                )))
            }
            Ok(Err(_)) => return Err(ScopeError::Unreachable("client task stopped".into())),
            Ok(Ok(result)) => result?,
        };
        check_response(response)
    }

    /// Bounded request with transparent retries; only for idempotent
    /// operations.
    async fn request_retried(
        &self,
        op: Operation,
        component: &str,
        attribute: &str,
        payload: Vec<u8>,
    ) -> ScopeResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self
                .request(op, component, attribute, payload.clone())
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.inner.config.max_retries && retryable(&e) => {
                    attempt += 1;
                    debug!(
                        ?op,
                        component,
                        attribute,
                        attempt,
                        error = %e,
                        "retrying request"
                    );
                    tokio::time::sleep(self.inner.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn retryable(error: &ScopeError) -> bool {
    error.is_transient() || matches!(error, ScopeError::Unreachable(_))
}

fn check_response(response: Response) -> ScopeResult<Vec<u8>> {
    if response.status == ResponseStatus::Success {
        return Ok(response.payload);
    }
    let message: String = serde_json::from_slice(&response.payload)
        .unwrap_or_else(|_| String::from_utf8_lossy(&response.payload).into_owned());
    Err(match response.status {
        ResponseStatus::NotFound => ScopeError::NotFound(message),
        ResponseStatus::ValidationFailed => ScopeError::Validation(message),
        ResponseStatus::ReadOnly => ScopeError::ReadOnly(message),
        ResponseStatus::InvalidRequest => ScopeError::InvalidRequest(message),
        ResponseStatus::Timeout => ScopeError::Timeout(message),
        _ => ScopeError::Protocol(format!("remote error: {message}")),
    })
}

// =============================================================================
// Component / attribute proxies
// =============================================================================

/// Proxy for one remote component; hands out attribute proxies.
pub struct RemoteComponent {
    client: RemoteClient,
    name: String,
}

impl RemoteComponent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute<T>(&self, name: impl Into<String>) -> RemoteAttribute<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        RemoteAttribute {
            client: self.client.clone(),
            component: self.name.clone(),
            name: name.into(),
            cache: Mutex::new(None),
            _marker: PhantomData,
        }
    }
}

/// A read that may have been answered from the local cache because the
/// server is unreachable.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleValue<T> {
    pub value: T,
    pub stale: bool,
    /// How old the value is; zero for a fresh read.
    pub age: Duration,
}

/// Typed proxy for one remote attribute.
pub struct RemoteAttribute<T> {
    client: RemoteClient,
    component: String,
    name: String,
    cache: Mutex<Option<(T, Instant)>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemoteAttribute<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Read the current value. Transient failures are retried; if the
    /// server stays unreachable and a previous read succeeded, that value
    /// is returned with `stale = true` instead of an error.
    pub async fn get(&self) -> ScopeResult<StaleValue<T>> {
        match self
            .client
            .request_retried(Operation::Get, &self.component, &self.name, Vec::new())
            .await
        {
            Ok(payload) => {
                let value: T = serde_json::from_slice(&payload)?;
                *lock(&self.cache) = Some((value.clone(), Instant::now()));
                Ok(StaleValue {
                    value,
                    stale: false,
                    age: Duration::ZERO,
                })
            }
            Err(e) if retryable(&e) => {
                let cached = lock(&self.cache).clone();
                match cached {
                    Some((value, at)) => {
                        warn!(
                            component = %self.component,
                            attribute = %self.name,
                            error = %e,
                            "serving stale value, server unreachable"
                        );
                        Ok(StaleValue {
                            value,
                            stale: true,
                            age: at.elapsed(),
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write a value. Exactly one attempt: a write lost to the network is
    /// never silently repeated.
    pub async fn set(&self, value: T) -> ScopeResult<()> {
        let payload = serde_json::to_vec(&value)?;
        self.client
            .request(Operation::Set, &self.component, &self.name, payload)
            .await
            .map(|_| ())
    }

    /// Write with explicit opt-in retries, for callers that know the
    /// write is idempotent.
    pub async fn set_with_retry(&self, value: T) -> ScopeResult<()> {
        let payload = serde_json::to_vec(&value)?;
        self.client
            .request_retried(Operation::Set, &self.component, &self.name, payload)
            .await
            .map(|_| ())
    }

    /// Subscribe to value changes. The current value is delivered first;
    /// after a reconnect the then-current value is re-delivered once.
    pub async fn subscribe(&self) -> ScopeResult<mpsc::UnboundedReceiver<T>> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let (typed_tx, typed_rx) = mpsc::unbounded_channel::<T>();

        let component = self.component.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            while let Some(value) = raw_rx.recv().await {
                match serde_json::from_value::<T>(value) {
                    Ok(typed) => {
                        if typed_tx.send(typed).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(component = %component, attribute = %name, error = %e,
                            "dropping undecodable update");
                    }
                }
            }
        });

        let key = (self.component.clone(), self.name.clone());
        lock(&self.client.inner.subscriptions)
            .entry(key.clone())
            .or_default()
            .push(raw_tx.clone());

        let payload = match self
            .client
            .request_retried(Operation::Subscribe, &self.component, &self.name, Vec::new())
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                let mut subs = lock(&self.client.inner.subscriptions);
                if let Some(senders) = subs.get_mut(&key) {
                    senders.retain(|tx| !tx.same_channel(&raw_tx));
                    if senders.is_empty() {
                        subs.remove(&key);
                    }
                }
                return Err(e);
            }
        };
        // Initial emit, to this subscriber only.
        let initial: serde_json::Value = serde_json::from_slice(&payload)?;
        let _ = raw_tx.send(initial);

        Ok(typed_rx)
    }

    /// Drop the server-side subscription and all local receivers for this
    /// attribute.
    pub async fn unsubscribe(&self) -> ScopeResult<()> {
        let key = (self.component.clone(), self.name.clone());
        lock(&self.client.inner.subscriptions).remove(&key);
        self.client
            .request(Operation::Unsubscribe, &self.component, &self.name, Vec::new())
            .await
            .map(|_| ())
    }
}

// =============================================================================
// Background IO task
// =============================================================================

enum Pending {
    Reply(oneshot::Sender<ScopeResult<Response>>),
    Resubscribe { component: String, attribute: String },
}

enum SessionEnd {
    /// All client handles dropped; the task exits.
    ClientGone,
    /// The connection failed; reconnect.
    Disconnected,
}

async fn io_task(
    inner: Arc<ClientInner>,
    mut commands: mpsc::Receiver<Command>,
    initial: TcpStream,
) {
    let mut stream = Some(initial);
    let mut next_id: u64 = 1;

    loop {
        let connected = match stream.take() {
            Some(s) => s,
            None => match reconnect(&inner, &mut commands).await {
                Some(s) => s,
                None => break,
            },
        };

        inner.connected.store(true, Ordering::Relaxed);
        let end = session(&inner, &mut commands, connected, &mut next_id).await;
        inner.connected.store(false, Ordering::Relaxed);

        match end {
            SessionEnd::ClientGone => break,
            SessionEnd::Disconnected => {
                debug!(addr = %inner.config.addr, "connection lost, reconnecting");
            }
        }
    }
    debug!(addr = %inner.config.addr, "client io task stopped");
}

/// Run one connected session until the stream fails or the client goes
/// away. Re-subscribes everything first, so reconnects restore pushes.
async fn session(
    inner: &Arc<ClientInner>,
    commands: &mut mpsc::Receiver<Command>,
    stream: TcpStream,
    next_id: &mut u64,
) -> SessionEnd {
    let (mut reader, mut writer) = stream.into_split();
    let mut pending: HashMap<u64, Pending> = HashMap::new();

    // Socket reads run in their own task so a frame read is never
    // cancelled halfway by the command branch of the select below.
    let (frames_tx, mut frames) = mpsc::channel::<ScopeResult<Frame>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let result = read_frame(&mut reader).await;
            let failed = result.is_err();
            if frames_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    for (component, attribute) in inner.subscription_keys() {
        let id = *next_id;
        *next_id += 1;
        let frame = Frame::Request(Request {
            id,
            op: Operation::Subscribe,
            component: component.clone(),
            attribute: attribute.clone(),
            payload: Vec::new(),
        });
        if write_frame(&mut writer, &frame).await.is_err() {
            reader_task.abort();
            fail_pending(pending);
            return SessionEnd::Disconnected;
        }
        pending.insert(
            id,
            Pending::Resubscribe {
                component,
                attribute,
            },
        );
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    reader_task.abort();
                    return SessionEnd::ClientGone;
                };
                let id = *next_id;
                *next_id += 1;
                let frame = Frame::Request(Request {
                    id,
                    op: command.op,
                    component: command.component,
                    attribute: command.attribute,
                    payload: command.payload,
                });
                match write_frame(&mut writer, &frame).await {
                    Ok(()) => {
                        pending.insert(id, Pending::Reply(command.reply));
                    }
                    Err(e) => {
                        let _ = command.reply.send(Err(e));
                        reader_task.abort();
                        fail_pending(pending);
                        return SessionEnd::Disconnected;
                    }
                }
            }

            frame = frames.recv() => match frame {
                Some(Ok(Frame::Response(response))) => match pending.remove(&response.id) {
                    Some(Pending::Reply(reply)) => {
                        let _ = reply.send(Ok(response));
                    }
                    Some(Pending::Resubscribe { component, attribute }) => {
                        if response.status == ResponseStatus::Success {
                            match serde_json::from_slice(&response.payload) {
                                Ok(value) => inner.deliver(&component, &attribute, value),
                                Err(e) => warn!(%component, %attribute, error = %e,
                                    "bad payload in re-subscribe response"),
                            }
                        } else {
                            warn!(%component, %attribute, status = ?response.status,
                                "re-subscribe rejected");
                        }
                    }
                    None => {
                        debug!(id = response.id, "response for unknown request");
                    }
                },
                Some(Ok(Frame::Update(update))) => {
                    match serde_json::from_slice(&update.payload) {
                        Ok(value) => inner.deliver(&update.component, &update.attribute, value),
                        Err(e) => warn!(error = %e, "dropping malformed update"),
                    }
                }
                Some(Ok(Frame::Request(_))) => {
                    warn!("server sent a request frame, dropping connection");
                    reader_task.abort();
                    fail_pending(pending);
                    return SessionEnd::Disconnected;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "read side failed");
                    reader_task.abort();
                    fail_pending(pending);
                    return SessionEnd::Disconnected;
                }
                None => {
                    reader_task.abort();
                    fail_pending(pending);
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}

fn fail_pending(pending: HashMap<u64, Pending>) {
    for (_, entry) in pending {
        if let Pending::Reply(reply) = entry {
            let _ = reply.send(Err(ScopeError::Unreachable("connection lost".into())));
        }
    }
}

/// Backoff loop. Commands arriving while disconnected fail immediately
/// with `Unreachable` rather than queueing behind the reconnect.
async fn reconnect(
    inner: &Arc<ClientInner>,
    commands: &mut mpsc::Receiver<Command>,
) -> Option<TcpStream> {
    let mut backoff = inner.config.reconnect_backoff;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let command = command?;
                let _ = command.reply.send(Err(ScopeError::Unreachable(format!(
                    "not connected to {}",
                    inner.config.addr
                ))));
            }
            _ = tokio::time::sleep(backoff) => {
                match TcpStream::connect(inner.config.addr).await {
                    Ok(stream) => {
                        info!(addr = %inner.config.addr, "reconnected");
                        return Some(stream);
                    }
                    Err(e) => {
                        debug!(addr = %inner.config.addr, error = %e, backoff = ?backoff,
                            "reconnect attempt failed");
                        backoff = (backoff * 2).min(inner.config.max_backoff);
                    }
                }
            }
        }
    }
}
