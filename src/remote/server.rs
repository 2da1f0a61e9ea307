//! TCP attribute server.
//!
//! Serves a built [`ComponentTree`] to remote clients: attribute reads and
//! writes, subscription pushes fed by the attributes' own notification
//! machinery, and tree introspection. One task per client; a slow client
//! sees its own updates coalesced to the newest value, never anyone
//! else's.

use crate::attribute::{AttributeBase, SubscriptionId};
use crate::error::{ScopeError, ScopeResult};
use crate::remote::protocol::{
    read_frame, write_frame, AttributeSummary, ComponentSummary, Frame, Operation, Request,
    Response, ResponseStatus, Update,
};
use crate::tree::ComponentTree;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Per-client buffered frames awaiting the writer. When the queue is
/// full the per-subscription forwarders hold the newest value back until
/// there is room, so a slow client skips intermediate values but always
/// converges on the latest one.
const UPDATE_QUEUE: usize = 256;

pub struct AttributeServer {
    tree: Arc<ComponentTree>,
    read_timeout: Duration,
}

impl AttributeServer {
    pub fn new(tree: Arc<ComponentTree>) -> Self {
        Self {
            tree,
            read_timeout: Duration::from_secs(30),
        }
    }

    /// How long a client connection may stay silent between liveness
    /// checks of the accept loop's shutdown flag.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Bind and start serving. Returns once the listener is bound.
    pub async fn serve(self, bind_addr: SocketAddr) -> ScopeResult<ServerHandle> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "attribute server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tree = self.tree;
        let read_timeout = self.read_timeout;

        let task = tokio::spawn(async move {
            let mut shutdown = shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let tree = tree.clone();
                            let shutdown = shutdown_rx.clone();
                            tokio::spawn(async move {
                                handle_client(stream, peer, tree, read_timeout, shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
            debug!("attribute server accept loop stopped");
        });

        Ok(ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a running server: its bound address and a shutdown switch.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and disconnect all clients.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "server task join failed");
        }
    }
}

type Subscriptions = HashMap<(String, String), (Arc<dyn AttributeBase>, SubscriptionId)>;

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    tree: Arc<ComponentTree>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%peer, "client connected");
    let (mut reader, mut writer) = stream.into_split();

    // All frames to this client funnel through one writer task so update
    // pushes and responses never interleave mid-frame.
    let (tx, mut rx) = mpsc::channel::<Frame>(UPDATE_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    // Socket reads run in their own task: a frame read must never be
    // cancelled halfway or the stream desynchronizes.
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

    let mut subscriptions: Subscriptions = HashMap::new();
    let seq = Arc::new(AtomicU64::new(0));

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            result = timeout(read_timeout, frames.recv()) => match result {
                // Idle client; subscriptions keep flowing through the
                // writer task, this is just a liveness turn.
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(ScopeError::Io(e)))) => {
                    debug!(%peer, error = %e, "client connection closed");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(%peer, error = %e, "dropping client after protocol error");
                    break;
                }
            }
        };

        let request = match frame {
            Frame::Request(request) => request,
            other => {
                warn!(%peer, ?other, "unexpected frame from client");
                break;
            }
        };

        let response = dispatch(&tree, request, &tx, &seq, &mut subscriptions);
        if tx.send(Frame::Response(response)).await.is_err() {
            break;
        }
    }
    reader_task.abort();

    for ((component, attribute), (handle, id)) in subscriptions {
        handle.unsubscribe(id);
        debug!(%peer, %component, %attribute, "subscription dropped");
    }
    debug!(%peer, "client disconnected");
    drop(tx);
    let _ = writer_task.await;
}

fn dispatch(
    tree: &ComponentTree,
    request: Request,
    tx: &mpsc::Sender<Frame>,
    seq: &Arc<AtomicU64>,
    subscriptions: &mut Subscriptions,
) -> Response {
    let id = request.id;
    match handle_request(tree, request, tx, seq, subscriptions) {
        Ok(payload) => Response {
            id,
            status: ResponseStatus::Success,
            payload,
        },
        Err(e) => error_response(id, &e),
    }
}

fn handle_request(
    tree: &ComponentTree,
    request: Request,
    tx: &mpsc::Sender<Frame>,
    seq: &Arc<AtomicU64>,
    subscriptions: &mut Subscriptions,
) -> ScopeResult<Vec<u8>> {
    match request.op {
        Operation::Ping => Ok(Vec::new()),

        Operation::ListComponents => {
            let list: Vec<ComponentSummary> = tree
                .components()
                .iter()
                .map(|c| ComponentSummary {
                    name: c.name().to_string(),
                    role: c.role().to_string(),
                    attributes: c
                        .attributes()
                        .iter()
                        .map(|a| AttributeSummary {
                            name: a.name().to_string(),
                            unit: a.unit().map(str::to_string),
                            read_only: a.is_read_only(),
                            constraints: a.constraints_json(),
                        })
                        .collect(),
                })
                .collect();
            Ok(serde_json::to_vec(&list)?)
        }

        Operation::Get => {
            let attribute = find_attribute(tree, &request.component, &request.attribute)?;
            Ok(serde_json::to_vec(&attribute.value_json())?)
        }

        Operation::Set => {
            let attribute = find_attribute(tree, &request.component, &request.attribute)?;
            let value: serde_json::Value = serde_json::from_slice(&request.payload)
                .map_err(|e| ScopeError::InvalidRequest(format!("malformed value: {e}")))?;
            attribute.set_json(value)?;
            Ok(Vec::new())
        }

        Operation::Subscribe => {
            let attribute = find_attribute(tree, &request.component, &request.attribute)?;
            let key = (request.component.clone(), request.attribute.clone());

            // A repeated subscribe just re-reports the current value.
            if !subscriptions.contains_key(&key) {
                // The callback only refreshes a latest-value slot, so it
                // never blocks the attribute's write path; the forwarder
                // drains the slot at the client's pace, coalescing bursts
                // into the newest value instead of dropping it.
                let (slot_tx, mut slot_rx) = watch::channel(serde_json::Value::Null);
                let sub_id = attribute.subscribe_json(Box::new(move |value| {
                    slot_tx.send_replace(value);
                }));

                let tx = tx.clone();
                let seq = seq.clone();
                let component = request.component.clone();
                let name = request.attribute.clone();
                tokio::spawn(async move {
                    // Ends when the subscription is dropped: unsubscribe
                    // frees the callback and with it the slot sender.
                    while slot_rx.changed().await.is_ok() {
                        let payload = serde_json::to_vec(&*slot_rx.borrow_and_update())
                            .unwrap_or_default();
                        let update = Frame::Update(Update {
                            seq: seq.fetch_add(1, Ordering::Relaxed),
                            component: component.clone(),
                            attribute: name.clone(),
                            payload,
                        });
                        if tx.send(update).await.is_err() {
                            break;
                        }
                    }
                });
                subscriptions.insert(key, (attribute.clone(), sub_id));
            }

            Ok(serde_json::to_vec(&attribute.value_json())?)
        }

        Operation::Unsubscribe => {
            let key = (request.component.clone(), request.attribute.clone());
            match subscriptions.remove(&key) {
                Some((attribute, sub_id)) => {
                    attribute.unsubscribe(sub_id);
                    Ok(Vec::new())
                }
                None => Err(ScopeError::NotFound(format!(
                    "no subscription for {}/{}",
                    request.component, request.attribute
                ))),
            }
        }
    }
}

fn find_attribute(
    tree: &ComponentTree,
    component: &str,
    attribute: &str,
) -> ScopeResult<Arc<dyn AttributeBase>> {
    let node = tree
        .find_by_name(component)
        .ok_or_else(|| ScopeError::NotFound(format!("component '{component}'")))?;
    node.attributes().get(attribute).ok_or_else(|| {
        ScopeError::NotFound(format!("attribute '{component}/{attribute}'"))
    })
}

fn error_response(id: u64, error: &ScopeError) -> Response {
    let status = match error {
        ScopeError::NotFound(_) => ResponseStatus::NotFound,
        ScopeError::Validation(_) => ResponseStatus::ValidationFailed,
        ScopeError::ReadOnly(_) => ResponseStatus::ReadOnly,
        ScopeError::InvalidRequest(_) => ResponseStatus::InvalidRequest,
        ScopeError::Timeout(_) => ResponseStatus::Timeout,
        _ => ResponseStatus::Error,
    };
    Response {
        id,
        status,
        payload: serde_json::to_vec(&error.to_string()).unwrap_or_default(),
    }
}
