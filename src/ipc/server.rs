//! HTTP long-polling server for the sample protocol.
//!
//! Each child process repeatedly sends `POST /rpc/{id}` with the result of its
//! previous sample, and the response body is its next instruction. The
//! request is held open until the scheduler decides what the child does next,
//! which can take as long as other combinations are being measured.
//!
//! Requests are forwarded to the matching [`RpcEndpoint`] through an `mpsc`
//! channel, together with a `oneshot` sender for the response. The endpoint
//! registry is the only state shared between the server tasks and the
//! scheduler.

use super::{Instruction, SampleReturn};
use crate::error::CombinationError;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Requests queued per endpoint. Only one is legitimate at a time; the rest
/// are protocol errors waiting to be reported.
const ENDPOINT_QUEUE: usize = 4;

/// How long `shutdown` waits for open connections to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A request from a child, waiting for its instruction.
#[derive(Debug)]
pub struct IncomingRequest {
    pub payload: Result<SampleReturn, CombinationError>,
    pub responder: oneshot::Sender<Instruction>,
}

#[derive(Clone)]
struct EndpointSlot {
    sender: mpsc::Sender<IncomingRequest>,
    busy: Arc<AtomicBool>,
}

#[derive(Clone, Default)]
struct Registry(Arc<Mutex<HashMap<String, EndpointSlot>>>);

impl Registry {
    fn insert(&self, id: &str, slot: EndpointSlot) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), slot);
    }

    fn remove(&self, id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn get(&self, id: &str) -> Option<EndpointSlot> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

/// Clears the outstanding-request flag when the handler finishes or is
/// cancelled by a disconnect.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrator side of one combination's sample protocol.
///
/// Dropping the endpoint unregisters it; a request still waiting on it is
/// answered with the exit instruction.
pub struct RpcEndpoint {
    id: String,
    receiver: mpsc::Receiver<IncomingRequest>,
    pending: Option<oneshot::Sender<Instruction>>,
    registry: Registry,
}

impl RpcEndpoint {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next request from the child.
    pub async fn receive(&mut self) -> Result<SampleReturn, CombinationError> {
        let request = self
            .receiver
            .recv()
            .await
            .ok_or_else(|| CombinationError::protocol("sample server stopped"))?;

        let payload = request.payload?;
        if self.pending.replace(request.responder).is_some() {
            return Err(CombinationError::protocol(
                "new request before the previous one was answered",
            ));
        }
        Ok(payload)
    }

    /// Answer the outstanding request.
    pub fn respond(&mut self, instruction: Instruction) -> Result<(), CombinationError> {
        let responder = self
            .pending
            .take()
            .ok_or_else(|| CombinationError::protocol("no outstanding request to answer"))?;
        responder
            .send(instruction)
            .map_err(|_| CombinationError::user("Task process disconnected"))
    }

    /// Whether a request is waiting for its answer.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Answer the outstanding request and wait for the next one.
    pub async fn exchange(&mut self, instruction: Instruction) -> Result<SampleReturn, CombinationError> {
        self.respond(instruction)?;
        self.receive().await
    }
}

impl Drop for RpcEndpoint {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// The HTTP server all child processes of a run talk to.
pub struct RpcServer {
    origin: String,
    registry: Registry,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RpcServer {
    /// Bind on an ephemeral loopback port and start serving.
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let origin = format!("http://{}", listener.local_addr()?);
        let registry = Registry::default();
        let app = router(registry.clone());

        let (shutdown, shutdown_signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_signal.await;
            });
            if let Err(e) = serve.await {
                error!("Sample server failed: {}", e);
            }
        });

        debug!("Sample server listening on {}", origin);
        Ok(Self {
            origin,
            registry,
            shutdown: Some(shutdown),
            handle,
        })
    }

    /// `http://127.0.0.1:<port>`
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Full URL a child uses for endpoint `id`.
    pub fn url(&self, id: &str) -> String {
        format!("{}/rpc/{}", self.origin, id)
    }

    /// Create the endpoint for combination `id`, before its process is
    /// spawned.
    pub fn register(&self, id: &str) -> RpcEndpoint {
        register(&self.registry, id)
    }

    /// Stop accepting requests and wait briefly for open ones to finish.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.handle)
            .await
            .is_err()
        {
            warn!("Sample server did not drain in time, aborting it");
            self.handle.abort();
        }
    }
}

fn register(registry: &Registry, id: &str) -> RpcEndpoint {
    let (sender, receiver) = mpsc::channel(ENDPOINT_QUEUE);
    registry.insert(
        id,
        EndpointSlot {
            sender,
            busy: Arc::new(AtomicBool::new(false)),
        },
    );
    RpcEndpoint {
        id: id.to_string(),
        receiver,
        pending: None,
        registry: registry.clone(),
    }
}

fn router(registry: Registry) -> Router {
    Router::new()
        .route("/rpc/:id", post(handle_rpc))
        .with_state(registry)
}

async fn handle_rpc(State(registry): State<Registry>, Path(id): Path<String>, body: Bytes) -> Response {
    let Some(slot) = registry.get(&id) else {
        warn!("Sample request for unknown combination {}", id);
        return (StatusCode::NOT_FOUND, "Unknown combination").into_response();
    };

    if slot.busy.swap(true, Ordering::SeqCst) {
        warn!("Duplicate outstanding request for combination {}", id);
        let (responder, _) = oneshot::channel();
        let _ = slot.sender.try_send(IncomingRequest {
            payload: Err(CombinationError::protocol("duplicate outstanding request")),
            responder,
        });
        return (StatusCode::CONFLICT, "Duplicate outstanding request").into_response();
    }
    let _busy = BusyGuard(slot.busy.clone());

    let payload = serde_json::from_slice::<SampleReturn>(&body)
        .map_err(|e| CombinationError::protocol(format!("malformed request: {}", e)))
        .and_then(|sample_return| sample_return.validate().map(|()| sample_return));

    let (responder, response) = oneshot::channel();
    if slot
        .sender
        .send(IncomingRequest { payload, responder })
        .await
        .is_err()
    {
        return Json(Instruction::exit()).into_response();
    }

    // A dropped responder means the endpoint is gone: let the child exit.
    let instruction = response.await.unwrap_or_else(|_| Instruction::exit());
    Json(instruction).into_response()
}
