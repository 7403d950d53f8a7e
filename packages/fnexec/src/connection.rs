// ABOUTME: Worker connection wrapper tying endpoints, dispatch pool, and harness client to one sandbox
// ABOUTME: Enforces the Starting->Ready->Closing->Closed lifecycle and attempt-all teardown

use crate::endpoint::{EndpointAddress, EndpointError, ServerFactory, ServiceEndpoint};
use crate::environment::{ProvisionError, WorkerHandle};
use crate::harness::HarnessClient;
use std::future::Future;
use std::sync::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("worker connection is {0:?}, expected Ready")]
    NotReady(Lifecycle),
}

/// Aggregate of per-resource failures from one teardown pass. Every owned
/// resource was still attempted; the connection is `Closed` regardless.
#[derive(Error, Debug)]
#[error("worker connection teardown completed with {} failure(s): {}", .failures.len(), .failures.join("; "))]
pub struct CloseError {
    pub failures: Vec<String>,
}

type Result<T> = std::result::Result<T, ConnectionError>;

/// Connection lifecycle. Transitions are forward-only; any operation
/// attempted after `Closed` fails immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Ready,
    Closing,
    Closed,
}

/// Task pool backing one worker connection's data plane.
///
/// Shutdown aborts outstanding tasks and awaits them, so teardown observes a
/// quiesced pool before reporting completion.
pub(crate) struct DispatchPool {
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl DispatchPool {
    pub(crate) fn new() -> Self {
        Self {
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub(crate) async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.spawn(task);
    }

    pub(crate) async fn shutdown(&self) {
        self.tasks.lock().await.shutdown().await;
    }
}

/// Owns, for one live sandbox: the data endpoint, the state endpoint, the
/// dispatch pool serving them, and the harness client bound to the sandbox's
/// control channel. Created once per cache miss and shared by every stage
/// whose descriptor resolves to the same cache entry.
pub struct WorkerConnection {
    worker: Box<dyn WorkerHandle>,
    pool: DispatchPool,
    data: ServiceEndpoint,
    state: ServiceEndpoint,
    client: HarnessClient,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkerConnection {
    /// Wrap a running worker: allocate the dispatch pool, start the data and
    /// state endpoint servers, and bind the harness client to the worker's
    /// control channel together with the data endpoint.
    ///
    /// On partial failure every resource allocated so far, the worker handle
    /// included, is released before the error is returned; a half-built
    /// connection is never published.
    pub async fn connect(
        worker: Box<dyn WorkerHandle>,
        server_factory: &dyn ServerFactory,
    ) -> Result<Self> {
        let pool = DispatchPool::new();

        let data = match server_factory.bind("data") {
            Ok(endpoint) => endpoint,
            Err(e) => {
                Self::rollback(worker.as_ref(), &pool, &[]).await;
                return Err(e.into());
            }
        };

        let state = match server_factory.bind("state") {
            Ok(endpoint) => endpoint,
            Err(e) => {
                Self::rollback(worker.as_ref(), &pool, &[&data]).await;
                return Err(e.into());
            }
        };

        // In direct addressing mode the data endpoint carries a real
        // listener; its accept loop runs on the connection's own pool.
        if let Some(listener) = data.take_listener() {
            match Self::into_async_listener(listener) {
                Ok(listener) => {
                    pool.spawn(async move {
                        loop {
                            match listener.accept().await {
                                // The element wire protocol is served by
                                // external collaborators; until one attaches,
                                // accepted streams are logged and dropped so
                                // nothing accumulates for the connection's
                                // lifetime.
                                Ok((_stream, peer)) => {
                                    debug!(%peer, "worker data channel connected");
                                }
                                Err(e) => {
                                    warn!(error = %e, "data endpoint accept failed");
                                    break;
                                }
                            }
                        }
                    })
                    .await;
                }
                Err(e) => {
                    Self::rollback(worker.as_ref(), &pool, &[&data, &state]).await;
                    return Err(e.into());
                }
            }
        }

        let client = HarnessClient::new(worker.control(), data.address().clone());
        debug!(
            worker_id = worker.worker_id(),
            data = %data.address(),
            state = %state.address(),
            "worker connection ready"
        );

        Ok(Self {
            worker,
            pool,
            data,
            state,
            client,
            lifecycle: Mutex::new(Lifecycle::Ready),
        })
    }

    fn into_async_listener(
        listener: std::net::TcpListener,
    ) -> std::result::Result<tokio::net::TcpListener, EndpointError> {
        listener
            .set_nonblocking(true)
            .and_then(|_| tokio::net::TcpListener::from_std(listener))
            .map_err(|source| EndpointError::Bind {
                service: "data".to_string(),
                source,
            })
    }

    async fn rollback(worker: &dyn WorkerHandle, pool: &DispatchPool, endpoints: &[&ServiceEndpoint]) {
        for endpoint in endpoints {
            endpoint.close();
        }
        pool.shutdown().await;
        if let Err(e) = worker.close().await {
            warn!(worker_id = worker.worker_id(), error = %e, "worker teardown failed during rollback");
        }
    }

    pub fn worker_id(&self) -> &str {
        self.worker.worker_id()
    }

    pub fn client(&self) -> &HarnessClient {
        &self.client
    }

    pub fn data_address(&self) -> &EndpointAddress {
        self.data.address()
    }

    pub fn state_address(&self) -> &EndpointAddress {
        self.state.address()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail fast unless the connection is `Ready`.
    pub fn ensure_ready(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Ready => Ok(()),
            other => Err(ConnectionError::NotReady(other)),
        }
    }

    /// Release all four owned resources: state endpoint, data endpoint,
    /// worker handle, dispatch pool. Every release is attempted even when an
    /// earlier one fails; failures are aggregated and the connection
    /// transitions to `Closed` regardless. Closing twice is a no-op.
    pub async fn close(&self) -> std::result::Result<(), CloseError> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            match *lifecycle {
                Lifecycle::Closing | Lifecycle::Closed => return Ok(()),
                _ => *lifecycle = Lifecycle::Closing,
            }
        }

        let mut failures = Vec::new();

        self.state.close();
        self.data.close();

        if let Err(e) = self.worker.close().await {
            warn!(worker_id = self.worker.worker_id(), error = %e, "worker teardown failed");
            failures.push(format!("worker {}: {}", self.worker.worker_id(), e));
        }

        // Awaited shutdown: outstanding dispatch tasks are aborted and joined
        // before close reports completion.
        self.pool.shutdown().await;

        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            *lifecycle = Lifecycle::Closed;
        }
        debug!(worker_id = self.worker.worker_id(), "worker connection closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures })
        }
    }
}
