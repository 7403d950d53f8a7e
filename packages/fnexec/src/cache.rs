// ABOUTME: Keyed loading cache mapping environment specs to live worker connections
// ABOUTME: Collapses concurrent loads per key and closes evicted connections best-effort

use crate::connection::{ConnectionError, WorkerConnection};
use crate::endpoint::ServerFactory;
use crate::environment::{EnvironmentFactory, EnvironmentSpec};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to provision environment {environment}: {reason}")]
    Load {
        environment: String,
        reason: Arc<ConnectionError>,
    },
}

type LoadResult = std::result::Result<Arc<WorkerConnection>, Arc<ConnectionError>>;
type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

enum Entry {
    Ready(Arc<WorkerConnection>),
    Loading(LoadFuture),
}

/// Keyed, loading, eviction-aware cache of worker connections.
///
/// Guarantees one live connection per distinct environment spec: concurrent
/// requests for the same missing key share a single in-flight creation, and
/// the result, success or failure, reaches every waiter. A failed load leaves
/// the key uncached so a later call can retry.
pub struct EnvironmentCache {
    environment_factory: Arc<dyn EnvironmentFactory>,
    server_factory: Arc<dyn ServerFactory>,
    entries: Mutex<HashMap<EnvironmentSpec, Entry>>,
}

impl EnvironmentCache {
    pub fn new(
        environment_factory: Arc<dyn EnvironmentFactory>,
        server_factory: Arc<dyn ServerFactory>,
    ) -> Self {
        Self {
            environment_factory,
            server_factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live connection for `spec`, launching a sandbox on a miss.
    ///
    /// Creating one sandbox never blocks lookups or creations for a different
    /// spec; the lock is only held for map bookkeeping, never across the
    /// blocking launch itself.
    pub async fn get_or_create(
        &self,
        spec: &EnvironmentSpec,
    ) -> std::result::Result<Arc<WorkerConnection>, CacheError> {
        let load = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(spec) {
                Some(Entry::Ready(connection)) => return Ok(connection.clone()),
                Some(Entry::Loading(load)) => load.clone(),
                None => {
                    debug!(environment = spec.image(), "provisioning worker environment");
                    let load = Self::load(
                        self.environment_factory.clone(),
                        self.server_factory.clone(),
                        spec.clone(),
                    )
                    .boxed()
                    .shared();
                    entries.insert(spec.clone(), Entry::Loading(load.clone()));
                    load
                }
            }
        };

        let result = load.clone().await;

        // Publish the outcome. Every waiter runs this step, so it must be
        // idempotent and must only touch the entry its own load produced.
        let orphan = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match &result {
                Ok(connection) => match entries.get(spec) {
                    Some(Entry::Loading(current)) if current.ptr_eq(&load) => {
                        entries.insert(spec.clone(), Entry::Ready(connection.clone()));
                        None
                    }
                    // A sibling waiter of this same load already published it.
                    Some(Entry::Ready(current)) if Arc::ptr_eq(current, connection) => None,
                    // Evicted or superseded by a newer load while this one was
                    // in flight: nobody owns the result anymore.
                    _ => Some(connection.clone()),
                },
                Err(_) => {
                    if let Some(Entry::Loading(current)) = entries.get(spec) {
                        if current.ptr_eq(&load) {
                            entries.remove(spec);
                        }
                    }
                    None
                }
            }
        };

        if let Some(connection) = orphan {
            warn!(environment = spec.image(), "environment evicted while provisioning, tearing it down");
            Self::close_connection(spec.image(), &connection).await;
        }

        result.map_err(|reason| CacheError::Load {
            environment: spec.image().to_string(),
            reason,
        })
    }

    async fn load(
        environment_factory: Arc<dyn EnvironmentFactory>,
        server_factory: Arc<dyn ServerFactory>,
        spec: EnvironmentSpec,
    ) -> LoadResult {
        let worker = environment_factory
            .create_environment(&spec)
            .await
            .map_err(|e| Arc::new(ConnectionError::from(e)))?;
        info!(
            environment = spec.image(),
            worker_id = worker.worker_id(),
            "worker environment started"
        );
        WorkerConnection::connect(worker, server_factory.as_ref())
            .await
            .map(Arc::new)
            .map_err(Arc::new)
    }

    /// Evict one key, closing its connection if it finished loading. Waiters
    /// on an in-flight load still receive their result; the publish step then
    /// finds the key gone (or taken over by a newer load) and tears the
    /// result down.
    pub async fn invalidate(&self, spec: &EnvironmentSpec) {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(spec)
        };
        if let Some(Entry::Ready(connection)) = entry {
            Self::close_connection(spec.image(), &connection).await;
        }
    }

    /// Evict everything, closing all live connections best-effort.
    pub async fn invalidate_all(&self) {
        let drained: Vec<(EnvironmentSpec, Entry)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().collect()
        };
        for (spec, entry) in drained {
            if let Entry::Ready(connection) = entry {
                Self::close_connection(spec.image(), &connection).await;
            }
        }
    }

    /// Number of connections that finished loading and are still cached.
    pub fn live_environments(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|entry| matches!(entry, Entry::Ready(_)))
            .count()
    }

    async fn close_connection(image: &str, connection: &WorkerConnection) {
        debug!(environment = image, "cleaning up worker environment");
        if let Err(e) = connection.close().await {
            // Eviction failures must never surface to an unrelated caller.
            warn!(environment = image, error = %e, "error cleaning up worker environment");
        }
    }
}
