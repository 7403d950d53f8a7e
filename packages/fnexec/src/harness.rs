// ABOUTME: Harness client proxy for issuing work against a connected worker sandbox
// ABOUTME: Registers stage descriptors over the control channel and opens per-dispatch bundles

use crate::endpoint::EndpointAddress;
use crate::stage::{Coder, InputDestination, OutputTarget, StageDescriptor};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("control channel request failed: {0}")]
    Control(String),

    #[error("receiver for collection {collection} rejected an element: {reason}")]
    Receiver { collection: String, reason: String },

    #[error("state request failed: {0}")]
    State(String),
}

type Result<T> = std::result::Result<T, HarnessError>;

/// Instruction-level control connection to one worker, provided by the
/// worker handle once the sandbox has connected back.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Make a stage descriptor known to the worker ahead of bundle dispatch.
    async fn register(&self, descriptor: &StageDescriptor) -> Result<()>;
}

/// Sink for elements of one output collection.
pub trait ElementReceiver: Send + Sync {
    fn receive(&self, element: Vec<u8>) -> Result<()>;
}

/// Supplies an element receiver per originating collection when a bundle is
/// opened. One factory is passed per `get_bundle` call.
pub trait OutputReceiverFactory: Send + Sync {
    fn create(&self, collection: &str) -> Arc<dyn ElementReceiver>;
}

/// External-state access request forwarded from the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateRequest {
    pub state_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateResponse {
    pub data: Vec<u8>,
}

#[async_trait]
pub trait StateRequestHandler: Send + Sync {
    async fn handle(&self, request: StateRequest) -> Result<StateResponse>;
}

/// Progress snapshot reported while a bundle runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleProgress {
    pub elements_processed: u64,
}

pub trait BundleProgressHandler: Send + Sync {
    fn on_progress(&self, progress: BundleProgress);
    fn on_completed(&self, progress: BundleProgress);
}

/// Coder-paired receiver for one declared output target.
pub struct RemoteOutputReceiver {
    pub coder: Coder,
    pub receiver: Arc<dyn ElementReceiver>,
}

impl RemoteOutputReceiver {
    pub fn of(coder: Coder, receiver: Arc<dyn ElementReceiver>) -> Self {
        Self { coder, receiver }
    }
}

/// Local proxy for issuing work against one connected worker.
///
/// Pairs the worker's control channel with the data endpoint the worker
/// streams elements through.
#[derive(Clone)]
pub struct HarnessClient {
    control: Arc<dyn ControlChannel>,
    data_endpoint: EndpointAddress,
}

impl HarnessClient {
    pub fn new(control: Arc<dyn ControlChannel>, data_endpoint: EndpointAddress) -> Self {
        Self {
            control,
            data_endpoint,
        }
    }

    pub fn data_endpoint(&self) -> &EndpointAddress {
        &self.data_endpoint
    }

    /// Obtain a reusable bundle processor for one stage descriptor.
    ///
    /// Registers the descriptor with the worker exactly once; the returned
    /// processor can open any number of bundles against it.
    pub async fn get_processor(
        &self,
        descriptor: StageDescriptor,
        input_destinations: Vec<InputDestination>,
        state_endpoint: EndpointAddress,
    ) -> Result<BundleProcessor> {
        self.control.register(&descriptor).await?;
        debug!(stage_id = %descriptor.stage_id, "registered stage descriptor with worker");
        Ok(BundleProcessor {
            descriptor: Arc::new(descriptor),
            input_destinations,
            state_endpoint,
        })
    }
}

/// Stage-bound, reusable handle capable of opening bundles against one
/// worker. One processor exists per stage bundle factory.
pub struct BundleProcessor {
    descriptor: Arc<StageDescriptor>,
    input_destinations: Vec<InputDestination>,
    state_endpoint: EndpointAddress,
}

impl BundleProcessor {
    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    pub fn input_destinations(&self) -> &[InputDestination] {
        &self.input_destinations
    }

    pub fn state_endpoint(&self) -> &EndpointAddress {
        &self.state_endpoint
    }

    /// Open one bundle: a transient unit-of-work session carrying the output
    /// receivers and the state/progress handlers for that dispatch.
    pub fn new_bundle(
        &self,
        receivers: BTreeMap<OutputTarget, RemoteOutputReceiver>,
        state_handler: Arc<dyn StateRequestHandler>,
        progress_handler: Arc<dyn BundleProgressHandler>,
    ) -> ActiveBundle {
        let bundle_id = Uuid::new_v4().to_string();
        debug!(stage_id = %self.descriptor.stage_id, bundle_id = %bundle_id, "opened bundle");
        ActiveBundle {
            bundle_id,
            descriptor: Arc::clone(&self.descriptor),
            receivers,
            state_handler,
            progress_handler,
        }
    }
}

/// One session of dispatched work. Not retained by this core beyond its use;
/// execution of the work itself happens outside it.
pub struct ActiveBundle {
    bundle_id: String,
    descriptor: Arc<StageDescriptor>,
    receivers: BTreeMap<OutputTarget, RemoteOutputReceiver>,
    state_handler: Arc<dyn StateRequestHandler>,
    progress_handler: Arc<dyn BundleProgressHandler>,
}

// Handler fields are trait objects, so Debug is spelled out by hand.
impl fmt::Debug for ActiveBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveBundle")
            .field("bundle_id", &self.bundle_id)
            .field("stage_id", &self.descriptor.stage_id)
            .finish()
    }
}

impl ActiveBundle {
    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn stage_id(&self) -> &str {
        &self.descriptor.stage_id
    }

    pub fn receivers(&self) -> &BTreeMap<OutputTarget, RemoteOutputReceiver> {
        &self.receivers
    }

    pub fn state_handler(&self) -> &Arc<dyn StateRequestHandler> {
        &self.state_handler
    }

    pub fn progress_handler(&self) -> &Arc<dyn BundleProgressHandler> {
        &self.progress_handler
    }
}
