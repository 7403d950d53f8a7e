// ABOUTME: Worker environment provisioning and per-stage bundle dispatch for Sluice pipelines
// ABOUTME: Caches one live sandbox connection per environment spec and hands out stage dispatchers

pub mod cache;
pub mod connection;
pub mod endpoint;
pub mod environment;
pub mod factory;
pub mod harness;
pub mod stage;
pub mod topology;

pub use cache::{CacheError, EnvironmentCache};
pub use connection::{CloseError, ConnectionError, Lifecycle, WorkerConnection};
pub use endpoint::{
    DirectServerFactory, EndpointAddress, EndpointError, PublishedPortServerFactory, ServerFactory,
    ServiceEndpoint,
};
pub use environment::{EnvironmentFactory, EnvironmentSpec, ProvisionError, WorkerHandle};
pub use factory::{
    FactoryError, JobBundleFactory, JobInfo, SharedServiceAddresses, StageBundleFactory,
};
pub use harness::{
    ActiveBundle, BundleProcessor, BundleProgress, BundleProgressHandler, ControlChannel,
    ElementReceiver, HarnessClient, HarnessError, OutputReceiverFactory, RemoteOutputReceiver,
    StateRequest, StateRequestHandler, StateResponse,
};
pub use stage::{
    Coder, InputDestination, OutputTarget, PipelineStage, StageDescriptor, StageError,
    TransformSpec,
};
pub use topology::{Addressing, PortRotation, RuntimeTopology};
