// ABOUTME: Job bundle factory orchestrating shared services, environment cache, and stage dispatchers
// ABOUTME: Resolves each stage to a cached worker connection and hands out per-stage bundle factories

use crate::cache::{CacheError, EnvironmentCache};
use crate::connection::{ConnectionError, WorkerConnection};
use crate::endpoint::{EndpointAddress, EndpointError, ServerFactory, ServiceEndpoint};
use crate::environment::EnvironmentFactory;
use crate::harness::{
    ActiveBundle, BundleProcessor, BundleProgressHandler, OutputReceiverFactory,
    RemoteOutputReceiver, StateRequestHandler,
};
use crate::stage::{PipelineStage, StageDescriptor, StageError};
use crate::topology::RuntimeTopology;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("stage {stage_id}: {source}")]
    Stage {
        stage_id: String,
        #[source]
        source: StageError,
    },

    #[error(transparent)]
    Harness(#[from] crate::harness::HarnessError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("stage bundle factory for stage {0} is closed")]
    StageFactoryClosed(String),
}

type Result<T> = std::result::Result<T, FactoryError>;

/// Job metadata served to workers through the provisioning service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub job_name: String,
    pub retrieval_token: String,
}

impl JobInfo {
    pub fn new(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        retrieval_token: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            retrieval_token: retrieval_token.into(),
        }
    }
}

/// Addresses of the four job-scoped shared services, as handed to the
/// environment factory so launched workers can connect back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedServiceAddresses {
    pub control: EndpointAddress,
    pub logging: EndpointAddress,
    pub artifact_retrieval: EndpointAddress,
    pub provisioning: EndpointAddress,
}

/// Top-level orchestrator: owns the four job-scoped shared services and the
/// environment cache, and builds one `StageBundleFactory` per stage.
///
/// Safe to share across caller threads; the returned stage bundle factories
/// are not. Create one stage factory per concurrent client instead.
pub struct JobBundleFactory {
    job_info: JobInfo,
    stage_ids: AtomicU64,
    control: ServiceEndpoint,
    logging: ServiceEndpoint,
    artifact_retrieval: ServiceEndpoint,
    provisioning: ServiceEndpoint,
    cache: EnvironmentCache,
}

impl JobBundleFactory {
    /// Start the shared services through `server_factory`, then build the
    /// environment factory bound to their addresses and the cache around it.
    ///
    /// The environment factory is injected as a builder closure rather than a
    /// process-wide override so tests supply alternates directly.
    pub fn create<F>(
        job_info: JobInfo,
        server_factory: Arc<dyn ServerFactory>,
        environment_factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(&SharedServiceAddresses) -> Arc<dyn EnvironmentFactory>,
    {
        // Explicit ordered bind with attempt-all rollback on failure.
        fn bind_or_rollback(
            server_factory: &dyn ServerFactory,
            service: &str,
            started: &[&ServiceEndpoint],
        ) -> Result<ServiceEndpoint> {
            server_factory.bind(service).map_err(|e| {
                for endpoint in started {
                    endpoint.close();
                }
                e.into()
            })
        }

        let control = bind_or_rollback(server_factory.as_ref(), "control", &[])?;
        let logging = bind_or_rollback(server_factory.as_ref(), "logging", &[&control])?;
        let artifact_retrieval =
            bind_or_rollback(server_factory.as_ref(), "artifact", &[&control, &logging])?;
        let provisioning = bind_or_rollback(
            server_factory.as_ref(),
            "provisioning",
            &[&control, &logging, &artifact_retrieval],
        )?;

        let addresses = SharedServiceAddresses {
            control: control.address().clone(),
            logging: logging.address().clone(),
            artifact_retrieval: artifact_retrieval.address().clone(),
            provisioning: provisioning.address().clone(),
        };
        let environment_factory = environment_factory(&addresses);
        let cache = EnvironmentCache::new(environment_factory, server_factory);

        info!(job_id = %job_info.job_id, control = %addresses.control, "job bundle factory started");
        Ok(Self {
            job_info,
            stage_ids: AtomicU64::new(1),
            control,
            logging,
            artifact_retrieval,
            provisioning,
            cache,
        })
    }

    /// Convenience constructor using the detected runtime topology's
    /// addressing policy.
    pub fn with_detected_topology<F>(job_info: JobInfo, environment_factory: F) -> Result<Self>
    where
        F: FnOnce(&SharedServiceAddresses) -> Arc<dyn EnvironmentFactory>,
    {
        Self::create(
            job_info,
            RuntimeTopology::detect().server_factory(),
            environment_factory,
        )
    }

    pub fn job_info(&self) -> &JobInfo {
        &self.job_info
    }

    pub fn service_addresses(&self) -> SharedServiceAddresses {
        SharedServiceAddresses {
            control: self.control.address().clone(),
            logging: self.logging.address().clone(),
            artifact_retrieval: self.artifact_retrieval.address().clone(),
            provisioning: self.provisioning.address().clone(),
        }
    }

    /// Resolve the stage's environment through the cache and return a fresh
    /// stage bundle factory bound to the resulting connection.
    pub async fn for_stage(&self, stage: &PipelineStage) -> Result<StageBundleFactory> {
        let connection = self.cache.get_or_create(&stage.environment).await?;
        let stage_id = self.stage_ids.fetch_add(1, Ordering::SeqCst).to_string();
        StageBundleFactory::create(connection, stage_id, stage).await
    }

    /// Tear down the whole job: invalidate the environment cache first,
    /// closing every live sandbox, then close the four shared services, in
    /// that fixed order. Suppressed errors are logged, never raised; every
    /// close is attempted.
    pub async fn close(&self) {
        info!(job_id = %self.job_info.job_id, "closing job bundle factory");
        self.cache.invalidate_all().await;

        self.control.close();
        self.logging.close();
        self.artifact_retrieval.close();
        self.provisioning.close();
    }
}

/// Per-stage dispatcher over one worker connection.
///
/// Not safe for concurrent use: callers serialize `get_bundle` (the `&mut`
/// receiver enforces it) or create one factory per concurrent user. Bundle
/// dispatch is cheap to duplicate; the processor session is not built for
/// interleaving.
pub struct StageBundleFactory {
    stage_id: String,
    processor: BundleProcessor,
    // Strong reference pinning the connection for this factory's lifetime.
    connection: Option<Arc<WorkerConnection>>,
}

impl StageBundleFactory {
    async fn create(
        connection: Arc<WorkerConnection>,
        stage_id: String,
        stage: &PipelineStage,
    ) -> Result<Self> {
        connection.ensure_ready()?;
        let (descriptor, input_destinations) = StageDescriptor::build(
            stage_id.clone(),
            stage,
            connection.data_address().clone(),
            connection.state_address().clone(),
        )
        .map_err(|source| FactoryError::Stage {
            stage_id: stage_id.clone(),
            source,
        })?;

        // One-time, per-factory cost: the processor is reused across bundles.
        let processor = connection
            .client()
            .get_processor(
                descriptor,
                input_destinations,
                connection.state_address().clone(),
            )
            .await?;

        debug!(stage_id = %stage_id, worker_id = connection.worker_id(), "stage bundle factory ready");
        Ok(Self {
            stage_id,
            processor,
            connection: Some(connection),
        })
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        self.processor.descriptor()
    }

    /// Open one bundle: resolve, for every declared output target, the single
    /// originating collection, request a receiver for it, pair it with the
    /// declared coder, and hand the map plus handlers to the processor.
    pub fn get_bundle(
        &mut self,
        receiver_factory: &dyn OutputReceiverFactory,
        state_handler: Arc<dyn StateRequestHandler>,
        progress_handler: Arc<dyn BundleProgressHandler>,
    ) -> Result<ActiveBundle> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| FactoryError::StageFactoryClosed(self.stage_id.clone()))?;
        connection.ensure_ready()?;

        let stage_id = self.stage_id.clone();
        let descriptor = self.processor.descriptor();
        let mut receivers = BTreeMap::new();
        for (target, coder) in &descriptor.output_coders {
            let collection =
                descriptor
                    .originating_collection(target)
                    .map_err(|source| FactoryError::Stage {
                        stage_id: stage_id.clone(),
                        source,
                    })?;
            receivers.insert(
                target.clone(),
                RemoteOutputReceiver::of(coder.clone(), receiver_factory.create(collection)),
            );
        }

        Ok(self
            .processor
            .new_bundle(receivers, state_handler, progress_handler))
    }

    /// Drop the strong reference to the connection, making it eligible for
    /// cache eviction. Never tears down the sandbox or its endpoints.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!(stage_id = %self.stage_id, "stage bundle factory closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Lifecycle;
    use crate::endpoint::DirectServerFactory;
    use crate::environment::{EnvironmentSpec, ProvisionError, WorkerHandle};
    use crate::harness::{
        BundleProgress, ControlChannel, ElementReceiver, HarnessError, StateRequest, StateResponse,
    };
    use crate::stage::{Coder, OutputTarget, TransformSpec};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct StubControl;

    #[async_trait]
    impl ControlChannel for StubControl {
        async fn register(
            &self,
            _descriptor: &StageDescriptor,
        ) -> std::result::Result<(), HarnessError> {
            Ok(())
        }
    }

    struct StubWorker {
        id: String,
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl WorkerHandle for StubWorker {
        fn worker_id(&self) -> &str {
            &self.id
        }

        fn control(&self) -> Arc<dyn ControlChannel> {
            Arc::new(StubControl)
        }

        async fn close(&self) -> std::result::Result<(), ProvisionError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(ProvisionError::Teardown("sandbox vanished".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct CountingFactory {
        launches: AtomicUsize,
        worker_closes: Arc<AtomicUsize>,
        fail_worker_close: bool,
    }

    impl CountingFactory {
        fn new(fail_worker_close: bool) -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                worker_closes: Arc::new(AtomicUsize::new(0)),
                fail_worker_close,
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnvironmentFactory for CountingFactory {
        async fn create_environment(
            &self,
            _spec: &EnvironmentSpec,
        ) -> std::result::Result<Box<dyn WorkerHandle>, ProvisionError> {
            let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(StubWorker {
                id: format!("worker-{launch}"),
                closes: self.worker_closes.clone(),
                fail_close: self.fail_worker_close,
            }))
        }
    }

    struct NullSink;

    impl ElementReceiver for NullSink {
        fn receive(&self, _element: Vec<u8>) -> std::result::Result<(), HarnessError> {
            Ok(())
        }
    }

    struct RecordingReceiverFactory {
        created: Mutex<Vec<String>>,
    }

    impl RecordingReceiverFactory {
        fn new() -> Self {
            Self {
                created: Mutex::new(Vec::new()),
            }
        }
    }

    impl OutputReceiverFactory for RecordingReceiverFactory {
        fn create(&self, collection: &str) -> Arc<dyn ElementReceiver> {
            self.created.lock().unwrap().push(collection.to_string());
            Arc::new(NullSink)
        }
    }

    struct NullState;

    #[async_trait]
    impl StateRequestHandler for NullState {
        async fn handle(
            &self,
            _request: StateRequest,
        ) -> std::result::Result<StateResponse, HarnessError> {
            Ok(StateResponse { data: Vec::new() })
        }
    }

    struct NullProgress;

    impl BundleProgressHandler for NullProgress {
        fn on_progress(&self, _progress: BundleProgress) {}
        fn on_completed(&self, _progress: BundleProgress) {}
    }

    fn sink(input_collection: &str) -> TransformSpec {
        TransformSpec {
            urn: "sluice:transform:pardo:v1".to_string(),
            inputs: [("in".to_string(), input_collection.to_string())]
                .into_iter()
                .collect(),
            outputs: BTreeMap::new(),
        }
    }

    fn two_output_stage(environment: EnvironmentSpec) -> PipelineStage {
        PipelineStage {
            name: "read-then-fanout".to_string(),
            environment,
            transforms: [
                ("sink_a".to_string(), sink("pc_a")),
                ("sink_b".to_string(), sink("pc_b")),
            ]
            .into_iter()
            .collect(),
            input_collections: vec!["pc_main".to_string()],
            output_targets: [
                (OutputTarget::new("sink_a", "out"), Coder::new("sluice:coder:varint:v1")),
                (OutputTarget::new("sink_b", "out"), Coder::new("sluice:coder:bytes:v1")),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn job_factory(environment_factory: Arc<CountingFactory>) -> JobBundleFactory {
        JobBundleFactory::create(
            JobInfo::new("job-1", "wordcount", "token-1"),
            Arc::new(DirectServerFactory::new()),
            move |_addresses| -> Arc<dyn EnvironmentFactory> { environment_factory },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stages_with_equal_environments_share_a_connection() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        let a = factory.for_stage(&stage).await.unwrap();
        let b = factory.for_stage(&stage).await.unwrap();

        assert!(Arc::ptr_eq(
            a.connection.as_ref().unwrap(),
            b.connection.as_ref().unwrap()
        ));
        assert_eq!(environment_factory.launches(), 1);
        assert_ne!(a.stage_id(), b.stage_id());

        factory.close().await;
    }

    #[tokio::test]
    async fn concurrent_for_stage_calls_launch_once() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        let (a, b) = futures::join!(factory.for_stage(&stage), factory.for_stage(&stage));

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(environment_factory.launches(), 1);

        factory.close().await;
    }

    #[tokio::test]
    async fn distinct_environments_are_isolated() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage_a = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));
        let stage_b = two_output_stage(
            EnvironmentSpec::container("sluice/worker:1.0").with_env_var("EXPERIMENT", "on"),
        );

        let a = factory.for_stage(&stage_a).await.unwrap();
        let b = factory.for_stage(&stage_b).await.unwrap();

        assert!(!Arc::ptr_eq(
            a.connection.as_ref().unwrap(),
            b.connection.as_ref().unwrap()
        ));
        assert_eq!(environment_factory.launches(), 2);

        factory.close().await;
        assert_eq!(environment_factory.worker_closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn job_close_attempts_every_teardown_despite_failures() {
        let environment_factory = CountingFactory::new(true);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        let stage_factory = factory.for_stage(&stage).await.unwrap();
        let connection = stage_factory.connection.clone().unwrap();

        factory.close().await;

        // The failing worker teardown was attempted and suppressed, and all
        // four shared services were still closed.
        assert_eq!(environment_factory.worker_closes.load(Ordering::SeqCst), 1);
        assert_eq!(connection.lifecycle(), Lifecycle::Closed);
        assert!(factory.control.is_closed());
        assert!(factory.logging.is_closed());
        assert!(factory.artifact_retrieval.is_closed());
        assert!(factory.provisioning.is_closed());
        assert_eq!(factory.cache.live_environments(), 0);
    }

    #[tokio::test]
    async fn stage_factory_close_is_non_destructive() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        let mut stage_factory = factory.for_stage(&stage).await.unwrap();
        stage_factory.close();

        // The connection survives and the next stage reuses it.
        let replacement = factory.for_stage(&stage).await.unwrap();
        assert_eq!(environment_factory.launches(), 1);
        assert_eq!(
            replacement.connection.as_ref().unwrap().lifecycle(),
            Lifecycle::Ready
        );
        assert_eq!(environment_factory.worker_closes.load(Ordering::SeqCst), 0);

        factory.close().await;
    }

    #[tokio::test]
    async fn get_bundle_builds_receivers_for_every_output_target() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        let mut stage_factory = factory.for_stage(&stage).await.unwrap();
        let receiver_factory = RecordingReceiverFactory::new();
        let bundle = stage_factory
            .get_bundle(&receiver_factory, Arc::new(NullState), Arc::new(NullProgress))
            .unwrap();

        let targets: Vec<&OutputTarget> = bundle.receivers().keys().collect();
        assert_eq!(
            targets,
            vec![
                &OutputTarget::new("sink_a", "out"),
                &OutputTarget::new("sink_b", "out"),
            ]
        );
        assert_eq!(
            bundle.receivers()[&OutputTarget::new("sink_a", "out")].coder,
            Coder::new("sluice:coder:varint:v1")
        );
        assert_eq!(
            bundle.receivers()[&OutputTarget::new("sink_b", "out")].coder,
            Coder::new("sluice:coder:bytes:v1")
        );

        let created = receiver_factory.created.lock().unwrap().clone();
        assert_eq!(created, vec!["pc_a".to_string(), "pc_b".to_string()]);

        factory.close().await;
    }

    #[tokio::test]
    async fn ambiguous_output_target_fails_bundle_construction() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());

        let mut stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));
        stage.transforms.insert(
            "sink_a".to_string(),
            TransformSpec {
                urn: "sluice:transform:flatten:v1".to_string(),
                inputs: [
                    ("left".to_string(), "pc_a".to_string()),
                    ("right".to_string(), "pc_c".to_string()),
                ]
                .into_iter()
                .collect(),
                outputs: BTreeMap::new(),
            },
        );

        let mut stage_factory = factory.for_stage(&stage).await.unwrap();
        let err = stage_factory
            .get_bundle(
                &RecordingReceiverFactory::new(),
                Arc::new(NullState),
                Arc::new(NullProgress),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            FactoryError::Stage {
                source: StageError::AmbiguousOutput { .. },
                ..
            }
        ));

        factory.close().await;
    }

    #[tokio::test]
    async fn get_bundle_after_stage_factory_close_fails() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        let mut stage_factory = factory.for_stage(&stage).await.unwrap();
        stage_factory.close();

        let err = stage_factory
            .get_bundle(
                &RecordingReceiverFactory::new(),
                Arc::new(NullState),
                Arc::new(NullProgress),
            )
            .unwrap_err();
        assert!(matches!(err, FactoryError::StageFactoryClosed(_)));

        factory.close().await;
    }

    #[tokio::test]
    async fn get_bundle_after_job_close_fails_on_the_closed_connection() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        // The stage factory's pin keeps the connection value alive across
        // eviction, but dispatch through it must fail once it is closed.
        let mut stage_factory = factory.for_stage(&stage).await.unwrap();
        factory.close().await;

        let err = stage_factory
            .get_bundle(
                &RecordingReceiverFactory::new(),
                Arc::new(NullState),
                Arc::new(NullProgress),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FactoryError::Connection(ConnectionError::NotReady(Lifecycle::Closed))
        ));
    }

    #[tokio::test]
    async fn descriptor_is_bound_to_the_connection_endpoints() {
        let environment_factory = CountingFactory::new(false);
        let factory = job_factory(environment_factory.clone());
        let stage = two_output_stage(EnvironmentSpec::container("sluice/worker:1.0"));

        let stage_factory = factory.for_stage(&stage).await.unwrap();
        let connection = stage_factory.connection.as_ref().unwrap();

        assert_eq!(
            &stage_factory.descriptor().data_endpoint,
            connection.data_address()
        );
        assert_eq!(
            &stage_factory.descriptor().state_endpoint,
            connection.state_address()
        );

        factory.close().await;
    }
}
