// ABOUTME: Environment descriptor and provisioning seams for worker sandboxes
// ABOUTME: Defines the value-equal cache key plus the factory/handle traits behind sandbox launch

use crate::harness::ControlChannel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("failed to launch worker environment: {0}")]
    Launch(String),

    #[error("worker launched but control channel never connected: {0}")]
    ControlChannel(String),

    #[error("worker teardown failed: {0}")]
    Teardown(String),
}

type Result<T> = std::result::Result<T, ProvisionError>;

/// Value-equal description of the sandbox a stage requires.
///
/// Equality and hashing are structural: two stages whose specs compare equal
/// share one live worker connection. `env_vars` is a sorted map so hashing
/// does not depend on insertion order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub image: String,
    pub args: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
}

impl EnvironmentSpec {
    pub fn container(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            args: Vec::new(),
            env_vars: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(name.into(), value.into());
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }
}

/// Handle to one running worker sandbox.
///
/// Implementations own the sandbox process lifecycle; `control()` returns the
/// already-connected control channel and `close()` terminates the sandbox.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn worker_id(&self) -> &str;

    fn control(&self) -> Arc<dyn ControlChannel>;

    async fn close(&self) -> Result<()>;
}

/// Launches worker sandboxes for environment specs.
///
/// `create_environment` blocks until the sandbox is running and its control
/// channel has connected back, which can take multiple seconds.
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    async fn create_environment(&self, spec: &EnvironmentSpec) -> Result<Box<dyn WorkerHandle>>;
}
