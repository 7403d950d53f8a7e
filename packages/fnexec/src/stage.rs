// ABOUTME: Pipeline stage model and the endpoint-bound stage wire descriptor
// ABOUTME: Builds the descriptor sent to a worker and resolves output targets to originating collections

use crate::endpoint::EndpointAddress;
use crate::environment::EnvironmentSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("stage {stage} declares output target {target} on unknown transform {transform}")]
    UnknownTransform {
        stage: String,
        target: String,
        transform: String,
    },

    #[error("output target {target} has no originating collection")]
    MissingOutput { target: String },

    #[error("output target {target} resolves to {count} originating collections, expected exactly one")]
    AmbiguousOutput { target: String, count: usize },
}

type Result<T> = std::result::Result<T, StageError>;

/// Coder reference for one output collection, identified by URN.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coder {
    pub urn: String,
}

impl Coder {
    pub fn new(urn: impl Into<String>) -> Self {
        Self { urn: urn.into() }
    }
}

/// One transform in the stage graph: a URN plus input/output wiring from
/// local names to collection names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub urn: String,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
}

/// Identifies one declared stage output: the consuming transform plus the
/// local output name on it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputTarget {
    pub transform: String,
    pub name: String,
}

impl OutputTarget {
    pub fn new(transform: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            transform: transform.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.transform, self.name)
    }
}

/// Read-only description of one unit of pipeline work: the environment it
/// requires, its transform graph, and its declared outputs with coders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub environment: EnvironmentSpec,
    pub transforms: BTreeMap<String, TransformSpec>,
    /// Collections fed into the stage through the data channel.
    pub input_collections: Vec<String>,
    pub output_targets: BTreeMap<OutputTarget, Coder>,
}

/// Where one stage input is delivered inside the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDestination {
    pub collection: String,
    pub data_endpoint: EndpointAddress,
}

/// The translated, endpoint-bound representation of a stage sent to a worker.
///
/// Derived once per stage bundle factory from a `PipelineStage` plus the data
/// and state endpoint addresses of the worker connection serving it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub stage_id: String,
    pub stage_name: String,
    pub transforms: BTreeMap<String, TransformSpec>,
    pub output_coders: BTreeMap<OutputTarget, Coder>,
    pub data_endpoint: EndpointAddress,
    pub state_endpoint: EndpointAddress,
}

impl StageDescriptor {
    /// Build the wire descriptor for `stage`, bound to one worker's data and
    /// state endpoints. Fails when a declared output target references a
    /// transform the stage graph does not contain.
    pub fn build(
        stage_id: impl Into<String>,
        stage: &PipelineStage,
        data_endpoint: EndpointAddress,
        state_endpoint: EndpointAddress,
    ) -> Result<(Self, Vec<InputDestination>)> {
        let stage_id = stage_id.into();

        for target in stage.output_targets.keys() {
            if !stage.transforms.contains_key(&target.transform) {
                return Err(StageError::UnknownTransform {
                    stage: stage.name.clone(),
                    target: target.to_string(),
                    transform: target.transform.clone(),
                });
            }
        }

        let input_destinations = stage
            .input_collections
            .iter()
            .map(|collection| InputDestination {
                collection: collection.clone(),
                data_endpoint: data_endpoint.clone(),
            })
            .collect();

        let descriptor = Self {
            stage_id,
            stage_name: stage.name.clone(),
            transforms: stage.transforms.clone(),
            output_coders: stage.output_targets.clone(),
            data_endpoint,
            state_endpoint,
        };

        Ok((descriptor, input_destinations))
    }

    /// Resolve the single collection feeding `target`'s transform.
    ///
    /// A target resolving to zero or more than one originating collection is
    /// a contract violation on the stage construction side, never retryable.
    pub fn originating_collection(&self, target: &OutputTarget) -> Result<&str> {
        let transform =
            self.transforms
                .get(&target.transform)
                .ok_or_else(|| StageError::UnknownTransform {
                    stage: self.stage_name.clone(),
                    target: target.to_string(),
                    transform: target.transform.clone(),
                })?;

        let mut inputs = transform.inputs.values();
        let first = inputs.next().ok_or_else(|| StageError::MissingOutput {
            target: target.to_string(),
        })?;
        let extra = inputs.count();
        if extra > 0 {
            return Err(StageError::AmbiguousOutput {
                target: target.to_string(),
                count: extra + 1,
            });
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(inputs: &[(&str, &str)]) -> TransformSpec {
        TransformSpec {
            urn: "sluice:transform:pardo:v1".to_string(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            outputs: BTreeMap::new(),
        }
    }

    fn stage_with(transforms: Vec<(&str, TransformSpec)>, targets: Vec<(OutputTarget, Coder)>) -> PipelineStage {
        PipelineStage {
            name: "stage-under-test".to_string(),
            environment: EnvironmentSpec::container("sluice/worker:1.0"),
            transforms: transforms
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            input_collections: vec!["pc_in".to_string()],
            output_targets: targets.into_iter().collect(),
        }
    }

    fn addresses() -> (EndpointAddress, EndpointAddress) {
        (
            EndpointAddress::new("127.0.0.1", 9001),
            EndpointAddress::new("127.0.0.1", 9002),
        )
    }

    #[test]
    fn build_binds_endpoints_and_inputs() {
        let stage = stage_with(
            vec![("sink_a", transform(&[("in", "pc_a")]))],
            vec![(OutputTarget::new("sink_a", "out"), Coder::new("sluice:coder:bytes:v1"))],
        );
        let (data, state) = addresses();

        let (descriptor, inputs) = StageDescriptor::build("7", &stage, data.clone(), state.clone()).unwrap();

        assert_eq!(descriptor.stage_id, "7");
        assert_eq!(descriptor.data_endpoint, data);
        assert_eq!(descriptor.state_endpoint, state);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].collection, "pc_in");
        assert_eq!(inputs[0].data_endpoint, data);
    }

    #[test]
    fn build_rejects_targets_on_unknown_transforms() {
        let stage = stage_with(
            vec![("sink_a", transform(&[("in", "pc_a")]))],
            vec![(OutputTarget::new("missing", "out"), Coder::new("sluice:coder:bytes:v1"))],
        );
        let (data, state) = addresses();

        let err = StageDescriptor::build("7", &stage, data, state).unwrap_err();
        assert!(matches!(err, StageError::UnknownTransform { .. }));
    }

    #[test]
    fn resolves_single_originating_collection() {
        let stage = stage_with(
            vec![("sink_a", transform(&[("in", "pc_a")]))],
            vec![(OutputTarget::new("sink_a", "out"), Coder::new("sluice:coder:bytes:v1"))],
        );
        let (data, state) = addresses();
        let (descriptor, _) = StageDescriptor::build("7", &stage, data, state).unwrap();

        let collection = descriptor
            .originating_collection(&OutputTarget::new("sink_a", "out"))
            .unwrap();
        assert_eq!(collection, "pc_a");
    }

    #[test]
    fn missing_originating_collection_is_a_contract_violation() {
        let stage = stage_with(
            vec![("sink_a", transform(&[]))],
            vec![(OutputTarget::new("sink_a", "out"), Coder::new("sluice:coder:bytes:v1"))],
        );
        let (data, state) = addresses();
        let (descriptor, _) = StageDescriptor::build("7", &stage, data, state).unwrap();

        let err = descriptor
            .originating_collection(&OutputTarget::new("sink_a", "out"))
            .unwrap_err();
        assert!(matches!(err, StageError::MissingOutput { .. }));
    }

    #[test]
    fn ambiguous_originating_collection_is_a_contract_violation() {
        let stage = stage_with(
            vec![("sink_a", transform(&[("left", "pc_a"), ("right", "pc_b")]))],
            vec![(OutputTarget::new("sink_a", "out"), Coder::new("sluice:coder:bytes:v1"))],
        );
        let (data, state) = addresses();
        let (descriptor, _) = StageDescriptor::build("7", &stage, data, state).unwrap();

        let err = descriptor
            .originating_collection(&OutputTarget::new("sink_a", "out"))
            .unwrap_err();
        assert!(matches!(err, StageError::AmbiguousOutput { count: 2, .. }));
    }
}
