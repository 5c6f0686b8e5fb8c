#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use fg_core::{AssetKind, ElementType, ShapeKind, Tensor, TensorOrigin};
use fg_graph::Pipeline;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
const MAX_SNAPSHOT_PAYLOAD_BYTES: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotElement {
    U8,
    I8,
    U16,
    F32,
    Blob,
}

impl From<ElementType> for SnapshotElement {
    fn from(value: ElementType) -> Self {
        match value {
            ElementType::U8 => Self::U8,
            ElementType::I8 => Self::I8,
            ElementType::U16 => Self::U16,
            ElementType::F32 => Self::F32,
            ElementType::Blob => Self::Blob,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotShape {
    Scalar,
    Point,
    Matrix,
    Color,
    Model3d,
    Texture,
}

impl From<ShapeKind> for SnapshotShape {
    fn from(value: ShapeKind) -> Self {
        match value {
            ShapeKind::Scalar => Self::Scalar,
            ShapeKind::Point => Self::Point,
            ShapeKind::Matrix => Self::Matrix,
            ShapeKind::Color => Self::Color,
            ShapeKind::Asset(AssetKind::Model3d) => Self::Model3d,
            ShapeKind::Asset(AssetKind::Texture) => Self::Texture,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    Local,
    Global,
    Placeholder,
}

impl From<TensorOrigin> for SnapshotOrigin {
    fn from(value: TensorOrigin) -> Self {
        match value {
            TensorOrigin::Local { .. } => Self::Local,
            TensorOrigin::Global => Self::Global,
            TensorOrigin::Placeholder => Self::Placeholder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotTensor {
    pub id: u64,
    pub element: SnapshotElement,
    pub shape: SnapshotShape,
    pub channels: usize,
    pub dims: Vec<usize>,
    pub origin: SnapshotOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotBinding {
    pub port: String,
    pub tensor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotOperator {
    pub kind: String,
    pub operands: Vec<SnapshotBinding>,
    pub results: Vec<SnapshotBinding>,
}

/// Serialized view of one pipeline's topology: tensors and port wiring, not
/// payloads. Intended for diagnostics and golden-file comparisons; tensor ids
/// are process-scoped and a snapshot is not a rebuildable pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSnapshot {
    pub schema_version: u32,
    pub pipeline: u64,
    pub tensors: Vec<SnapshotTensor>,
    pub operators: Vec<SnapshotOperator>,
    pub source_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Reject unknown fields and hash mismatches.
    Strict,
    /// Tolerate unknown fields and a missing hash; recompute it.
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    PayloadTooLarge { bytes: usize, limit: usize },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::PayloadTooLarge { bytes, limit } => {
                write!(f, "payload of {bytes} bytes exceeds the {limit} byte limit")
            }
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

#[must_use]
pub fn snapshot_pipeline(pipeline: &Pipeline) -> GraphSnapshot {
    let mut tensors: BTreeMap<u64, SnapshotTensor> = BTreeMap::new();
    let mut operators = Vec::new();

    for (_, op) in pipeline.operators() {
        let mut collect = |port: &str, tensor: &Tensor| -> SnapshotBinding {
            tensors
                .entry(tensor.id().raw())
                .or_insert_with(|| SnapshotTensor {
                    id: tensor.id().raw(),
                    element: tensor.meta().element().into(),
                    shape: tensor.meta().shape().into(),
                    channels: tensor.meta().channels(),
                    dims: tensor.meta().dims().to_vec(),
                    origin: tensor.origin().into(),
                });
            SnapshotBinding {
                port: port.to_string(),
                tensor: tensor.id().raw(),
            }
        };

        let operands = op
            .operands()
            .map(|(port, tensor)| collect(port, tensor))
            .collect();
        let results = op
            .results()
            .map(|(port, tensor)| collect(port, tensor))
            .collect();
        operators.push(SnapshotOperator {
            kind: op.kind().name().to_string(),
            operands,
            results,
        });
    }

    let tensors: Vec<SnapshotTensor> = tensors.into_values().collect();
    let source_hash = snapshot_hash(pipeline.id().raw(), &tensors, &operators);
    GraphSnapshot {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        pipeline: pipeline.id().raw(),
        tensors,
        operators,
        source_hash,
    }
}

pub fn encode_snapshot(snapshot: &GraphSnapshot) -> Result<String, SerializeError> {
    serde_json::to_string(snapshot).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("snapshot encoding failed: {error}"),
    })
}

pub fn encode_pipeline(pipeline: &Pipeline) -> Result<String, SerializeError> {
    encode_snapshot(&snapshot_pipeline(pipeline))
}

pub fn decode_snapshot(input: &str, mode: DecodeMode) -> Result<GraphSnapshot, SerializeError> {
    if input.len() > MAX_SNAPSHOT_PAYLOAD_BYTES {
        return Err(SerializeError::PayloadTooLarge {
            bytes: input.len(),
            limit: MAX_SNAPSHOT_PAYLOAD_BYTES,
        });
    }
    match mode {
        DecodeMode::Strict => decode_strict(input),
        DecodeMode::Hardened => decode_hardened(input),
    }
}

fn decode_strict(input: &str) -> Result<GraphSnapshot, SerializeError> {
    let snapshot: GraphSnapshot =
        serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
            diagnostic: error.to_string(),
        })?;
    check_version(snapshot.schema_version)?;

    let expected = snapshot_hash(snapshot.pipeline, &snapshot.tensors, &snapshot.operators);
    if snapshot.source_hash != expected {
        return Err(SerializeError::ChecksumMismatch {
            expected,
            found: snapshot.source_hash,
        });
    }
    Ok(snapshot)
}

fn decode_hardened(input: &str) -> Result<GraphSnapshot, SerializeError> {
    let value: Value = serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
        diagnostic: error.to_string(),
    })?;
    let Value::Object(mut map) = value else {
        return Err(SerializeError::IncompatiblePayload {
            reason: "snapshot payload must be a json object".to_string(),
        });
    };

    // Unknown top-level fields are dropped; a missing hash is recomputed.
    map.retain(|key, _| {
        matches!(
            key.as_str(),
            "schema_version" | "pipeline" | "tensors" | "operators" | "source_hash"
        )
    });
    map.entry("source_hash")
        .or_insert_with(|| Value::String(String::new()));

    let mut snapshot: GraphSnapshot = serde_json::from_value(Value::Object(map)).map_err(|error| {
        SerializeError::InvalidJson {
            diagnostic: error.to_string(),
        }
    })?;
    check_version(snapshot.schema_version)?;
    snapshot.source_hash = snapshot_hash(snapshot.pipeline, &snapshot.tensors, &snapshot.operators);
    Ok(snapshot)
}

fn check_version(found: u32) -> Result<(), SerializeError> {
    if found != SNAPSHOT_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: SNAPSHOT_SCHEMA_VERSION,
            found,
        });
    }
    Ok(())
}

fn snapshot_hash(
    pipeline: u64,
    tensors: &[SnapshotTensor],
    operators: &[SnapshotOperator],
) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    SNAPSHOT_SCHEMA_VERSION.hash(&mut hasher);
    pipeline.hash(&mut hasher);
    for tensor in tensors {
        tensor.id.hash(&mut hasher);
        (tensor.element as u8).hash(&mut hasher);
        (tensor.shape as u8).hash(&mut hasher);
        tensor.channels.hash(&mut hasher);
        tensor.dims.hash(&mut hasher);
        (tensor.origin as u8).hash(&mut hasher);
    }
    for op in operators {
        op.kind.hash(&mut hasher);
        for binding in op.operands.iter().chain(op.results.iter()) {
            binding.port.hash(&mut hasher);
            binding.tensor.hash(&mut hasher);
        }
    }
    format!("det64:{:016x}", hasher.finish())
}
