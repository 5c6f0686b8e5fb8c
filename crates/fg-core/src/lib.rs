#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(u64);

impl TensorId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PipelineId(u64);

impl PipelineId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque identifier issued by the device layer for loaded asset payloads
/// (3D models, textures). The engine never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetHandle(u64);

impl AssetHandle {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I8,
    U16,
    F32,
    /// Opaque payload; carried by asset tensors only. Has no element size.
    Blob,
}

impl ElementType {
    #[must_use]
    pub const fn byte_size(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 => Some(2),
            Self::F32 => Some(4),
            Self::Blob => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Model3d,
    Texture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Scalar,
    Point,
    Matrix,
    Color,
    Asset(AssetKind),
}

impl ShapeKind {
    #[must_use]
    pub const fn is_asset(self) -> bool {
        matches!(self, Self::Asset(_))
    }
}

/// Fixed shape contract of a tensor: element type, semantic shape kind, channel
/// count, and dimension vector. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    element: ElementType,
    shape: ShapeKind,
    channels: usize,
    dims: Vec<usize>,
}

impl TensorMeta {
    pub fn value(
        element: ElementType,
        shape: ShapeKind,
        channels: usize,
        dims: Vec<usize>,
    ) -> Result<Self, TensorError> {
        if shape.is_asset() || element == ElementType::Blob {
            return Err(TensorError::OpaqueValueContract);
        }
        if channels == 0 {
            return Err(TensorError::ZeroChannels);
        }
        if dims.is_empty() {
            return Err(TensorError::EmptyDimensions);
        }
        if let Some(index) = dims.iter().position(|&dim| dim == 0) {
            return Err(TensorError::ZeroDimension { index });
        }
        Ok(Self {
            element,
            shape,
            channels,
            dims,
        })
    }

    #[must_use]
    pub fn asset(kind: AssetKind) -> Self {
        Self {
            element: ElementType::Blob,
            shape: ShapeKind::Asset(kind),
            channels: 0,
            dims: Vec::new(),
        }
    }

    #[must_use]
    pub fn element(&self) -> ElementType {
        self.element
    }

    #[must_use]
    pub fn shape(&self) -> ShapeKind {
        self.shape
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn is_asset(&self) -> bool {
        self.shape.is_asset()
    }

    /// Declared payload size: channels x product(dims) x element byte size.
    /// Asset metas have no byte contract.
    #[must_use]
    pub fn byte_len(&self) -> Option<usize> {
        let elem = self.element.byte_size()?;
        let count: usize = self.dims.iter().product();
        Some(self.channels * count * elem)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Buffer(Vec<u8>),
    Asset(AssetHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorOrigin {
    /// Owned by the pipeline that created it; lifetime = pipeline lifetime.
    Local { pipeline: PipelineId },
    /// Owned by the provider arena; shared across pipelines.
    Global,
    /// Metadata only, no storage; resolved per execution through a mapping.
    Placeholder,
}

/// Cloneable tensor handle. The payload lives in the owning arena; the handle
/// carries enough metadata to validate port bindings without arena access.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    id: TensorId,
    origin: TensorOrigin,
    meta: TensorMeta,
}

impl Tensor {
    #[must_use]
    pub fn new(id: TensorId, origin: TensorOrigin, meta: TensorMeta) -> Self {
        Self { id, origin, meta }
    }

    #[must_use]
    pub fn id(&self) -> TensorId {
        self.id
    }

    #[must_use]
    pub fn origin(&self) -> TensorOrigin {
        self.origin
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.origin == TensorOrigin::Placeholder
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    ShapeMismatch { expected: usize, actual: usize },
    UnsupportedForPlaceholder,
    UnsupportedForAsset,
    OpaqueValueContract,
    ZeroChannels,
    EmptyDimensions,
    ZeroDimension { index: usize },
    UnknownTensor { id: TensorId },
    NotAnAsset { id: TensorId },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "payload size mismatch: contract={expected} bytes, payload={actual} bytes"
                )
            }
            Self::UnsupportedForPlaceholder => {
                write!(f, "placeholder tensors carry no storage")
            }
            Self::UnsupportedForAsset => {
                write!(f, "asset tensors carry a device handle, not a byte payload")
            }
            Self::OpaqueValueContract => {
                write!(f, "value tensors require a sized element type and non-asset shape")
            }
            Self::ZeroChannels => write!(f, "channel count must be positive"),
            Self::EmptyDimensions => write!(f, "dimension vector must be non-empty"),
            Self::ZeroDimension { index } => {
                write!(f, "dimension {index} must be positive")
            }
            Self::UnknownTensor { id } => {
                write!(f, "tensor {} is not stored in this arena", id.raw())
            }
            Self::NotAnAsset { id } => {
                write!(f, "tensor {} does not hold an asset handle", id.raw())
            }
        }
    }
}

impl std::error::Error for TensorError {}

#[derive(Debug, Clone, PartialEq)]
struct TensorRecord {
    meta: TensorMeta,
    data: TensorData,
}

/// Id-keyed tensor storage. One arena backs each pipeline's local tensors and
/// one backs the provider's globals; the engine addresses both uniformly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorArena {
    records: BTreeMap<TensorId, TensorRecord>,
}

impl TensorArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value tensor. A missing initial payload zero-fills the buffer;
    /// a present one must match the meta contract exactly.
    pub fn create_value(
        &mut self,
        meta: TensorMeta,
        initial: Option<Vec<u8>>,
    ) -> Result<TensorId, TensorError> {
        let expected = meta.byte_len().ok_or(TensorError::OpaqueValueContract)?;
        let buffer = match initial {
            Some(payload) => {
                if payload.len() != expected {
                    return Err(TensorError::ShapeMismatch {
                        expected,
                        actual: payload.len(),
                    });
                }
                payload
            }
            None => vec![0u8; expected],
        };

        let id = TensorId::next();
        self.records.insert(
            id,
            TensorRecord {
                meta,
                data: TensorData::Buffer(buffer),
            },
        );
        Ok(id)
    }

    /// Stores an asset tensor around a device-issued handle.
    pub fn create_asset(&mut self, kind: AssetKind, handle: AssetHandle) -> TensorId {
        let id = TensorId::next();
        self.records.insert(
            id,
            TensorRecord {
                meta: TensorMeta::asset(kind),
                data: TensorData::Asset(handle),
            },
        );
        id
    }

    /// Replaces a tensor's payload wholesale. The new payload must match the
    /// fixed shape contract; partial writes are not part of the model.
    pub fn reset(&mut self, id: TensorId, payload: &[u8]) -> Result<(), TensorError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(TensorError::UnknownTensor { id })?;
        match &mut record.data {
            TensorData::Buffer(buffer) => {
                let expected = record
                    .meta
                    .byte_len()
                    .ok_or(TensorError::UnsupportedForAsset)?;
                if payload.len() != expected {
                    return Err(TensorError::ShapeMismatch {
                        expected,
                        actual: payload.len(),
                    });
                }
                buffer.clear();
                buffer.extend_from_slice(payload);
                Ok(())
            }
            TensorData::Asset(_) => Err(TensorError::UnsupportedForAsset),
        }
    }

    pub fn meta(&self, id: TensorId) -> Result<&TensorMeta, TensorError> {
        self.records
            .get(&id)
            .map(|record| &record.meta)
            .ok_or(TensorError::UnknownTensor { id })
    }

    pub fn data(&self, id: TensorId) -> Result<&TensorData, TensorError> {
        self.records
            .get(&id)
            .map(|record| &record.data)
            .ok_or(TensorError::UnknownTensor { id })
    }

    pub fn bytes(&self, id: TensorId) -> Result<&[u8], TensorError> {
        match self.data(id)? {
            TensorData::Buffer(buffer) => Ok(buffer.as_slice()),
            TensorData::Asset(_) => Err(TensorError::UnsupportedForAsset),
        }
    }

    pub fn asset_handle(&self, id: TensorId) -> Result<AssetHandle, TensorError> {
        match self.data(id)? {
            TensorData::Asset(handle) => Ok(*handle),
            TensorData::Buffer(_) => Err(TensorError::NotAnAsset { id }),
        }
    }

    #[must_use]
    pub fn contains(&self, id: TensorId) -> bool {
        self.records.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.records.keys().copied()
    }
}

#[must_use]
pub fn bytes_from_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn f32_from_bytes(bytes: &[u8]) -> Result<Vec<f32>, TensorError> {
    if bytes.len() % 4 != 0 {
        return Err(TensorError::ShapeMismatch {
            expected: bytes.len().next_multiple_of(4),
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[must_use]
pub fn bytes_from_u16(values: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 2);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn u16_from_bytes(bytes: &[u8]) -> Result<Vec<u16>, TensorError> {
    if bytes.len() % 2 != 0 {
        return Err(TensorError::ShapeMismatch {
            expected: bytes.len() + 1,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}
