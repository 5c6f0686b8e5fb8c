#![forbid(unsafe_code)]

use std::fmt;

use fg_core::{TensorArena, TensorMeta, TensorOrigin};
use fg_device::DeviceSession;
pub use fg_runtime::{EvidenceEntry, EvidenceKind, EvidenceLedger};

pub use fg_core::{
    AssetHandle, AssetKind, ElementType, ShapeKind, Tensor, TensorError, TensorId, bytes_from_f32,
    bytes_from_u16, f32_from_bytes, u16_from_bytes,
};
pub use fg_device::{AssetState, DeviceError, SoftwareDevice};
pub use fg_graph::{
    ExecutionReport, MappingError, OperatorId, Pipeline, PipelineError, PipelineState,
    TensorMapping,
};
pub use fg_ops::{OperatorConfig, OperatorKind, TextRenderConfig, Typeface};
pub use fg_serialize::{DecodeMode, GraphSnapshot, encode_pipeline, snapshot_pipeline};

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The provider was closed; every subsequent operation fails with this.
    Closed,
    Device(DeviceError),
    Tensor(TensorError),
    Pipeline(PipelineError),
    /// The tensor is pipeline-local; the provider only touches global storage.
    NotGlobal { id: TensorId },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "provider session is closed"),
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::Pipeline(error) => write!(f, "pipeline failure: {error}"),
            Self::NotGlobal { id } => {
                write!(f, "tensor {} is not owned by the provider arena", id.raw())
            }
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<DeviceError> for ProviderError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<TensorError> for ProviderError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<PipelineError> for ProviderError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

/// Owning session handle: one device, one global tensor arena, one evidence
/// ledger. Pipelines are created here, hold their own local tensors, and are
/// executed back through the provider so globals and the device stay in one
/// place.
#[derive(Debug)]
pub struct Provider {
    device: SoftwareDevice,
    globals: TensorArena,
    ledger: EvidenceLedger,
    open: bool,
}

impl Provider {
    pub fn create(capture_width: usize, capture_height: usize) -> Result<Self, ProviderError> {
        let device = SoftwareDevice::open(capture_width, capture_height)?;
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Session,
            format!("session opened {capture_width}x{capture_height}"),
        );
        Ok(Self {
            device,
            globals: TensorArena::new(),
            ledger,
            open: true,
        })
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    /// Read-only view of the device; tests and tooling inspect asset state
    /// through it.
    #[must_use]
    pub fn device(&self) -> &SoftwareDevice {
        &self.device
    }

    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.open { Ok(()) } else { Err(ProviderError::Closed) }
    }

    pub fn create_pipeline(&mut self) -> Result<Pipeline, ProviderError> {
        self.ensure_open()?;
        let pipeline = Pipeline::new();
        self.ledger.record(
            EvidenceKind::Graph,
            format!("pipeline {} created", pipeline.id().raw()),
        );
        Ok(pipeline)
    }

    /// Creates a provider-owned value tensor visible to every pipeline.
    pub fn create_tensor(
        &mut self,
        element: ElementType,
        shape: ShapeKind,
        channels: usize,
        dims: Vec<usize>,
        initial: Option<Vec<u8>>,
    ) -> Result<Tensor, ProviderError> {
        self.ensure_open()?;
        let meta = TensorMeta::value(element, shape, channels, dims)?;
        let id = self.globals.create_value(meta.clone(), initial)?;
        Ok(Tensor::new(id, TensorOrigin::Global, meta))
    }

    /// Hands opaque asset bytes to the device and wraps the returned handle
    /// in a global asset tensor.
    pub fn create_asset_tensor(
        &mut self,
        kind: AssetKind,
        bytes: &[u8],
    ) -> Result<Tensor, ProviderError> {
        self.ensure_open()?;
        let handle = self.device.load_asset(kind, bytes)?;
        let id = self.globals.create_asset(kind, handle);
        self.ledger.record(
            EvidenceKind::Device,
            format!("asset {} loaded, {} bytes", handle.raw(), bytes.len()),
        );
        Ok(Tensor::new(id, TensorOrigin::Global, TensorMeta::asset(kind)))
    }

    fn ensure_global(tensor: &Tensor) -> Result<(), ProviderError> {
        match tensor.origin() {
            TensorOrigin::Global => Ok(()),
            TensorOrigin::Placeholder => Err(TensorError::UnsupportedForPlaceholder.into()),
            TensorOrigin::Local { .. } => Err(ProviderError::NotGlobal { id: tensor.id() }),
        }
    }

    pub fn reset_tensor(&mut self, tensor: &Tensor, payload: &[u8]) -> Result<(), ProviderError> {
        self.ensure_open()?;
        Self::ensure_global(tensor)?;
        self.globals.reset(tensor.id(), payload)?;
        Ok(())
    }

    pub fn read_tensor(&self, tensor: &Tensor) -> Result<&[u8], ProviderError> {
        self.ensure_open()?;
        Self::ensure_global(tensor)?;
        Ok(self.globals.bytes(tensor.id())?)
    }

    pub fn asset_handle(&self, tensor: &Tensor) -> Result<AssetHandle, ProviderError> {
        self.ensure_open()?;
        Self::ensure_global(tensor)?;
        Ok(self.globals.asset_handle(tensor.id())?)
    }

    /// Runs one pipeline for one frame against this provider's globals and
    /// device. Every execute outcome lands in the ledger.
    pub fn execute(
        &mut self,
        pipeline: &mut Pipeline,
        mapping: &TensorMapping,
    ) -> Result<ExecutionReport, ProviderError> {
        self.ensure_open()?;
        if !mapping.is_empty() {
            self.ledger.record(
                EvidenceKind::Binding,
                format!(
                    "pipeline {} resolving {} placeholder bindings",
                    pipeline.id().raw(),
                    mapping.len()
                ),
            );
        }
        match pipeline.execute(mapping, &mut self.globals, &mut self.device) {
            Ok(report) => {
                self.ledger.record(
                    EvidenceKind::Execution,
                    format!(
                        "pipeline {} executed {} operators",
                        pipeline.id().raw(),
                        report.order.len()
                    ),
                );
                Ok(report)
            }
            Err(error) => {
                self.ledger.record(
                    EvidenceKind::Execution,
                    format!("pipeline {} failed: {error}", pipeline.id().raw()),
                );
                Err(error.into())
            }
        }
    }

    /// Closes the session. Device assets are dropped; the ledger survives for
    /// post-mortem inspection.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.device.close();
        self.open = false;
        self.ledger.record(EvidenceKind::Session, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use fg_core::{AssetKind, ElementType, ShapeKind};
    use fg_device::DeviceError;
    use fg_runtime::EvidenceKind;

    use super::{Provider, ProviderError};

    #[test]
    fn create_rejects_zero_capture_dimensions() {
        let err = Provider::create(0, 480).expect_err("zero width must fail");
        assert_eq!(err, ProviderError::Device(DeviceError::Unavailable));
    }

    #[test]
    fn global_tensors_round_trip_through_the_provider() {
        let mut provider = Provider::create(4, 4).expect("provider should open");
        let tensor = provider
            .create_tensor(ElementType::U8, ShapeKind::Scalar, 1, vec![3], None)
            .expect("global should create");

        provider
            .reset_tensor(&tensor, &[7, 8, 9])
            .expect("reset should succeed");
        assert_eq!(
            provider.read_tensor(&tensor).expect("read should succeed"),
            &[7, 8, 9]
        );
    }

    #[test]
    fn pipeline_local_tensors_are_rejected_by_provider_accessors() {
        let mut provider = Provider::create(4, 4).expect("provider should open");
        let mut pipeline = provider.create_pipeline().expect("pipeline should create");
        let local = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Scalar, 1, vec![1], None)
            .expect("local should create");

        let err = provider
            .reset_tensor(&local, &[1])
            .expect_err("local tensor must fail");
        assert_eq!(err, ProviderError::NotGlobal { id: local.id() });
    }

    #[test]
    fn placeholder_reset_through_the_provider_is_unsupported() {
        let mut provider = Provider::create(4, 4).expect("provider should open");
        let mut pipeline = provider.create_pipeline().expect("pipeline should create");
        let reference = pipeline
            .create_tensor_reference(ElementType::U8, ShapeKind::Scalar, 1, vec![1])
            .expect("reference should create");

        let err = provider
            .reset_tensor(&reference, &[1])
            .expect_err("placeholder reset must fail");
        assert_eq!(
            err,
            ProviderError::Tensor(fg_core::TensorError::UnsupportedForPlaceholder)
        );
    }

    #[test]
    fn asset_tensors_carry_a_device_handle() {
        let mut provider = Provider::create(4, 4).expect("provider should open");
        let model = provider
            .create_asset_tensor(AssetKind::Model3d, b"gltf-bytes")
            .expect("asset should load");

        let handle = provider
            .asset_handle(&model)
            .expect("handle should resolve");
        let state = provider.device().asset(handle).expect("asset should exist");
        assert_eq!(state.kind(), AssetKind::Model3d);
        assert_eq!(state.byte_len(), b"gltf-bytes".len());
        assert_eq!(provider.ledger().entries_of(EvidenceKind::Device).count(), 1);
    }

    #[test]
    fn closed_provider_fails_every_operation() {
        let mut provider = Provider::create(4, 4).expect("provider should open");
        provider.close();
        assert!(!provider.is_open());

        let err = provider
            .create_pipeline()
            .expect_err("closed provider must fail");
        assert_eq!(err, ProviderError::Closed);

        // Closing twice is a no-op; the ledger holds one open and one close.
        provider.close();
        assert_eq!(provider.ledger().entries_of(EvidenceKind::Session).count(), 2);
    }
}
