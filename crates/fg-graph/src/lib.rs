#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use fg_core::{
    AssetKind, ElementType, PipelineId, ShapeKind, Tensor, TensorArena, TensorError, TensorId,
    TensorMeta, TensorOrigin,
};
use fg_device::{DeviceError, DeviceSession, Invocation, OperandValue, ResultSlot};
use fg_ops::{Operator, OperatorConfig, OperatorKind, PortBindingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperatorId(usize);

impl OperatorId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappingError {
    NotAPlaceholder { id: TensorId },
    PlaceholderTarget { id: TensorId },
    ContractMismatch { id: TensorId },
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAPlaceholder { id } => {
                write!(f, "tensor {} is not a placeholder", id.raw())
            }
            Self::PlaceholderTarget { id } => {
                write!(
                    f,
                    "placeholder {} cannot be bound to another placeholder",
                    id.raw()
                )
            }
            Self::ContractMismatch { id } => {
                write!(
                    f,
                    "bound tensor does not satisfy placeholder {}'s declared contract",
                    id.raw()
                )
            }
        }
    }
}

impl std::error::Error for MappingError {}

/// Per-execution binding table: placeholder tensors resolved to concrete or
/// global tensors. Rebuilt (or rebound) freshly each frame; never mutates the
/// graph it is applied to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMapping {
    entries: BTreeMap<TensorId, Tensor>,
}

impl TensorMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, placeholder: &Tensor, target: &Tensor) -> Result<(), MappingError> {
        if !placeholder.is_placeholder() {
            return Err(MappingError::NotAPlaceholder {
                id: placeholder.id(),
            });
        }
        if target.is_placeholder() {
            return Err(MappingError::PlaceholderTarget { id: target.id() });
        }
        if placeholder.meta() != target.meta() {
            return Err(MappingError::ContractMismatch {
                id: placeholder.id(),
            });
        }
        self.entries.insert(placeholder.id(), target.clone());
        Ok(())
    }

    #[must_use]
    pub fn resolve(&self, placeholder: TensorId) -> Option<&Tensor> {
        self.entries.get(&placeholder)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Building,
    Finalized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    Tensor(TensorError),
    Port(PortBindingError),
    FinalizedPipeline { attempted: &'static str },
    UnknownOperator { id: OperatorId },
    ForeignTensor { id: TensorId },
    SingleWriterViolation { id: TensorId },
    UnboundOperandPort { operator: OperatorKind, port: &'static str },
    UnboundPlaceholder { id: TensorId },
    CyclicGraph,
    DeviceUnavailable,
    OperatorExecutionFailed { kind: OperatorKind, reason: String },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
            Self::Port(error) => write!(f, "port binding failure: {error}"),
            Self::FinalizedPipeline { attempted } => {
                write!(
                    f,
                    "pipeline is finalized; structural change '{attempted}' is disallowed"
                )
            }
            Self::UnknownOperator { id } => {
                write!(f, "operator index {} is not in this pipeline", id.index())
            }
            Self::ForeignTensor { id } => {
                write!(
                    f,
                    "tensor {} is local to another pipeline and cannot be used here",
                    id.raw()
                )
            }
            Self::SingleWriterViolation { id } => {
                write!(
                    f,
                    "tensor {} already has a writer; a tensor may be the result of at most one operator",
                    id.raw()
                )
            }
            Self::UnboundOperandPort { operator, port } => {
                write!(f, "operator '{operator}' has unbound operand port '{port}'")
            }
            Self::UnboundPlaceholder { id } => {
                write!(
                    f,
                    "placeholder {} is reachable from operator ports but missing from the mapping",
                    id.raw()
                )
            }
            Self::CyclicGraph => write!(f, "operator dependency graph contains a cycle"),
            Self::DeviceUnavailable => write!(f, "device session is unavailable"),
            Self::OperatorExecutionFailed { kind, reason } => {
                write!(f, "operator '{kind}' failed: {reason}")
            }
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<TensorError> for PipelineError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

impl From<PortBindingError> for PipelineError {
    fn from(value: PortBindingError) -> Self {
        Self::Port(value)
    }
}

/// Outcome of one `execute` call: the deterministic operator order that ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub order: Vec<OperatorId>,
}

/// An append-only directed graph of operators connected through tensors.
/// Built once, executed once per frame; after the first execution the
/// topology is frozen and only payloads and placeholder bindings change.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    id: PipelineId,
    state: PipelineState,
    arena: TensorArena,
    operators: Vec<Operator>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: PipelineId::next(),
            state: PipelineState::Building,
            arena: TensorArena::new(),
            operators: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> PipelineId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[must_use]
    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    #[must_use]
    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        self.operators.get(id.0)
    }

    pub fn operators(&self) -> impl Iterator<Item = (OperatorId, &Operator)> + '_ {
        self.operators
            .iter()
            .enumerate()
            .map(|(index, op)| (OperatorId(index), op))
    }

    fn ensure_building(&self, attempted: &'static str) -> Result<(), PipelineError> {
        if self.state == PipelineState::Finalized {
            return Err(PipelineError::FinalizedPipeline { attempted });
        }
        Ok(())
    }

    pub fn create_operator(
        &mut self,
        kind: OperatorKind,
        config: OperatorConfig,
    ) -> Result<OperatorId, PipelineError> {
        self.ensure_building("create_operator")?;
        let id = OperatorId(self.operators.len());
        self.operators.push(Operator::new(kind, config));
        Ok(id)
    }

    /// Creates a pipeline-local concrete tensor; lifetime = pipeline lifetime.
    pub fn create_tensor(
        &mut self,
        element: ElementType,
        shape: ShapeKind,
        channels: usize,
        dims: Vec<usize>,
        initial: Option<Vec<u8>>,
    ) -> Result<Tensor, PipelineError> {
        self.ensure_building("create_tensor")?;
        let meta = TensorMeta::value(element, shape, channels, dims)?;
        let id = self.arena.create_value(meta.clone(), initial)?;
        Ok(Tensor::new(
            id,
            TensorOrigin::Local { pipeline: self.id },
            meta,
        ))
    }

    /// Creates a placeholder: fixed contract, no storage. Must be resolved
    /// through a mapping at every execution.
    pub fn create_tensor_reference(
        &mut self,
        element: ElementType,
        shape: ShapeKind,
        channels: usize,
        dims: Vec<usize>,
    ) -> Result<Tensor, PipelineError> {
        self.ensure_building("create_tensor_reference")?;
        let meta = TensorMeta::value(element, shape, channels, dims)?;
        Ok(Tensor::new(TensorId::next(), TensorOrigin::Placeholder, meta))
    }

    /// Placeholder for an opaque asset; no shape is needed.
    pub fn create_asset_reference(&mut self, kind: AssetKind) -> Result<Tensor, PipelineError> {
        self.ensure_building("create_asset_reference")?;
        Ok(Tensor::new(
            TensorId::next(),
            TensorOrigin::Placeholder,
            TensorMeta::asset(kind),
        ))
    }

    #[must_use]
    pub fn create_tensor_mapping(&self) -> TensorMapping {
        TensorMapping::new()
    }

    fn ensure_usable_here(&self, tensor: &Tensor) -> Result<(), PipelineError> {
        if let TensorOrigin::Local { pipeline } = tensor.origin() {
            if pipeline != self.id {
                return Err(PipelineError::ForeignTensor { id: tensor.id() });
            }
        }
        Ok(())
    }

    /// Replaces a local tensor's payload between frames. Placeholders carry
    /// no storage; globals are reset through the provider.
    pub fn reset_tensor(&mut self, tensor: &Tensor, payload: &[u8]) -> Result<(), PipelineError> {
        if tensor.is_placeholder() {
            return Err(TensorError::UnsupportedForPlaceholder.into());
        }
        self.ensure_usable_here(tensor)?;
        match tensor.origin() {
            TensorOrigin::Local { .. } => {
                self.arena.reset(tensor.id(), payload)?;
                Ok(())
            }
            TensorOrigin::Global | TensorOrigin::Placeholder => {
                Err(PipelineError::ForeignTensor { id: tensor.id() })
            }
        }
    }

    pub fn read_tensor(&self, tensor: &Tensor) -> Result<&[u8], PipelineError> {
        if tensor.is_placeholder() {
            return Err(TensorError::UnsupportedForPlaceholder.into());
        }
        self.ensure_usable_here(tensor)?;
        Ok(self.arena.bytes(tensor.id())?)
    }

    pub fn set_operand(
        &mut self,
        operator: OperatorId,
        port: &str,
        tensor: &Tensor,
    ) -> Result<(), PipelineError> {
        self.ensure_building("set_operand")?;
        self.ensure_usable_here(tensor)?;
        let op = self
            .operators
            .get_mut(operator.0)
            .ok_or(PipelineError::UnknownOperator { id: operator })?;
        op.bind_operand(port, tensor)?;
        Ok(())
    }

    pub fn set_result(
        &mut self,
        operator: OperatorId,
        port: &str,
        tensor: &Tensor,
    ) -> Result<(), PipelineError> {
        self.ensure_building("set_result")?;
        self.ensure_usable_here(tensor)?;
        if self.writer_of(tensor.id()).is_some() {
            return Err(PipelineError::SingleWriterViolation { id: tensor.id() });
        }
        let op = self
            .operators
            .get_mut(operator.0)
            .ok_or(PipelineError::UnknownOperator { id: operator })?;
        op.bind_result(port, tensor)?;
        Ok(())
    }

    fn writer_of(&self, tensor: TensorId) -> Option<OperatorId> {
        for (index, op) in self.operators.iter().enumerate() {
            if op.results().any(|(_, bound)| bound.id() == tensor) {
                return Some(OperatorId(index));
            }
        }
        None
    }

    /// Executes the graph once. Placeholders are resolved freshly through
    /// `mapping`; globals are read from and written into `globals`.
    pub fn execute(
        &mut self,
        mapping: &TensorMapping,
        globals: &mut TensorArena,
        device: &mut dyn DeviceSession,
    ) -> Result<ExecutionReport, PipelineError> {
        // Structural completeness gates finalization: an unbound operand is a
        // construction-time fault and leaves the pipeline in Building state.
        for op in &self.operators {
            if let Some(port) = op.missing_operand() {
                return Err(PipelineError::UnboundOperandPort {
                    operator: op.kind(),
                    port,
                });
            }
        }
        self.state = PipelineState::Finalized;

        let resolved = self.resolve_bindings(mapping)?;
        let order = self.topological_order(&resolved)?;

        if !device.is_open() {
            return Err(PipelineError::DeviceUnavailable);
        }

        for &op_id in &order {
            let op = &self.operators[op_id.0];
            let kind = op.kind();
            let invocation = self.build_invocation(op, &resolved, globals)?;
            let writes = device
                .run_operator(&invocation)
                .map_err(|error| map_device_error(kind, error))?;
            self.write_results(op_id, &resolved, globals, writes)?;
        }

        Ok(ExecutionReport { order })
    }

    /// Resolves every port binding to a concrete tensor, substituting mapping
    /// targets for placeholders. Fails before any operator runs.
    fn resolve_bindings(
        &self,
        mapping: &TensorMapping,
    ) -> Result<BTreeMap<TensorId, Tensor>, PipelineError> {
        let mut resolved = BTreeMap::new();
        for op in &self.operators {
            for (_, tensor) in op.operands().chain(op.results()) {
                let target = self.resolve_one(tensor, mapping)?;
                resolved.insert(tensor.id(), target);
            }
        }
        Ok(resolved)
    }

    fn resolve_one(
        &self,
        tensor: &Tensor,
        mapping: &TensorMapping,
    ) -> Result<Tensor, PipelineError> {
        let target = if tensor.is_placeholder() {
            mapping
                .resolve(tensor.id())
                .ok_or(PipelineError::UnboundPlaceholder { id: tensor.id() })?
                .clone()
        } else {
            tensor.clone()
        };
        if let TensorOrigin::Local { pipeline } = target.origin() {
            if pipeline != self.id {
                return Err(PipelineError::ForeignTensor { id: target.id() });
            }
        }
        Ok(target)
    }

    /// Kahn's algorithm over the resolved single-writer dependency graph.
    /// Ready operators are drained in ascending insertion order, which keeps
    /// the visit order stable across repeated executions.
    fn topological_order(
        &self,
        resolved: &BTreeMap<TensorId, Tensor>,
    ) -> Result<Vec<OperatorId>, PipelineError> {
        let mut writer: BTreeMap<TensorId, usize> = BTreeMap::new();
        for (index, op) in self.operators.iter().enumerate() {
            for (_, tensor) in op.results() {
                let target = &resolved[&tensor.id()];
                if writer.insert(target.id(), index).is_some() {
                    return Err(PipelineError::SingleWriterViolation { id: target.id() });
                }
            }
        }

        let count = self.operators.len();
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut indegree = vec![0usize; count];
        for (index, op) in self.operators.iter().enumerate() {
            for (_, tensor) in op.operands() {
                let target = &resolved[&tensor.id()];
                if let Some(&producer) = writer.get(&target.id()) {
                    if producer != index && successors[producer].insert(index) {
                        indegree[index] += 1;
                    }
                }
            }
        }

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(index, _)| index)
            .collect();
        let mut order = Vec::with_capacity(count);
        while let Some(&index) = ready.iter().next() {
            ready.remove(&index);
            order.push(OperatorId(index));
            for &next in &successors[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != count {
            return Err(PipelineError::CyclicGraph);
        }
        Ok(order)
    }

    fn arena_for<'a>(&'a self, origin: TensorOrigin, globals: &'a TensorArena) -> &'a TensorArena {
        match origin {
            TensorOrigin::Global => globals,
            _ => &self.arena,
        }
    }

    fn build_invocation(
        &self,
        op: &Operator,
        resolved: &BTreeMap<TensorId, Tensor>,
        globals: &TensorArena,
    ) -> Result<Invocation, PipelineError> {
        let mut operands = Vec::new();
        for (port, tensor) in op.operands() {
            let target = &resolved[&tensor.id()];
            let arena = self.arena_for(target.origin(), globals);
            let value = if target.meta().is_asset() {
                OperandValue::Asset(arena.asset_handle(target.id())?)
            } else {
                OperandValue::Buffer {
                    meta: target.meta().clone(),
                    bytes: arena.bytes(target.id())?.to_vec(),
                }
            };
            operands.push((port, value));
        }

        let mut results = Vec::new();
        for (port, tensor) in op.results() {
            let target = &resolved[&tensor.id()];
            results.push(ResultSlot {
                port,
                meta: target.meta().clone(),
            });
        }

        Ok(Invocation {
            kind: op.kind(),
            config: op.config().clone(),
            operands,
            results,
        })
    }

    fn write_results(
        &mut self,
        op_id: OperatorId,
        resolved: &BTreeMap<TensorId, Tensor>,
        globals: &mut TensorArena,
        writes: Vec<fg_device::ResultWrite>,
    ) -> Result<(), PipelineError> {
        let kind = self.operators[op_id.0].kind();
        for write in writes {
            let Some(tensor) = self.operators[op_id.0].result(write.port) else {
                return Err(PipelineError::OperatorExecutionFailed {
                    kind,
                    reason: format!("device wrote undeclared result port '{}'", write.port),
                });
            };
            let target = resolved[&tensor.id()].clone();
            let outcome = match target.origin() {
                TensorOrigin::Global => globals.reset(target.id(), &write.bytes),
                _ => self.arena.reset(target.id(), &write.bytes),
            };
            outcome.map_err(|error| PipelineError::OperatorExecutionFailed {
                kind,
                reason: format!("result write to port '{}' rejected: {error}", write.port),
            })?;
        }
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn map_device_error(kind: OperatorKind, error: DeviceError) -> PipelineError {
    match error {
        DeviceError::Unavailable => PipelineError::DeviceUnavailable,
        DeviceError::UnknownAsset { handle } => PipelineError::OperatorExecutionFailed {
            kind,
            reason: format!("asset handle {} is not loaded", handle.raw()),
        },
        DeviceError::Execution { kind, reason } => {
            PipelineError::OperatorExecutionFailed { kind, reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use fg_core::{
        ElementType, ShapeKind, TensorArena, bytes_from_f32,
    };
    use fg_device::{DeviceSession, SoftwareDevice};
    use fg_ops::{OperatorConfig, OperatorKind};

    use super::{
        MappingError, Pipeline, PipelineError, PipelineState, TensorMapping,
    };

    const CROP: usize = 8;
    const CAP_W: usize = 16;
    const CAP_H: usize = 12;

    struct CropFixture {
        pipeline: Pipeline,
        write_ref: fg_core::Tensor,
    }

    /// Capture -> affine solve -> affine apply, cropping into a placeholder.
    /// Mirrors the engine's canonical usage shape at test scale.
    fn crop_pipeline() -> CropFixture {
        let mut pipeline = Pipeline::new();
        let capture = pipeline
            .create_operator(OperatorKind::CaptureAccess, OperatorConfig::None)
            .expect("capture op should create");
        let solve = pipeline
            .create_operator(OperatorKind::ComputeAffine, OperatorConfig::None)
            .expect("solve op should create");
        let apply = pipeline
            .create_operator(OperatorKind::ApplyAffine, OperatorConfig::None)
            .expect("apply op should create");

        let raw = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Matrix, 3, vec![CAP_H, CAP_W], None)
            .expect("raw image should create");
        let write_ref = pipeline
            .create_tensor_reference(ElementType::U8, ShapeKind::Matrix, 3, vec![CROP, CROP])
            .expect("crop reference should create");
        let affine = pipeline
            .create_tensor(ElementType::F32, ShapeKind::Matrix, 1, vec![2, 3], None)
            .expect("affine tensor should create");
        let src_points = pipeline
            .create_tensor(
                ElementType::F32,
                ShapeKind::Point,
                2,
                vec![3],
                Some(bytes_from_f32(&[2.0, 2.0, 10.0, 2.0, 10.0, 10.0])),
            )
            .expect("src points should create");
        let dst_points = pipeline
            .create_tensor(
                ElementType::F32,
                ShapeKind::Point,
                2,
                vec![3],
                Some(bytes_from_f32(&[0.0, 0.0, 8.0, 0.0, 8.0, 8.0])),
            )
            .expect("dst points should create");

        pipeline
            .set_result(capture, "left image", &raw)
            .expect("capture result should bind");
        pipeline
            .set_operand(solve, "src", &src_points)
            .expect("src should bind");
        pipeline
            .set_operand(solve, "dst", &dst_points)
            .expect("dst should bind");
        pipeline
            .set_result(solve, "result", &affine)
            .expect("solve result should bind");
        pipeline
            .set_operand(apply, "affine", &affine)
            .expect("affine operand should bind");
        pipeline
            .set_operand(apply, "src image", &raw)
            .expect("src image should bind");
        pipeline
            .set_result(apply, "dst image", &write_ref)
            .expect("crop result should bind");

        CropFixture { pipeline, write_ref }
    }

    #[test]
    fn crop_pipeline_populates_the_global_target() {
        let CropFixture { mut pipeline, write_ref } = crop_pipeline();
        let mut globals = TensorArena::new();
        let meta = write_ref.meta().clone();
        let global_id = globals
            .create_value(meta.clone(), None)
            .expect("global crop should create");
        let global = fg_core::Tensor::new(global_id, fg_core::TensorOrigin::Global, meta);

        let mut mapping = TensorMapping::new();
        mapping
            .bind(&write_ref, &global)
            .expect("placeholder should bind to global");

        let mut device = SoftwareDevice::open(CAP_W, CAP_H).expect("device should open");
        let report = pipeline
            .execute(&mapping, &mut globals, &mut device)
            .expect("execute should succeed");

        assert_eq!(report.order.len(), 3);
        let bytes = globals.bytes(global_id).expect("global should hold the crop");
        assert_eq!(bytes.len(), CROP * CROP * 3);
        assert!(bytes.iter().any(|&b| b != 0), "crop should carry captured data");
        assert_eq!(pipeline.state(), PipelineState::Finalized);
    }

    #[test]
    fn execute_order_is_deterministic_across_calls() {
        let CropFixture { mut pipeline, write_ref } = crop_pipeline();
        let mut globals = TensorArena::new();
        let meta = write_ref.meta().clone();
        let global_id = globals
            .create_value(meta.clone(), None)
            .expect("global crop should create");
        let global = fg_core::Tensor::new(global_id, fg_core::TensorOrigin::Global, meta);
        let mut mapping = TensorMapping::new();
        mapping
            .bind(&write_ref, &global)
            .expect("placeholder should bind");

        let mut device = SoftwareDevice::open(CAP_W, CAP_H).expect("device should open");
        let first = pipeline
            .execute(&mapping, &mut globals, &mut device)
            .expect("first execute should succeed");
        let second = pipeline
            .execute(&mapping, &mut globals, &mut device)
            .expect("second execute should succeed");
        assert_eq!(first.order, second.order);
    }

    #[test]
    fn missing_placeholder_binding_fails_before_any_execution() {
        let CropFixture { mut pipeline, write_ref } = crop_pipeline();
        let mut globals = TensorArena::new();
        let mut device = SoftwareDevice::open(CAP_W, CAP_H).expect("device should open");

        let err = pipeline
            .execute(&TensorMapping::new(), &mut globals, &mut device)
            .expect_err("empty mapping must fail");
        assert_eq!(
            err,
            PipelineError::UnboundPlaceholder { id: write_ref.id() }
        );
        // No operator ran: the device never advanced a frame.
        assert_eq!(device.frame(), 0);
    }

    #[test]
    fn structural_changes_after_first_execute_are_rejected() {
        let CropFixture { mut pipeline, write_ref } = crop_pipeline();
        let mut globals = TensorArena::new();
        let meta = write_ref.meta().clone();
        let global_id = globals
            .create_value(meta.clone(), None)
            .expect("global crop should create");
        let global = fg_core::Tensor::new(global_id, fg_core::TensorOrigin::Global, meta);
        let mut mapping = TensorMapping::new();
        mapping.bind(&write_ref, &global).expect("bind should succeed");

        let mut device = SoftwareDevice::open(CAP_W, CAP_H).expect("device should open");
        pipeline
            .execute(&mapping, &mut globals, &mut device)
            .expect("execute should succeed");

        let err = pipeline
            .create_operator(OperatorKind::CaptureAccess, OperatorConfig::None)
            .expect_err("post-finalize operator creation must fail");
        assert_eq!(
            err,
            PipelineError::FinalizedPipeline {
                attempted: "create_operator"
            }
        );
    }

    #[test]
    fn single_writer_rule_rejects_a_second_result_binding() {
        let mut pipeline = Pipeline::new();
        let capture_a = pipeline
            .create_operator(OperatorKind::CaptureAccess, OperatorConfig::None)
            .expect("first capture should create");
        let capture_b = pipeline
            .create_operator(OperatorKind::CaptureAccess, OperatorConfig::None)
            .expect("second capture should create");
        let raw = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Matrix, 3, vec![CAP_H, CAP_W], None)
            .expect("image should create");

        pipeline
            .set_result(capture_a, "left image", &raw)
            .expect("first writer should bind");
        let err = pipeline
            .set_result(capture_b, "left image", &raw)
            .expect_err("second writer must fail");
        assert_eq!(err, PipelineError::SingleWriterViolation { id: raw.id() });
    }

    #[test]
    fn cyclic_graph_is_rejected_at_execution() {
        let mut pipeline = Pipeline::new();
        let warp_a = pipeline
            .create_operator(OperatorKind::ApplyAffine, OperatorConfig::None)
            .expect("warp a should create");
        let warp_b = pipeline
            .create_operator(OperatorKind::ApplyAffine, OperatorConfig::None)
            .expect("warp b should create");

        let identity = bytes_from_f32(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let affine = pipeline
            .create_tensor(ElementType::F32, ShapeKind::Matrix, 1, vec![2, 3], Some(identity))
            .expect("affine should create");
        let image_a = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Matrix, 1, vec![4, 4], None)
            .expect("image a should create");
        let image_b = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Matrix, 1, vec![4, 4], None)
            .expect("image b should create");

        pipeline.set_operand(warp_a, "affine", &affine).expect("bind");
        pipeline.set_operand(warp_a, "src image", &image_a).expect("bind");
        pipeline.set_result(warp_a, "dst image", &image_b).expect("bind");
        pipeline.set_operand(warp_b, "affine", &affine).expect("bind");
        pipeline.set_operand(warp_b, "src image", &image_b).expect("bind");
        pipeline.set_result(warp_b, "dst image", &image_a).expect("bind");

        let mut globals = TensorArena::new();
        let mut device = SoftwareDevice::open(4, 4).expect("device should open");
        let err = pipeline
            .execute(&TensorMapping::new(), &mut globals, &mut device)
            .expect_err("cycle must fail");
        assert_eq!(err, PipelineError::CyclicGraph);
    }

    #[test]
    fn device_failure_keeps_earlier_writes_and_the_pipeline_reusable() {
        let mut device = SoftwareDevice::open(4, 3).expect("device should open");
        let handle = device
            .load_asset(fg_core::AssetKind::Model3d, b"gltf-bytes")
            .expect("asset should load");
        let mut globals = TensorArena::new();
        let model_id = globals.create_asset(fg_core::AssetKind::Model3d, handle);
        let model = fg_core::Tensor::new(
            model_id,
            fg_core::TensorOrigin::Global,
            fg_core::TensorMeta::asset(fg_core::AssetKind::Model3d),
        );

        let mut pipeline = Pipeline::new();
        let capture = pipeline
            .create_operator(OperatorKind::CaptureAccess, OperatorConfig::None)
            .expect("capture should create");
        let update = pipeline
            .create_operator(OperatorKind::UpdateModel, OperatorConfig::None)
            .expect("update should create");

        let raw = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Matrix, 3, vec![3, 4], None)
            .expect("raw frame should create");
        let material = pipeline
            .create_tensor(ElementType::U16, ShapeKind::Scalar, 1, vec![1], None)
            .expect("material slot should create");
        // Texture index 1 is not loaded on the asset, so update_model fails.
        let value = pipeline
            .create_tensor(
                ElementType::U16,
                ShapeKind::Scalar,
                1,
                vec![1],
                Some(fg_core::bytes_from_u16(&[1])),
            )
            .expect("value should create");

        pipeline
            .set_result(capture, "left image", &raw)
            .expect("capture target should bind");
        pipeline
            .set_operand(update, "gltf", &model)
            .expect("model should bind");
        pipeline
            .set_operand(update, "material ID", &material)
            .expect("material should bind");
        pipeline
            .set_operand(update, "value", &value)
            .expect("value should bind");

        let err = pipeline
            .execute(&TensorMapping::new(), &mut globals, &mut device)
            .expect_err("unloaded texture index must fail");
        assert!(matches!(
            err,
            PipelineError::OperatorExecutionFailed {
                kind: OperatorKind::UpdateModel,
                ..
            }
        ));

        // The capture ran before the failing operator; its write stays.
        let frame = pipeline.read_tensor(&raw).expect("frame should be readable");
        assert!(frame.iter().any(|&b| b != 0));
        assert_eq!(pipeline.state(), PipelineState::Finalized);

        // Same graph, corrected payload: the next frame runs to completion.
        pipeline
            .reset_tensor(&value, &fg_core::bytes_from_u16(&[0]))
            .expect("value reset should succeed");
        let report = pipeline
            .execute(&TensorMapping::new(), &mut globals, &mut device)
            .expect("corrected execute should succeed");
        assert_eq!(report.order.len(), 2);
    }

    #[test]
    fn unbound_operand_port_blocks_finalization() {
        let mut pipeline = Pipeline::new();
        let solve = pipeline
            .create_operator(OperatorKind::ComputeAffine, OperatorConfig::None)
            .expect("solve should create");
        let src = pipeline
            .create_tensor(ElementType::F32, ShapeKind::Point, 2, vec![3], None)
            .expect("points should create");
        pipeline.set_operand(solve, "src", &src).expect("bind");

        let mut globals = TensorArena::new();
        let mut device = SoftwareDevice::open(4, 4).expect("device should open");
        let err = pipeline
            .execute(&TensorMapping::new(), &mut globals, &mut device)
            .expect_err("unbound operand must fail");
        assert_eq!(
            err,
            PipelineError::UnboundOperandPort {
                operator: OperatorKind::ComputeAffine,
                port: "dst"
            }
        );
        // The fault is structural: the pipeline stays in Building state.
        assert_eq!(pipeline.state(), PipelineState::Building);
    }

    #[test]
    fn foreign_local_tensor_is_rejected_at_binding() {
        let mut other = Pipeline::new();
        let foreign = other
            .create_tensor(ElementType::F32, ShapeKind::Point, 2, vec![3], None)
            .expect("foreign tensor should create");

        let mut pipeline = Pipeline::new();
        let solve = pipeline
            .create_operator(OperatorKind::ComputeAffine, OperatorConfig::None)
            .expect("solve should create");
        let err = pipeline
            .set_operand(solve, "src", &foreign)
            .expect_err("foreign local tensor must fail");
        assert_eq!(err, PipelineError::ForeignTensor { id: foreign.id() });
    }

    #[test]
    fn mapping_rejects_contract_mismatch_and_non_placeholders() {
        let mut pipeline = Pipeline::new();
        let reference = pipeline
            .create_tensor_reference(ElementType::U8, ShapeKind::Matrix, 3, vec![CROP, CROP])
            .expect("reference should create");
        let concrete = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Matrix, 3, vec![CROP, CROP], None)
            .expect("concrete should create");
        let wrong_shape = pipeline
            .create_tensor(ElementType::U8, ShapeKind::Matrix, 3, vec![CROP, CROP + 1], None)
            .expect("odd tensor should create");

        let mut mapping = TensorMapping::new();
        let err = mapping
            .bind(&concrete, &wrong_shape)
            .expect_err("concrete source must fail");
        assert_eq!(err, MappingError::NotAPlaceholder { id: concrete.id() });

        let err = mapping
            .bind(&reference, &wrong_shape)
            .expect_err("contract mismatch must fail");
        assert_eq!(err, MappingError::ContractMismatch { id: reference.id() });

        mapping
            .bind(&reference, &concrete)
            .expect("matching bind should succeed");
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn building_the_same_graph_twice_yields_equivalent_pipelines() {
        let a = crop_pipeline();
        let b = crop_pipeline();
        assert_eq!(a.pipeline.operator_count(), b.pipeline.operator_count());
        for ((_, op_a), (_, op_b)) in a.pipeline.operators().zip(b.pipeline.operators()) {
            assert_eq!(op_a.kind(), op_b.kind());
            let ports_a: Vec<&str> = op_a.operands().map(|(name, _)| name).collect();
            let ports_b: Vec<&str> = op_b.operands().map(|(name, _)| name).collect();
            assert_eq!(ports_a, ports_b);
        }
    }
}
