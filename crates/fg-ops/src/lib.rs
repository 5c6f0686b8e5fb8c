#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fg_core::{AssetKind, ElementType, ShapeKind, Tensor};

/// Closed catalog of operator kinds. Each kind is an opaque transformation
/// owned by the device layer; the engine knows only its port contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    /// Reads the live rectified capture frame; no operands.
    CaptureAccess,
    /// Solves a 2x3 affine matrix from three point correspondences.
    ComputeAffine,
    /// Warps a source image through an affine matrix.
    ApplyAffine,
    /// Draws text onto a model asset's canvas; mutates the asset in place.
    RenderText,
    /// Toggles a model asset's visibility and world pose.
    SwitchRenderStatus,
    /// Registers an RGB image as a texture on a model asset.
    LoadTexture,
    /// Points a model material slot at a texture index.
    UpdateModel,
}

impl OperatorKind {
    #[must_use]
    pub const fn all() -> &'static [OperatorKind] {
        &[
            OperatorKind::CaptureAccess,
            OperatorKind::ComputeAffine,
            OperatorKind::ApplyAffine,
            OperatorKind::RenderText,
            OperatorKind::SwitchRenderStatus,
            OperatorKind::LoadTexture,
            OperatorKind::UpdateModel,
        ]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CaptureAccess => "capture_access",
            Self::ComputeAffine => "compute_affine",
            Self::ApplyAffine => "apply_affine",
            Self::RenderText => "render_text",
            Self::SwitchRenderStatus => "switch_render_status",
            Self::LoadTexture => "load_texture",
            Self::UpdateModel => "update_model",
        }
    }

    #[must_use]
    pub const fn operand_ports(self) -> &'static [PortDecl] {
        match self {
            Self::CaptureAccess => &[],
            Self::ComputeAffine => COMPUTE_AFFINE_OPERANDS,
            Self::ApplyAffine => APPLY_AFFINE_OPERANDS,
            Self::RenderText => RENDER_TEXT_OPERANDS,
            Self::SwitchRenderStatus => SWITCH_RENDER_STATUS_OPERANDS,
            Self::LoadTexture => LOAD_TEXTURE_OPERANDS,
            Self::UpdateModel => UPDATE_MODEL_OPERANDS,
        }
    }

    #[must_use]
    pub const fn result_ports(self) -> &'static [PortDecl] {
        match self {
            Self::CaptureAccess => CAPTURE_ACCESS_RESULTS,
            Self::ComputeAffine => COMPUTE_AFFINE_RESULTS,
            Self::ApplyAffine => APPLY_AFFINE_RESULTS,
            Self::RenderText | Self::SwitchRenderStatus | Self::UpdateModel => &[],
            Self::LoadTexture => LOAD_TEXTURE_RESULTS,
        }
    }

    pub fn operand_decl(self, port: &str) -> Result<&'static PortDecl, PortBindingError> {
        self.operand_ports()
            .iter()
            .find(|decl| decl.name == port)
            .ok_or_else(|| PortBindingError::UnknownPort {
                kind: self,
                port: port.to_string(),
            })
    }

    pub fn result_decl(self, port: &str) -> Result<&'static PortDecl, PortBindingError> {
        self.result_ports()
            .iter()
            .find(|decl| decl.name == port)
            .ok_or_else(|| PortBindingError::UnknownPort {
                kind: self,
                port: port.to_string(),
            })
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const COMPUTE_AFFINE_OPERANDS: &[PortDecl] = &[
    PortDecl::value("src", ElementType::F32, ShapeKind::Point),
    PortDecl::value("dst", ElementType::F32, ShapeKind::Point),
];

const APPLY_AFFINE_OPERANDS: &[PortDecl] = &[
    PortDecl::value("affine", ElementType::F32, ShapeKind::Matrix),
    PortDecl::value("src image", ElementType::U8, ShapeKind::Matrix),
];

const RENDER_TEXT_OPERANDS: &[PortDecl] = &[
    PortDecl::value("text", ElementType::I8, ShapeKind::Scalar),
    PortDecl::value("start", ElementType::F32, ShapeKind::Point),
    PortDecl::value("colors", ElementType::U8, ShapeKind::Color),
    PortDecl::value("texture ID", ElementType::U16, ShapeKind::Scalar),
    PortDecl::value("font size", ElementType::F32, ShapeKind::Scalar),
    PortDecl::asset("gltf", AssetKind::Model3d),
];

const SWITCH_RENDER_STATUS_OPERANDS: &[PortDecl] = &[
    PortDecl::asset("gltf", AssetKind::Model3d),
    PortDecl::value("world pose", ElementType::F32, ShapeKind::Matrix),
];

const LOAD_TEXTURE_OPERANDS: &[PortDecl] = &[
    PortDecl::value("rgb image", ElementType::U8, ShapeKind::Matrix),
    PortDecl::asset("gltf", AssetKind::Model3d),
];

const UPDATE_MODEL_OPERANDS: &[PortDecl] = &[
    PortDecl::asset("gltf", AssetKind::Model3d),
    PortDecl::value("material ID", ElementType::U16, ShapeKind::Scalar),
    PortDecl::value("value", ElementType::U16, ShapeKind::Scalar),
];

const CAPTURE_ACCESS_RESULTS: &[PortDecl] =
    &[PortDecl::value("left image", ElementType::U8, ShapeKind::Matrix)];

const COMPUTE_AFFINE_RESULTS: &[PortDecl] =
    &[PortDecl::value("result", ElementType::F32, ShapeKind::Matrix)];

const APPLY_AFFINE_RESULTS: &[PortDecl] =
    &[PortDecl::value("dst image", ElementType::U8, ShapeKind::Matrix)];

const LOAD_TEXTURE_RESULTS: &[PortDecl] =
    &[PortDecl::value("texture ID", ElementType::U16, ShapeKind::Scalar)];

/// Required element type and shape kind for a port. Declared statically per
/// operator kind; bindings are checked against it at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortContract {
    pub element: ElementType,
    pub shape: ShapeKind,
}

impl PortContract {
    #[must_use]
    pub fn accepts(&self, tensor: &Tensor) -> bool {
        tensor.meta().element() == self.element && tensor.meta().shape() == self.shape
    }
}

impl fmt::Display for PortContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.element, self.shape)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDecl {
    pub name: &'static str,
    pub contract: PortContract,
}

impl PortDecl {
    const fn value(name: &'static str, element: ElementType, shape: ShapeKind) -> Self {
        Self {
            name,
            contract: PortContract { element, shape },
        }
    }

    const fn asset(name: &'static str, kind: AssetKind) -> Self {
        Self {
            name,
            contract: PortContract {
                element: ElementType::Blob,
                shape: ShapeKind::Asset(kind),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Typeface {
    SansSerif,
    Serif,
    Monospace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextRenderConfig {
    pub typeface: Typeface,
    pub locale: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

impl TextRenderConfig {
    #[must_use]
    pub fn new(typeface: Typeface, locale: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            typeface,
            locale: locale.into(),
            canvas_width: width,
            canvas_height: height,
        }
    }
}

/// Kind-specific configuration record. Presence and well-formedness are judged
/// by the device at execution; construction stays pure graph assembly.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OperatorConfig {
    #[default]
    None,
    TextRender(TextRenderConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortBindingError {
    UnknownPort {
        kind: OperatorKind,
        port: String,
    },
    PortTypeMismatch {
        port: &'static str,
        expected: PortContract,
        found_element: ElementType,
        found_shape: ShapeKind,
    },
    PortAlreadyBound {
        port: &'static str,
    },
}

impl fmt::Display for PortBindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPort { kind, port } => {
                write!(f, "operator '{kind}' declares no port named '{port}'")
            }
            Self::PortTypeMismatch {
                port,
                expected,
                found_element,
                found_shape,
            } => write!(
                f,
                "port '{port}' requires {expected}, got {found_element:?}/{found_shape:?}"
            ),
            Self::PortAlreadyBound { port } => {
                write!(f, "port '{port}' is already bound")
            }
        }
    }
}

impl std::error::Error for PortBindingError {}

/// A processing node: kind, configuration, and its operand/result bindings.
/// Bindings are append-only; between frames only the bound tensors' payloads
/// change, never the bindings themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    kind: OperatorKind,
    config: OperatorConfig,
    operands: BTreeMap<&'static str, Tensor>,
    results: BTreeMap<&'static str, Tensor>,
}

impl Operator {
    #[must_use]
    pub fn new(kind: OperatorKind, config: OperatorConfig) -> Self {
        Self {
            kind,
            config,
            operands: BTreeMap::new(),
            results: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    #[must_use]
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn bind_operand(&mut self, port: &str, tensor: &Tensor) -> Result<(), PortBindingError> {
        let decl = self.kind.operand_decl(port)?;
        Self::check_contract(decl, tensor)?;
        if self.operands.contains_key(decl.name) {
            return Err(PortBindingError::PortAlreadyBound { port: decl.name });
        }
        self.operands.insert(decl.name, tensor.clone());
        Ok(())
    }

    pub fn bind_result(&mut self, port: &str, tensor: &Tensor) -> Result<(), PortBindingError> {
        let decl = self.kind.result_decl(port)?;
        Self::check_contract(decl, tensor)?;
        if self.results.contains_key(decl.name) {
            return Err(PortBindingError::PortAlreadyBound { port: decl.name });
        }
        self.results.insert(decl.name, tensor.clone());
        Ok(())
    }

    fn check_contract(decl: &PortDecl, tensor: &Tensor) -> Result<(), PortBindingError> {
        if decl.contract.accepts(tensor) {
            Ok(())
        } else {
            Err(PortBindingError::PortTypeMismatch {
                port: decl.name,
                expected: decl.contract,
                found_element: tensor.meta().element(),
                found_shape: tensor.meta().shape(),
            })
        }
    }

    pub fn operands(&self) -> impl Iterator<Item = (&'static str, &Tensor)> + '_ {
        self.operands.iter().map(|(name, tensor)| (*name, tensor))
    }

    pub fn results(&self) -> impl Iterator<Item = (&'static str, &Tensor)> + '_ {
        self.results.iter().map(|(name, tensor)| (*name, tensor))
    }

    #[must_use]
    pub fn operand(&self, port: &str) -> Option<&Tensor> {
        self.operands.get(port)
    }

    #[must_use]
    pub fn result(&self, port: &str) -> Option<&Tensor> {
        self.results.get(port)
    }

    /// First operand port declared by the kind but not yet bound, if any.
    /// Every operand port must be bound before the pipeline finalizes; unused
    /// result ports may stay unbound.
    #[must_use]
    pub fn missing_operand(&self) -> Option<&'static str> {
        self.kind
            .operand_ports()
            .iter()
            .find(|decl| !self.operands.contains_key(decl.name))
            .map(|decl| decl.name)
    }
}
