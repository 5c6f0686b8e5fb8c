#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fg_core::{
    AssetHandle, AssetKind, TensorMeta, bytes_from_f32, bytes_from_u16, f32_from_bytes,
    u16_from_bytes,
};
use fg_ops::{OperatorConfig, OperatorKind, TextRenderConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    Unavailable,
    UnknownAsset { handle: AssetHandle },
    Execution { kind: OperatorKind, reason: String },
}

impl DeviceError {
    fn execution(kind: OperatorKind, reason: impl Into<String>) -> Self {
        Self::Execution {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "device session is not open"),
            Self::UnknownAsset { handle } => {
                write!(f, "asset handle {} is not loaded", handle.raw())
            }
            Self::Execution { kind, reason } => {
                write!(f, "operator '{kind}' failed on device: {reason}")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Snapshot of one operand at execution time. Buffers are copied out of the
/// owning arena so the device never aliases engine storage.
#[derive(Debug, Clone, PartialEq)]
pub enum OperandValue {
    Buffer { meta: TensorMeta, bytes: Vec<u8> },
    Asset(AssetHandle),
}

/// Declared result target: the device must produce a payload matching the
/// slot's meta contract.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSlot {
    pub port: &'static str,
    pub meta: TensorMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kind: OperatorKind,
    pub config: OperatorConfig,
    pub operands: Vec<(&'static str, OperandValue)>,
    pub results: Vec<ResultSlot>,
}

impl Invocation {
    fn buffer(&self, port: &str) -> Result<(&TensorMeta, &[u8]), DeviceError> {
        for (name, value) in &self.operands {
            if *name == port {
                return match value {
                    OperandValue::Buffer { meta, bytes } => Ok((meta, bytes.as_slice())),
                    OperandValue::Asset(_) => Err(DeviceError::execution(
                        self.kind,
                        format!("operand '{port}' is an asset, expected a buffer"),
                    )),
                };
            }
        }
        Err(DeviceError::execution(
            self.kind,
            format!("operand '{port}' is missing"),
        ))
    }

    fn asset(&self, port: &str) -> Result<AssetHandle, DeviceError> {
        for (name, value) in &self.operands {
            if *name == port {
                return match value {
                    OperandValue::Asset(handle) => Ok(*handle),
                    OperandValue::Buffer { .. } => Err(DeviceError::execution(
                        self.kind,
                        format!("operand '{port}' is a buffer, expected an asset"),
                    )),
                };
            }
        }
        Err(DeviceError::execution(
            self.kind,
            format!("operand '{port}' is missing"),
        ))
    }

    fn result_slot(&self, port: &str) -> Option<&ResultSlot> {
        self.results.iter().find(|slot| slot.port == port)
    }
}

/// One result payload produced by the device, keyed by result port.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultWrite {
    pub port: &'static str,
    pub bytes: Vec<u8>,
}

/// The device/session boundary. Capture, rendering, and model mutation all
/// delegate to an implementation of this trait; the engine treats every
/// operator as an opaque blocking call.
pub trait DeviceSession {
    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Hands opaque asset bytes to the device and returns the handle the
    /// engine stores in the owning asset tensor.
    fn load_asset(&mut self, kind: AssetKind, bytes: &[u8]) -> Result<AssetHandle, DeviceError>;

    fn run_operator(&mut self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextDraw {
    pub text: Vec<u8>,
    pub anchor: [f32; 2],
    pub colors: Vec<u8>,
    pub texture_id: u16,
    pub font_size: f32,
    pub config: TextRenderConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureRecord {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

/// Device-side state of one loaded asset.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetState {
    kind: AssetKind,
    byte_len: usize,
    visible: bool,
    world_pose: Option<[f32; 16]>,
    textures: Vec<TextureRecord>,
    materials: BTreeMap<u16, u16>,
    draws: Vec<TextDraw>,
}

impl AssetState {
    #[must_use]
    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    #[must_use]
    pub fn visible(&self) -> bool {
        self.visible
    }

    #[must_use]
    pub fn world_pose(&self) -> Option<&[f32; 16]> {
        self.world_pose.as_ref()
    }

    #[must_use]
    pub fn textures(&self) -> &[TextureRecord] {
        &self.textures
    }

    #[must_use]
    pub fn material(&self, slot: u16) -> Option<u16> {
        self.materials.get(&slot).copied()
    }

    #[must_use]
    pub fn draws(&self) -> &[TextDraw] {
        &self.draws
    }
}

const CAPTURE_CHANNELS: usize = 3;

/// Software stand-in for the XR capture/render session. Implements the whole
/// operator catalog deterministically so pipelines run end to end in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareDevice {
    capture_width: usize,
    capture_height: usize,
    open: bool,
    frame: u64,
    next_asset: u64,
    assets: BTreeMap<AssetHandle, AssetState>,
}

impl SoftwareDevice {
    pub fn open(capture_width: usize, capture_height: usize) -> Result<Self, DeviceError> {
        if capture_width == 0 || capture_height == 0 {
            return Err(DeviceError::Unavailable);
        }
        Ok(Self {
            capture_width,
            capture_height,
            open: true,
            frame: 0,
            next_asset: 1,
            assets: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn capture_width(&self) -> usize {
        self.capture_width
    }

    #[must_use]
    pub fn capture_height(&self) -> usize {
        self.capture_height
    }

    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[must_use]
    pub fn asset(&self, handle: AssetHandle) -> Option<&AssetState> {
        self.assets.get(&handle)
    }

    fn asset_mut(&mut self, handle: AssetHandle) -> Result<&mut AssetState, DeviceError> {
        self.assets
            .get_mut(&handle)
            .ok_or(DeviceError::UnknownAsset { handle })
    }

    fn capture_byte(frame: u64, row: usize, col: usize, channel: usize) -> u8 {
        let mixed = row
            .wrapping_mul(31)
            .wrapping_add(col.wrapping_mul(7))
            .wrapping_add(channel.wrapping_mul(13))
            .wrapping_add(frame as usize);
        (mixed % 256) as u8
    }

    fn run_capture(&mut self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError> {
        let kind = invocation.kind;
        let Some(slot) = invocation.result_slot("left image") else {
            // Unused result ports are legal; capturing into nothing is a no-op.
            self.frame = self.frame.wrapping_add(1);
            return Ok(Vec::new());
        };

        let dims = slot.meta.dims();
        if dims != [self.capture_height, self.capture_width]
            || slot.meta.channels() != CAPTURE_CHANNELS
        {
            return Err(DeviceError::execution(
                kind,
                format!(
                    "capture target {dims:?}x{} does not match session {}x{}x{CAPTURE_CHANNELS}",
                    slot.meta.channels(),
                    self.capture_height,
                    self.capture_width
                ),
            ));
        }

        let frame = self.frame;
        let mut bytes = Vec::with_capacity(self.capture_height * self.capture_width * CAPTURE_CHANNELS);
        for row in 0..self.capture_height {
            for col in 0..self.capture_width {
                for channel in 0..CAPTURE_CHANNELS {
                    bytes.push(Self::capture_byte(frame, row, col, channel));
                }
            }
        }
        self.frame = self.frame.wrapping_add(1);
        Ok(vec![ResultWrite {
            port: "left image",
            bytes,
        }])
    }

    fn run_compute_affine(&self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError> {
        let kind = invocation.kind;
        let (_, src_bytes) = invocation.buffer("src")?;
        let (_, dst_bytes) = invocation.buffer("dst")?;
        let src = f32_from_bytes(src_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        let dst = f32_from_bytes(dst_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        if src.len() != 6 || dst.len() != 6 {
            return Err(DeviceError::execution(
                kind,
                "affine solve requires exactly three 2d point correspondences",
            ));
        }

        let matrix = solve_affine(&src, &dst).ok_or_else(|| {
            DeviceError::execution(kind, "source points are collinear, affine is underdetermined")
        })?;

        if invocation.result_slot("result").is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![ResultWrite {
            port: "result",
            bytes: bytes_from_f32(&matrix),
        }])
    }

    fn run_apply_affine(&self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError> {
        let kind = invocation.kind;
        let (_, affine_bytes) = invocation.buffer("affine")?;
        let (src_meta, src_bytes) = invocation.buffer("src image")?;
        let affine = f32_from_bytes(affine_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        if affine.len() != 6 {
            return Err(DeviceError::execution(
                kind,
                "affine operand must hold a 2x3 matrix",
            ));
        }

        let Some(slot) = invocation.result_slot("dst image") else {
            return Ok(Vec::new());
        };
        let src_dims = src_meta.dims();
        let dst_dims = slot.meta.dims();
        if src_dims.len() != 2 || dst_dims.len() != 2 {
            return Err(DeviceError::execution(kind, "images must be rank-2 matrices"));
        }
        let channels = src_meta.channels();
        if slot.meta.channels() != channels {
            return Err(DeviceError::execution(
                kind,
                format!(
                    "channel mismatch: source has {channels}, destination has {}",
                    slot.meta.channels()
                ),
            ));
        }

        let (src_h, src_w) = (src_dims[0], src_dims[1]);
        let (dst_h, dst_w) = (dst_dims[0], dst_dims[1]);
        let inverse = invert_affine(&affine)
            .ok_or_else(|| DeviceError::execution(kind, "affine matrix is singular"))?;

        // Inverse mapping with nearest-neighbor sampling; out-of-bounds reads
        // produce zeroed pixels.
        let mut bytes = vec![0u8; dst_h * dst_w * channels];
        for row in 0..dst_h {
            for col in 0..dst_w {
                let x = col as f32;
                let y = row as f32;
                let sx = inverse[0] * x + inverse[1] * y + inverse[2];
                let sy = inverse[3] * x + inverse[4] * y + inverse[5];
                let sc = sx.round();
                let sr = sy.round();
                if sc < 0.0 || sr < 0.0 {
                    continue;
                }
                let (sc, sr) = (sc as usize, sr as usize);
                if sc >= src_w || sr >= src_h {
                    continue;
                }
                let src_base = (sr * src_w + sc) * channels;
                let dst_base = (row * dst_w + col) * channels;
                bytes[dst_base..dst_base + channels]
                    .copy_from_slice(&src_bytes[src_base..src_base + channels]);
            }
        }
        Ok(vec![ResultWrite {
            port: "dst image",
            bytes,
        }])
    }

    fn run_render_text(&mut self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError> {
        let kind = invocation.kind;
        let OperatorConfig::TextRender(config) = &invocation.config else {
            return Err(DeviceError::execution(
                kind,
                "render_text requires a text-render configuration",
            ));
        };
        let config = config.clone();

        let (_, text) = invocation.buffer("text")?;
        let (_, start_bytes) = invocation.buffer("start")?;
        let (_, colors) = invocation.buffer("colors")?;
        let (_, texture_bytes) = invocation.buffer("texture ID")?;
        let (_, font_bytes) = invocation.buffer("font size")?;
        let start = f32_from_bytes(start_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        let texture_ids = u16_from_bytes(texture_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        let font_sizes = f32_from_bytes(font_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        if start.len() < 2 || texture_ids.is_empty() || font_sizes.is_empty() {
            return Err(DeviceError::execution(kind, "text draw operands are undersized"));
        }

        let draw = TextDraw {
            text: text.to_vec(),
            anchor: [start[0], start[1]],
            colors: colors.to_vec(),
            texture_id: texture_ids[0],
            font_size: font_sizes[0],
            config,
        };
        let handle = invocation.asset("gltf")?;
        self.asset_mut(handle)?.draws.push(draw);
        Ok(Vec::new())
    }

    fn run_switch_render_status(
        &mut self,
        invocation: &Invocation,
    ) -> Result<Vec<ResultWrite>, DeviceError> {
        let kind = invocation.kind;
        let handle = invocation.asset("gltf")?;
        let (_, pose_bytes) = invocation.buffer("world pose")?;
        let pose = f32_from_bytes(pose_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        if pose.len() != 16 {
            return Err(DeviceError::execution(kind, "world pose must be a 4x4 matrix"));
        }
        let mut fixed = [0f32; 16];
        fixed.copy_from_slice(&pose);

        let asset = self.asset_mut(handle)?;
        asset.visible = true;
        asset.world_pose = Some(fixed);
        Ok(Vec::new())
    }

    fn run_load_texture(&mut self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError> {
        let kind = invocation.kind;
        let (image_meta, _) = invocation.buffer("rgb image")?;
        let dims = image_meta.dims();
        if dims.len() != 2 {
            return Err(DeviceError::execution(kind, "texture source must be a rank-2 image"));
        }
        let record = TextureRecord {
            height: dims[0],
            width: dims[1],
            channels: image_meta.channels(),
        };

        let handle = invocation.asset("gltf")?;
        let asset = self.asset_mut(handle)?;
        asset.textures.push(record);
        let index = (asset.textures.len() - 1) as u16;

        if invocation.result_slot("texture ID").is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![ResultWrite {
            port: "texture ID",
            bytes: bytes_from_u16(&[index]),
        }])
    }

    fn run_update_model(&mut self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError> {
        let kind = invocation.kind;
        let handle = invocation.asset("gltf")?;
        let (_, material_bytes) = invocation.buffer("material ID")?;
        let (_, value_bytes) = invocation.buffer("value")?;
        let materials = u16_from_bytes(material_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        let values = u16_from_bytes(value_bytes)
            .map_err(|error| DeviceError::execution(kind, error.to_string()))?;
        let (Some(slot), Some(value)) = (materials.first(), values.first()) else {
            return Err(DeviceError::execution(kind, "material update operands are empty"));
        };

        let asset = self.asset_mut(handle)?;
        if usize::from(*value) > asset.textures.len() {
            return Err(DeviceError::execution(
                kind,
                format!("texture index {value} is not loaded on this asset"),
            ));
        }
        asset.materials.insert(*slot, *value);
        Ok(Vec::new())
    }
}

impl DeviceSession for SoftwareDevice {
    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
        self.assets.clear();
    }

    fn load_asset(&mut self, kind: AssetKind, bytes: &[u8]) -> Result<AssetHandle, DeviceError> {
        if !self.open {
            return Err(DeviceError::Unavailable);
        }
        let handle = AssetHandle::new(self.next_asset);
        self.next_asset += 1;
        self.assets.insert(
            handle,
            AssetState {
                kind,
                byte_len: bytes.len(),
                visible: false,
                world_pose: None,
                textures: Vec::new(),
                materials: BTreeMap::new(),
                draws: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn run_operator(&mut self, invocation: &Invocation) -> Result<Vec<ResultWrite>, DeviceError> {
        if !self.open {
            return Err(DeviceError::Unavailable);
        }
        match invocation.kind {
            OperatorKind::CaptureAccess => self.run_capture(invocation),
            OperatorKind::ComputeAffine => self.run_compute_affine(invocation),
            OperatorKind::ApplyAffine => self.run_apply_affine(invocation),
            OperatorKind::RenderText => self.run_render_text(invocation),
            OperatorKind::SwitchRenderStatus => self.run_switch_render_status(invocation),
            OperatorKind::LoadTexture => self.run_load_texture(invocation),
            OperatorKind::UpdateModel => self.run_update_model(invocation),
        }
    }
}

/// Solves the 2x3 affine matrix mapping three source points onto three
/// destination points. Points are packed `[x0, y0, x1, y1, x2, y2]`.
fn solve_affine(src: &[f32], dst: &[f32]) -> Option<[f32; 6]> {
    // Row-major 3x3 system matrix [[x0 y0 1], [x1 y1 1], [x2 y2 1]].
    let s = [
        src[0], src[1], 1.0, src[2], src[3], 1.0, src[4], src[5], 1.0,
    ];
    let inverse = invert_3x3(&s)?;

    let mut out = [0f32; 6];
    for row in 0..2 {
        let rhs = [dst[row], dst[2 + row], dst[4 + row]];
        for col in 0..3 {
            out[row * 3 + col] = inverse[col * 3] * rhs[0]
                + inverse[col * 3 + 1] * rhs[1]
                + inverse[col * 3 + 2] * rhs[2];
        }
    }
    Some(out)
}

fn invert_3x3(m: &[f32; 9]) -> Option<[f32; 9]> {
    let det = m[0] * (m[4] * m[8] - m[5] * m[7]) - m[1] * (m[3] * m[8] - m[5] * m[6])
        + m[2] * (m[3] * m[7] - m[4] * m[6]);
    if det.abs() < 1e-6 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        (m[4] * m[8] - m[5] * m[7]) * inv_det,
        (m[2] * m[7] - m[1] * m[8]) * inv_det,
        (m[1] * m[5] - m[2] * m[4]) * inv_det,
        (m[5] * m[6] - m[3] * m[8]) * inv_det,
        (m[0] * m[8] - m[2] * m[6]) * inv_det,
        (m[2] * m[3] - m[0] * m[5]) * inv_det,
        (m[3] * m[7] - m[4] * m[6]) * inv_det,
        (m[1] * m[6] - m[0] * m[7]) * inv_det,
        (m[0] * m[4] - m[1] * m[3]) * inv_det,
    ])
}

/// Inverts a 2x3 affine `[a b c; d e f]` for inverse-mapped sampling.
fn invert_affine(m: &[f32]) -> Option<[f32; 6]> {
    let det = m[0] * m[4] - m[1] * m[3];
    if det.abs() < 1e-6 {
        return None;
    }
    let inv_det = 1.0 / det;
    let a = m[4] * inv_det;
    let b = -m[1] * inv_det;
    let d = -m[3] * inv_det;
    let e = m[0] * inv_det;
    Some([a, b, -(a * m[2] + b * m[5]), d, e, -(d * m[2] + e * m[5])])
}
