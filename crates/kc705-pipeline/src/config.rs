//! Layer and model configuration.
//!
//! Configurations are built once, validated at assembly time, and never
//! mutated afterward. Every channel or shape mismatch between consecutive
//! layers surfaces as [`PipelineError::Configuration`] before any sample is
//! processed.

use crate::activation::Activation;
use crate::conv::ConvGeometry;
use crate::error::{PipelineError, Result};
use crate::fixed::QFormat;
use crate::frame::FrameShape;

/// Default tokens buffered per inter-stage link.
pub const DEFAULT_LINK_CAPACITY: usize = 16;

/// Default multiply-accumulate units per convolution engine.
pub const DEFAULT_COMPUTE_UNITS: usize = 8;

// ── Plain convolution (stem, head) ───────────────────────────────────────────

/// A standard convolution followed by normalization and an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvConfig {
    input_channels: usize,
    output_channels: usize,
    kernel_size: usize,
    stride: usize,
    activation: Activation,
}

impl ConvConfig {
    /// `input → output` channels, `K×K` kernel, `padding = K / 2`.
    pub const fn new(
        input_channels: usize,
        output_channels: usize,
        kernel_size: usize,
        stride: usize,
        activation: Activation,
    ) -> Self {
        Self {
            input_channels,
            output_channels,
            kernel_size,
            stride,
            activation,
        }
    }

    /// Input channels.
    pub const fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Output channels.
    pub const fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Kernel side.
    pub const fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Activation after normalization.
    pub const fn activation(&self) -> Activation {
        self.activation
    }

    /// Kernel, stride and padding.
    pub const fn geometry(&self) -> ConvGeometry {
        ConvGeometry::same(self.kernel_size, self.stride)
    }

    /// Kernel coefficients.
    pub const fn kernel_len(&self) -> usize {
        self.output_channels * self.input_channels * self.kernel_size * self.kernel_size
    }
}

// ── Inverted-residual block ──────────────────────────────────────────────────

/// Descriptor of one inverted-residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfig {
    input_channels: usize,
    expanded_channels: usize,
    output_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    se_reduction: Option<usize>,
    use_hswish: bool,
}

impl LayerConfig {
    /// A block without attention, using ReLU6, with `padding = K / 2`.
    pub const fn new(
        input_channels: usize,
        expanded_channels: usize,
        output_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Self {
        Self {
            input_channels,
            expanded_channels,
            output_channels,
            kernel_size,
            stride,
            padding: kernel_size / 2,
            se_reduction: None,
            use_hswish: false,
        }
    }

    /// Enable squeeze-and-excitation with the given reduction ratio.
    #[must_use]
    pub const fn with_se(mut self, reduction: usize) -> Self {
        self.se_reduction = Some(reduction);
        self
    }

    /// Use h-swish instead of ReLU6.
    #[must_use]
    pub const fn with_hswish(mut self) -> Self {
        self.use_hswish = true;
        self
    }

    /// Override the depthwise padding.
    #[must_use]
    pub const fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Input channels.
    pub const fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Channels after expansion.
    pub const fn expanded_channels(&self) -> usize {
        self.expanded_channels
    }

    /// Output channels.
    pub const fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Depthwise kernel side.
    pub const fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Depthwise stride.
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Depthwise zero padding.
    pub const fn padding(&self) -> usize {
        self.padding
    }

    /// `expanded / input`.
    #[allow(clippy::cast_precision_loss)]
    pub fn expansion_ratio(&self) -> f32 {
        self.expanded_channels as f32 / self.input_channels.max(1) as f32
    }

    /// True if the block carries a squeeze-and-excitation stage.
    pub const fn use_se(&self) -> bool {
        self.se_reduction.is_some()
    }

    /// Reduction ratio of the attention stage, if present.
    pub const fn se_reduction(&self) -> Option<usize> {
        self.se_reduction
    }

    /// Hidden width of the attention stage.
    pub fn se_channels(&self) -> usize {
        self.se_reduction
            .map_or(0, |r| (self.expanded_channels / r.max(1)).max(1))
    }

    /// True if h-swish replaces ReLU6.
    pub const fn use_hswish(&self) -> bool {
        self.use_hswish
    }

    /// Activation after the expansion and depthwise normalizations.
    pub const fn activation(&self) -> Activation {
        if self.use_hswish {
            Activation::HSwish
        } else {
            Activation::Relu6
        }
    }

    /// Depthwise geometry.
    pub const fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            kernel: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
        }
    }

    /// True if the block adds its input to its output.
    pub const fn has_residual(&self) -> bool {
        self.input_channels == self.output_channels && self.stride == 1
    }

    /// Shape produced from an input of `input` shape.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a channel mismatch or an impossible
    /// geometry.
    pub fn output_shape(&self, input: FrameShape) -> Result<FrameShape> {
        if input.channels != self.input_channels {
            return Err(PipelineError::configuration(format!(
                "block expects {} input channels, receives {}",
                self.input_channels, input.channels
            )));
        }
        if self.input_channels == 0 || self.expanded_channels == 0 || self.output_channels == 0 {
            return Err(PipelineError::configuration("channel counts must be positive"));
        }
        if self.se_reduction == Some(0) {
            return Err(PipelineError::configuration("reduction ratio must be positive"));
        }
        let g = self.geometry();
        Ok(FrameShape::new(
            self.output_channels,
            g.output_extent(input.height)?,
            g.output_extent(input.width)?,
        ))
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

/// Complete classifier description.
///
/// ```text
/// input ─▶ stem conv ─▶ block 0 ─▶ ... ─▶ block N-1 ─▶ head conv ─▶ pool ─▶ classifier
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    input: FrameShape,
    activation_format: QFormat,
    weight_format: QFormat,
    stem: ConvConfig,
    blocks: Vec<LayerConfig>,
    head: ConvConfig,
    num_classes: usize,
    se_gate: Activation,
    compute_units: usize,
    link_capacity: usize,
}

impl ModelConfig {
    /// A model with Q8.8 activations, Q2.6 weights and hard-sigmoid gating.
    pub fn new(
        input: FrameShape,
        stem: ConvConfig,
        blocks: Vec<LayerConfig>,
        head: ConvConfig,
        num_classes: usize,
    ) -> Self {
        Self {
            input,
            activation_format: QFormat::Q8_8,
            weight_format: QFormat::Q2_6,
            stem,
            blocks,
            head,
            num_classes,
            se_gate: Activation::HardSigmoid,
            compute_units: DEFAULT_COMPUTE_UNITS,
            link_capacity: DEFAULT_LINK_CAPACITY,
        }
    }

    /// MobileNetV3-Small on a 224×224×3 input.
    pub fn mobilenet_v3_small(num_classes: usize) -> Self {
        let re = |i, e, o, k, s| LayerConfig::new(i, e, o, k, s);
        let hs = |i, e, o, k, s| LayerConfig::new(i, e, o, k, s).with_hswish();
        let blocks = vec![
            re(16, 16, 16, 3, 2).with_se(4),
            re(16, 72, 24, 3, 2),
            re(24, 88, 24, 3, 1),
            hs(24, 96, 40, 5, 2).with_se(4),
            hs(40, 240, 40, 5, 1).with_se(4),
            hs(40, 240, 40, 5, 1).with_se(4),
            hs(40, 120, 48, 5, 1).with_se(4),
            hs(48, 144, 48, 5, 1).with_se(4),
            hs(48, 288, 96, 5, 2).with_se(4),
            hs(96, 576, 96, 5, 1).with_se(4),
            hs(96, 576, 96, 5, 1).with_se(4),
        ];
        Self::new(
            FrameShape::new(3, 224, 224),
            ConvConfig::new(3, 16, 3, 2, Activation::HSwish),
            blocks,
            ConvConfig::new(96, 576, 1, 1, Activation::HSwish),
            num_classes,
        )
    }

    /// MobileNetV3-Large on a 224×224×3 input.
    pub fn mobilenet_v3_large(num_classes: usize) -> Self {
        let re = |i, e, o, k, s| LayerConfig::new(i, e, o, k, s);
        let hs = |i, e, o, k, s| LayerConfig::new(i, e, o, k, s).with_hswish();
        let blocks = vec![
            re(16, 16, 16, 3, 1),
            re(16, 64, 24, 3, 2),
            re(24, 72, 24, 3, 1),
            re(24, 72, 40, 5, 2).with_se(4),
            re(40, 120, 40, 5, 1).with_se(4),
            re(40, 120, 40, 5, 1).with_se(4),
            hs(40, 240, 80, 3, 2),
            hs(80, 200, 80, 3, 1),
            hs(80, 184, 80, 3, 1),
            hs(80, 184, 80, 3, 1),
            hs(80, 480, 112, 3, 1).with_se(4),
            hs(112, 672, 112, 3, 1).with_se(4),
            hs(112, 672, 160, 5, 2).with_se(4),
            hs(160, 960, 160, 5, 1).with_se(4),
            hs(160, 960, 160, 5, 1).with_se(4),
        ];
        Self::new(
            FrameShape::new(3, 224, 224),
            ConvConfig::new(3, 16, 3, 2, Activation::HSwish),
            blocks,
            ConvConfig::new(160, 960, 1, 1, Activation::HSwish),
            num_classes,
        )
    }

    /// A two-block model on a 16×16×3 input, for tests and demos.
    pub fn tiny(num_classes: usize) -> Self {
        Self::new(
            FrameShape::new(3, 16, 16),
            ConvConfig::new(3, 8, 3, 2, Activation::HSwish),
            vec![
                LayerConfig::new(8, 16, 8, 3, 1).with_se(4),
                LayerConfig::new(8, 24, 12, 3, 2).with_hswish(),
            ],
            ConvConfig::new(12, 32, 1, 1, Activation::HSwish),
            num_classes,
        )
    }

    /// Override the activation and weight formats.
    #[must_use]
    pub fn with_formats(mut self, activation: QFormat, weight: QFormat) -> Self {
        self.activation_format = activation;
        self.weight_format = weight;
        self
    }

    /// Override the gating nonlinearity of attention stages.
    #[must_use]
    pub fn with_se_gate(mut self, gate: Activation) -> Self {
        self.se_gate = gate;
        self
    }

    /// Override the MAC units per engine.
    #[must_use]
    pub fn with_compute_units(mut self, units: usize) -> Self {
        self.compute_units = units;
        self
    }

    /// Override the per-link token capacity.
    #[must_use]
    pub fn with_link_capacity(mut self, capacity: usize) -> Self {
        self.link_capacity = capacity;
        self
    }

    /// Input frame shape.
    pub const fn input(&self) -> FrameShape {
        self.input
    }

    /// Activation format.
    pub const fn activation_format(&self) -> QFormat {
        self.activation_format
    }

    /// Weight format.
    pub const fn weight_format(&self) -> QFormat {
        self.weight_format
    }

    /// Stem convolution.
    pub const fn stem(&self) -> &ConvConfig {
        &self.stem
    }

    /// Inverted-residual blocks, in order.
    pub fn blocks(&self) -> &[LayerConfig] {
        &self.blocks
    }

    /// Head convolution.
    pub const fn head(&self) -> &ConvConfig {
        &self.head
    }

    /// Output classes.
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Attention gate.
    pub const fn se_gate(&self) -> Activation {
        self.se_gate
    }

    /// MAC units per engine.
    pub const fn compute_units(&self) -> usize {
        self.compute_units
    }

    /// Tokens per link.
    pub const fn link_capacity(&self) -> usize {
        self.link_capacity
    }

    /// Shapes between layers: after the stem, after each block, after the head.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn feature_shapes(&self) -> Result<Vec<FrameShape>> {
        let mut shapes = Vec::with_capacity(self.blocks.len() + 2);
        let stem = conv_output(&self.stem, self.input, "stem")?;
        shapes.push(stem);
        let mut current = stem;
        for (i, block) in self.blocks.iter().enumerate() {
            current = block.output_shape(current).map_err(|e| match e {
                PipelineError::Configuration { reason } => {
                    PipelineError::configuration(format!("block {i}: {reason}"))
                }
                other => other,
            })?;
            shapes.push(current);
        }
        shapes.push(conv_output(&self.head, current, "head")?);
        Ok(shapes)
    }

    /// Check the whole chain.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on any channel or shape mismatch, an
    /// empty classifier, or a zero-sized resource.
    pub fn validate(&self) -> Result<()> {
        QFormat::new(self.activation_format.total_bits(), self.activation_format.frac_bits())?;
        QFormat::new(self.weight_format.total_bits(), self.weight_format.frac_bits())?;
        if self.num_classes == 0 {
            return Err(PipelineError::configuration("classifier needs at least one class"));
        }
        if self.compute_units == 0 || self.link_capacity == 0 {
            return Err(PipelineError::configuration(
                "compute units and link capacity must be positive",
            ));
        }
        if !matches!(self.se_gate, Activation::HardSigmoid | Activation::Sigmoid) {
            return Err(PipelineError::configuration(format!(
                "{} is not a gating function",
                self.se_gate.name()
            )));
        }
        self.feature_shapes().map(|_| ())
    }
}

fn conv_output(conv: &ConvConfig, input: FrameShape, what: &str) -> Result<FrameShape> {
    if input.channels != conv.input_channels {
        return Err(PipelineError::configuration(format!(
            "{what} expects {} input channels, receives {}",
            conv.input_channels, input.channels
        )));
    }
    if conv.output_channels == 0 {
        return Err(PipelineError::configuration(format!("{what} has no output channels")));
    }
    let g = conv.geometry();
    Ok(FrameShape::new(
        conv.output_channels,
        g.output_extent(input.height)?,
        g.output_extent(input.width)?,
    ))
}
