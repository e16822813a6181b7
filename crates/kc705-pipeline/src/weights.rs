//! Per-layer weight sets and their packed binary form.
//!
//! Kernels and normalization scales are stored in the model's weight format;
//! normalization shifts and linear biases in the activation format. Each
//! array is reference-counted so stages built for one inference share the
//! installed coefficients without copying.
//!
//! # Packed layout
//!
//! All integers little-endian.
//!
//! ```text
//! header   magic "K7WT" | version u16 | reserved u16 | layer count u32
//! layer    kind u8 | flags u8 | reserved u16 | arrays...
//! array    length u32 | length × i32
//! ```
//!
//! | Kind | Arrays |
//! |------|--------|
//! | 0 stem, 2 head | kernel, scale, shift |
//! | 1 block | expand (3), depthwise (3), [SE reduce w, b, expand w, b], project (3) |
//! | 3 classifier | weights, bias |
//!
//! Flag bit 0 on a block marks the optional attention arrays.

use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use crate::fixed::QFormat;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Magic bytes opening a packed weight blob.
pub const MAGIC: [u8; 4] = *b"K7WT";

/// Packed format version.
pub const VERSION: u16 = 1;

const KIND_STEM: u8 = 0;
const KIND_BLOCK: u8 = 1;
const KIND_HEAD: u8 = 2;
const KIND_CLASSIFIER: u8 = 3;
const FLAG_SE: u8 = 1 << 0;

// ── Weight sets ──────────────────────────────────────────────────────────────

/// Folded batch normalization: `y = x · scale[c] + shift[c]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineParams {
    /// Per-channel scale, weight format.
    pub scale: Vec<i32>,
    /// Per-channel shift, activation format.
    pub shift: Vec<i32>,
}

impl AffineParams {
    /// `scale = 1`, `shift = 0` on every channel.
    pub fn identity(channels: usize, weight_format: QFormat) -> Self {
        Self {
            scale: vec![weight_format.one(); channels],
            shift: vec![0; channels],
        }
    }

    /// Channel count.
    pub fn channels(&self) -> usize {
        self.scale.len()
    }
}

/// Kernel and normalization of one convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvWeights {
    /// Kernel coefficients in the engine's documented order.
    pub kernel: Arc<[i32]>,
    /// Following normalization.
    pub norm: Arc<AffineParams>,
}

impl ConvWeights {
    /// Bundle a kernel with its normalization.
    pub fn new(kernel: Vec<i32>, norm: AffineParams) -> Self {
        Self {
            kernel: kernel.into(),
            norm: Arc::new(norm),
        }
    }
}

/// A fully connected layer `y[o] = Σ_i x[i] · w[o][i] + b[o]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearWeights {
    /// `[output][input]`, weight format.
    pub weights: Vec<i32>,
    /// Per-output bias, activation format.
    pub bias: Vec<i32>,
}

impl LinearWeights {
    /// Output features.
    pub fn outputs(&self) -> usize {
        self.bias.len()
    }

    /// Input features.
    pub fn inputs(&self) -> usize {
        if self.bias.is_empty() {
            0
        } else {
            self.weights.len() / self.bias.len()
        }
    }
}

/// The two fully connected layers of an attention stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeWeights {
    /// `expanded → hidden`.
    pub reduce: Arc<LinearWeights>,
    /// `hidden → expanded`.
    pub expand: Arc<LinearWeights>,
}

/// Everything one inverted-residual block consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWeights {
    /// 1×1 expansion, `[expanded][input]`.
    pub expand: ConvWeights,
    /// Depthwise, `[expanded][ky][kx]`.
    pub depthwise: ConvWeights,
    /// Optional attention.
    pub se: Option<Arc<SeWeights>>,
    /// 1×1 projection, `[output][expanded]`.
    pub project: ConvWeights,
}

/// Weights of one configured layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSet {
    /// Stem convolution, `[out][in][ky][kx]`.
    Stem(ConvWeights),
    /// Inverted-residual block.
    Block(BlockWeights),
    /// Head convolution, `[out][in][ky][kx]`.
    Head(ConvWeights),
    /// Final linear layer.
    Classifier(Arc<LinearWeights>),
}

impl WeightSet {
    /// Short name of the layer kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Stem(_) => "stem",
            Self::Block(_) => "block",
            Self::Head(_) => "head",
            Self::Classifier(_) => "classifier",
        }
    }
}

/// Weight sets for a whole model, ordered stem, blocks, head, classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelWeights {
    layers: Vec<WeightSet>,
}

impl ModelWeights {
    /// Wrap an ordered list of weight sets.
    pub fn new(layers: Vec<WeightSet>) -> Self {
        Self { layers }
    }

    /// Weight sets in layer order.
    pub fn layers(&self) -> &[WeightSet] {
        &self.layers
    }

    /// Total coefficient count.
    pub fn parameter_count(&self) -> usize {
        fn conv(c: &ConvWeights) -> usize {
            c.kernel.len() + c.norm.scale.len() + c.norm.shift.len()
        }
        fn linear(l: &LinearWeights) -> usize {
            l.weights.len() + l.bias.len()
        }
        self.layers
            .iter()
            .map(|layer| match layer {
                WeightSet::Stem(c) | WeightSet::Head(c) => conv(c),
                WeightSet::Block(b) => {
                    conv(&b.expand)
                        + conv(&b.depthwise)
                        + conv(&b.project)
                        + b.se.as_ref().map_or(0, |se| linear(&se.reduce) + linear(&se.expand))
                }
                WeightSet::Classifier(l) => linear(l),
            })
            .sum()
    }

    /// Check layer count, array lengths and value ranges against `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Weights`] describing the first inconsistency.
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        let expected = config.blocks().len() + 3;
        if self.layers.len() != expected {
            return Err(PipelineError::weights(format!(
                "{} weight sets supplied, model has {expected} layers",
                self.layers.len()
            )));
        }
        let check = Checker {
            weight: config.weight_format(),
            activation: config.activation_format(),
        };

        let stem = config.stem();
        match &self.layers[0] {
            WeightSet::Stem(c) => check.conv("stem", c, stem.kernel_len(), stem.output_channels())?,
            other => return Err(wrong_kind(0, "stem", other)),
        }

        for (i, block) in config.blocks().iter().enumerate() {
            let WeightSet::Block(b) = &self.layers[i + 1] else {
                return Err(wrong_kind(i + 1, "block", &self.layers[i + 1]));
            };
            let name = format!("block {i}");
            let (inp, exp, out) = (
                block.input_channels(),
                block.expanded_channels(),
                block.output_channels(),
            );
            let k = block.kernel_size();
            check.conv(&format!("{name} expand"), &b.expand, exp * inp, exp)?;
            check.conv(&format!("{name} depthwise"), &b.depthwise, exp * k * k, exp)?;
            check.conv(&format!("{name} project"), &b.project, out * exp, out)?;
            match (&b.se, block.use_se()) {
                (Some(se), true) => {
                    let hidden = block.se_channels();
                    check.linear(&format!("{name} se reduce"), &se.reduce, exp, hidden)?;
                    check.linear(&format!("{name} se expand"), &se.expand, hidden, exp)?;
                }
                (None, false) => {}
                (Some(_), false) => {
                    return Err(PipelineError::weights(format!(
                        "{name}: attention weights supplied for a block without attention"
                    )))
                }
                (None, true) => {
                    return Err(PipelineError::weights(format!("{name}: attention weights missing")))
                }
            }
        }

        let head = config.head();
        match &self.layers[expected - 2] {
            WeightSet::Head(c) => check.conv("head", c, head.kernel_len(), head.output_channels())?,
            other => return Err(wrong_kind(expected - 2, "head", other)),
        }
        match &self.layers[expected - 1] {
            WeightSet::Classifier(l) => {
                check.linear("classifier", l, head.output_channels(), config.num_classes())?;
            }
            other => return Err(wrong_kind(expected - 1, "classifier", other)),
        }
        Ok(())
    }

    /// Deterministic pseudo-random weights shaped for `config`.
    ///
    /// Kernels are small and normalization keeps a unit-scale, so
    /// activations stay well inside the representable range on natural
    /// inputs.
    pub fn random(config: &ModelConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let wf = config.weight_format();
        let af = config.activation_format();

        let uniform = |n: usize, fan_in: usize, fmt: QFormat, span: f64, rng: &mut StdRng| {
            #[allow(clippy::cast_precision_loss)]
            let limit = span / (fan_in.max(1) as f64).sqrt();
            (0..n)
                .map(|_| fmt.encode(rng.gen_range(-limit..=limit)))
                .collect::<Vec<i32>>()
        };
        let norm = |channels: usize, rng: &mut StdRng| AffineParams {
            scale: (0..channels).map(|_| wf.encode(rng.gen_range(0.75..1.0))).collect(),
            shift: (0..channels).map(|_| af.encode(rng.gen_range(-0.125..0.125))).collect(),
        };

        let mut layers = Vec::with_capacity(config.blocks().len() + 3);
        let stem = config.stem();
        let fan = stem.input_channels() * stem.kernel_size() * stem.kernel_size();
        layers.push(WeightSet::Stem(ConvWeights::new(
            uniform(stem.kernel_len(), fan, wf, 1.5, &mut rng),
            norm(stem.output_channels(), &mut rng),
        )));

        for block in config.blocks() {
            let (inp, exp, out) = (
                block.input_channels(),
                block.expanded_channels(),
                block.output_channels(),
            );
            let k = block.kernel_size();
            let expand = ConvWeights::new(uniform(exp * inp, inp, wf, 1.5, &mut rng), norm(exp, &mut rng));
            let depthwise =
                ConvWeights::new(uniform(exp * k * k, k * k, wf, 1.5, &mut rng), norm(exp, &mut rng));
            let se = block.use_se().then(|| {
                let hidden = block.se_channels();
                Arc::new(SeWeights {
                    reduce: Arc::new(LinearWeights {
                        weights: uniform(hidden * exp, exp, wf, 1.5, &mut rng),
                        bias: uniform(hidden, 1, af, 0.125, &mut rng),
                    }),
                    expand: Arc::new(LinearWeights {
                        weights: uniform(exp * hidden, hidden, wf, 1.5, &mut rng),
                        bias: uniform(exp, 1, af, 0.5, &mut rng),
                    }),
                })
            });
            let project = ConvWeights::new(uniform(out * exp, exp, wf, 1.5, &mut rng), norm(out, &mut rng));
            layers.push(WeightSet::Block(BlockWeights {
                expand,
                depthwise,
                se,
                project,
            }));
        }

        let head = config.head();
        let fan = head.input_channels() * head.kernel_size() * head.kernel_size();
        layers.push(WeightSet::Head(ConvWeights::new(
            uniform(head.kernel_len(), fan, wf, 1.5, &mut rng),
            norm(head.output_channels(), &mut rng),
        )));
        let classes = config.num_classes();
        layers.push(WeightSet::Classifier(Arc::new(LinearWeights {
            weights: uniform(classes * head.output_channels(), head.output_channels(), wf, 1.5, &mut rng),
            bias: uniform(classes, 1, af, 0.125, &mut rng),
        })));
        Self { layers }
    }

    /// Serialize to the packed layout.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + 4 * self.parameter_count());
        buf.put_slice(&MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u16_le(0);
        put_len(&mut buf, self.layers.len());
        for layer in &self.layers {
            match layer {
                WeightSet::Stem(c) | WeightSet::Head(c) => {
                    let kind = if matches!(layer, WeightSet::Stem(_)) {
                        KIND_STEM
                    } else {
                        KIND_HEAD
                    };
                    put_layer_header(&mut buf, kind, 0);
                    put_conv(&mut buf, c);
                }
                WeightSet::Block(b) => {
                    put_layer_header(&mut buf, KIND_BLOCK, if b.se.is_some() { FLAG_SE } else { 0 });
                    put_conv(&mut buf, &b.expand);
                    put_conv(&mut buf, &b.depthwise);
                    if let Some(se) = &b.se {
                        put_linear(&mut buf, &se.reduce);
                        put_linear(&mut buf, &se.expand);
                    }
                    put_conv(&mut buf, &b.project);
                }
                WeightSet::Classifier(l) => {
                    put_layer_header(&mut buf, KIND_CLASSIFIER, 0);
                    put_linear(&mut buf, l);
                }
            }
        }
        buf.freeze()
    }

    /// Parse the packed layout.
    ///
    /// Only the framing is checked here; call [`ModelWeights::validate`]
    /// against a configuration before installing the result.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Weights`] on a bad magic, unknown version,
    /// unknown layer kind or truncated data.
    pub fn unpack(mut data: &[u8]) -> Result<Self> {
        let buf = &mut data;
        need(buf, 12, "header")?;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(PipelineError::weights(format!("bad magic {magic:02x?}")));
        }
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(PipelineError::weights(format!("unsupported version {version}")));
        }
        buf.advance(2);
        let count = buf.get_u32_le() as usize;

        let mut layers = Vec::with_capacity(count.min(1024));
        for index in 0..count {
            need(buf, 4, "layer header")?;
            let kind = buf.get_u8();
            let flags = buf.get_u8();
            buf.advance(2);
            let layer = match kind {
                KIND_STEM => WeightSet::Stem(get_conv(buf)?),
                KIND_HEAD => WeightSet::Head(get_conv(buf)?),
                KIND_BLOCK => {
                    let expand = get_conv(buf)?;
                    let depthwise = get_conv(buf)?;
                    let se = if flags & FLAG_SE != 0 {
                        let reduce = Arc::new(get_linear(buf)?);
                        let expand = Arc::new(get_linear(buf)?);
                        Some(Arc::new(SeWeights { reduce, expand }))
                    } else {
                        None
                    };
                    let project = get_conv(buf)?;
                    WeightSet::Block(BlockWeights {
                        expand,
                        depthwise,
                        se,
                        project,
                    })
                }
                KIND_CLASSIFIER => WeightSet::Classifier(Arc::new(get_linear(buf)?)),
                other => {
                    return Err(PipelineError::weights(format!(
                        "layer {index}: unknown kind {other}"
                    )))
                }
            };
            layers.push(layer);
        }
        if buf.has_remaining() {
            return Err(PipelineError::weights(format!(
                "{} trailing bytes after {count} layers",
                buf.remaining()
            )));
        }
        Ok(Self { layers })
    }
}

// ── Validation helpers ───────────────────────────────────────────────────────

struct Checker {
    weight: QFormat,
    activation: QFormat,
}

impl Checker {
    fn values(what: &str, values: &[i32], len: usize, format: QFormat) -> Result<()> {
        if values.len() != len {
            return Err(PipelineError::weights(format!(
                "{what}: {} values, expected {len}",
                values.len()
            )));
        }
        if let Some(v) = values
            .iter()
            .find(|&&v| v < format.min_raw() || v > format.max_raw())
        {
            return Err(PipelineError::weights(format!("{what}: {v} outside {format}")));
        }
        Ok(())
    }

    fn conv(&self, name: &str, c: &ConvWeights, kernel_len: usize, channels: usize) -> Result<()> {
        Self::values(&format!("{name} kernel"), &c.kernel, kernel_len, self.weight)?;
        Self::values(&format!("{name} scale"), &c.norm.scale, channels, self.weight)?;
        Self::values(&format!("{name} shift"), &c.norm.shift, channels, self.activation)
    }

    fn linear(&self, name: &str, l: &LinearWeights, inputs: usize, outputs: usize) -> Result<()> {
        Self::values(&format!("{name} weights"), &l.weights, inputs * outputs, self.weight)?;
        Self::values(&format!("{name} bias"), &l.bias, outputs, self.activation)
    }
}

fn wrong_kind(index: usize, expected: &str, found: &WeightSet) -> PipelineError {
    PipelineError::weights(format!(
        "layer {index}: expected {expected} weights, found {}",
        found.kind()
    ))
}

// ── Packing helpers ──────────────────────────────────────────────────────────

fn put_len(buf: &mut BytesMut, len: usize) {
    // Lengths are bounded by the weight region, far below u32::MAX.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(len as u32);
}

fn put_layer_header(buf: &mut BytesMut, kind: u8, flags: u8) {
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u16_le(0);
}

fn put_array(buf: &mut BytesMut, values: &[i32]) {
    put_len(buf, values.len());
    for &v in values {
        buf.put_i32_le(v);
    }
}

fn put_conv(buf: &mut BytesMut, c: &ConvWeights) {
    put_array(buf, &c.kernel);
    put_array(buf, &c.norm.scale);
    put_array(buf, &c.norm.shift);
}

fn put_linear(buf: &mut BytesMut, l: &LinearWeights) {
    put_array(buf, &l.weights);
    put_array(buf, &l.bias);
}

fn need(buf: &&[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(PipelineError::weights(format!(
            "truncated {what}: {} of {len} bytes",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_array(buf: &mut &[u8]) -> Result<Vec<i32>> {
    need(buf, 4, "array length")?;
    let len = buf.get_u32_le() as usize;
    need(buf, len.saturating_mul(4), "array")?;
    Ok((0..len).map(|_| buf.get_i32_le()).collect())
}

fn get_conv(buf: &mut &[u8]) -> Result<ConvWeights> {
    let kernel = get_array(buf)?;
    let scale = get_array(buf)?;
    let shift = get_array(buf)?;
    Ok(ConvWeights::new(kernel, AffineParams { scale, shift }))
}

fn get_linear(buf: &mut &[u8]) -> Result<LinearWeights> {
    let weights = get_array(buf)?;
    let bias = get_array(buf)?;
    Ok(LinearWeights { weights, bias })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_weights_fit_their_configuration() {
        let config = ModelConfig::tiny(10);
        let weights = ModelWeights::random(&config, 7);
        weights.validate(&config).unwrap();
        assert_eq!(weights.layers().len(), 5);
        assert_eq!(ModelWeights::random(&config, 7), weights);
        assert_ne!(ModelWeights::random(&config, 8), weights);
    }

    #[test]
    fn packed_blob_restores_the_same_weights() {
        let config = ModelConfig::tiny(10);
        let weights = ModelWeights::random(&config, 3);
        let blob = weights.pack();
        assert_eq!(&blob[..4], b"K7WT");
        let restored = ModelWeights::unpack(&blob).unwrap();
        assert_eq!(restored, weights);
        restored.validate(&config).unwrap();
    }

    #[test]
    fn truncated_or_corrupt_blobs_are_rejected() {
        let blob = ModelWeights::random(&ModelConfig::tiny(4), 1).pack();
        assert!(ModelWeights::unpack(&blob[..blob.len() - 1]).is_err());
        assert!(ModelWeights::unpack(&blob[..6]).is_err());
        let mut bad = blob.to_vec();
        bad[0] = b'X';
        assert!(ModelWeights::unpack(&bad).is_err());
        let mut long = blob.to_vec();
        long.push(0);
        assert!(ModelWeights::unpack(&long).is_err());
    }

    #[test]
    fn validation_catches_shape_and_range_errors() {
        let config = ModelConfig::tiny(10);
        let mut weights = ModelWeights::random(&config, 5);
        weights.layers.pop();
        assert!(weights.validate(&config).is_err());

        let mut weights = ModelWeights::random(&config, 5);
        if let WeightSet::Classifier(l) = &mut weights.layers[4] {
            let mut l2 = (**l).clone();
            l2.weights[0] = 1000;
            *l = Arc::new(l2);
        }
        let err = weights.validate(&config).unwrap_err();
        assert!(err.to_string().contains("outside Q2.6"), "{err}");

        let weights = ModelWeights::random(&ModelConfig::tiny(11), 5);
        assert!(weights.validate(&config).is_err());
    }
}
