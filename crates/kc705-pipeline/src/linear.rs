//! Fully connected layers.

use crate::conv::{expect_len, MacArray};
use crate::error::{PipelineError, Result};
use crate::fixed::{FixedPoint, QFormat, Sample};
use crate::frame::{FrameShape, Port, Position, Token};
use crate::stream::{Outbox, Stage};
use crate::weights::LinearWeights;
use std::sync::Arc;

/// A fully connected layer bound to its arithmetic.
#[derive(Debug, Clone)]
pub struct Linear {
    inputs: usize,
    params: Arc<LinearWeights>,
    weight_frac: u32,
    mac: MacArray,
}

impl Linear {
    /// Bind `params` as an `inputs → params.outputs()` layer.
    ///
    /// # Errors
    ///
    /// Returns a weight error if the matrix is not `outputs × inputs`.
    pub fn new(
        name: &str,
        inputs: usize,
        params: Arc<LinearWeights>,
        weight_format: QFormat,
        units: usize,
    ) -> Result<Self> {
        expect_len(name, "weights", params.weights.len(), params.outputs() * inputs)?;
        Ok(Self {
            inputs,
            params,
            weight_frac: u32::from(weight_format.frac_bits()),
            mac: MacArray::new(units),
        })
    }

    /// Output features.
    pub fn outputs(&self) -> usize {
        self.params.outputs()
    }

    /// `y[o] = sat((Σ_i x[i] · w[o][i]) >> frac + b[o])`, appended to `y`.
    pub fn forward(&mut self, fx: &FixedPoint, x: &[Sample], y: &mut Vec<Sample>) {
        for (o, &bias) in self.params.bias.iter().enumerate() {
            let row = &self.params.weights[o * self.inputs..(o + 1) * self.inputs];
            let acc = self
                .mac
                .dot(x.iter().zip(row).map(|(x, &w)| (x.wide(), i64::from(w))));
            y.push(fx.saturate((acc >> self.weight_frac) + i64::from(bias)));
        }
    }
}

/// Final classifier: `C × 1 × 1` pooled features to one logit per class.
#[derive(Debug)]
pub struct Classifier {
    name: String,
    features: usize,
    layer: Linear,
    fx: FixedPoint,
    gathered: Vec<Sample>,
    logits: Vec<Sample>,
}

impl Classifier {
    /// Build a `features → classes` classifier.
    ///
    /// # Errors
    ///
    /// Returns a weight error if `params` does not match `features`.
    pub fn new(
        name: impl Into<String>,
        features: usize,
        params: Arc<LinearWeights>,
        weight_format: QFormat,
        fx: FixedPoint,
        units: usize,
    ) -> Result<Self> {
        let name = name.into();
        let layer = Linear::new(&name, features, params, weight_format, units)?;
        let classes = layer.outputs();
        Ok(Self {
            name,
            features,
            layer,
            fx,
            gathered: Vec::with_capacity(features),
            logits: Vec::with_capacity(classes),
        })
    }
}

impl Stage for Classifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Port {
        Port::channel_major(FrameShape::vector(self.features))
    }

    fn output(&self) -> Port {
        Port::channel_major(FrameShape::vector(self.layer.outputs()))
    }

    fn accept(&mut self, token: Token, _at: Position, out: &mut Outbox) -> Result<()> {
        if self.gathered.len() >= self.features {
            return Err(PipelineError::resource_exhaustion(&self.name, self.features));
        }
        self.gathered.push(token.sample);
        if token.last {
            self.logits.clear();
            self.layer.forward(&self.fx, &self.gathered, &mut self.logits);
            for &logit in &self.logits {
                out.emit(logit);
            }
            self.gathered.clear();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.gathered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FeatureMap;
    use crate::stream::Pipeline;

    #[test]
    fn logits_are_weighted_sums_plus_bias() {
        let fx = FixedPoint::new(QFormat::Q8_8);
        let one = QFormat::Q2_6.one();
        let params = Arc::new(LinearWeights {
            weights: vec![one, one, 0, -one, one / 2, one / 2],
            bias: vec![0, 10, -10],
        });
        let classifier = Classifier::new("fc", 2, params, QFormat::Q2_6, fx, 2).unwrap();
        let mut pipe = Pipeline::new(vec![Box::new(classifier)], 4).unwrap();
        let input = FeatureMap::from_samples(
            FrameShape::vector(2),
            vec![Sample::from_raw(100), Sample::from_raw(40)],
        )
        .unwrap();
        let out = pipe.run_frame(&input).unwrap();
        let logits: Vec<i32> = out.samples().iter().map(|s| s.raw()).collect();
        assert_eq!(logits, vec![140, -30, 60]);
    }

    #[test]
    fn mismatched_matrix_rejected() {
        let params = Arc::new(LinearWeights {
            weights: vec![0; 5],
            bias: vec![0; 2],
        });
        let fx = FixedPoint::new(QFormat::Q8_8);
        assert!(Classifier::new("fc", 3, params, QFormat::Q2_6, fx, 1).is_err());
    }
}
