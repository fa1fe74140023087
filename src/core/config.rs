#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{HierarchyError, Result};
use crate::grid::GridSize;

/// Per-layer construction parameters. Immutable once a hierarchy is built.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LayerConfig {
    /// Hidden grid width.
    pub width: usize,
    /// Hidden grid height.
    pub height: usize,

    /// Visible cells each hidden unit reads, around its projected centre.
    pub receptive_radius: usize,
    /// Peer hidden units each unit competes with.
    pub inhibition_radius: usize,
    /// Peer hidden units whose previous state feeds back into each unit.
    pub recurrent_radius: usize,
    /// Same-layer hidden units a prediction unit reads.
    pub lateral_radius: usize,
    /// Upper-layer prediction units a prediction unit reads.
    pub feedback_radius: usize,

    /// Target fraction of active hidden units, in (0, 1).
    pub sparsity: f32,

    pub feedforward_rate: f32,
    pub recurrent_rate: f32,
    pub inhibitory_rate: f32,
    /// Homeostatic bias step for hidden units.
    pub bias_rate: f32,

    pub prediction_bias_rate: f32,
    pub prediction_lateral_rate: f32,
    pub prediction_feedback_rate: f32,
}

impl Default for LayerConfig {
    /// A 16x16 layer with moderate radii and ~5% activity.
    fn default() -> Self {
        Self {
            width: 16,
            height: 16,
            receptive_radius: 6,
            inhibition_radius: 4,
            recurrent_radius: 4,
            lateral_radius: 4,
            feedback_radius: 4,
            sparsity: 0.05,
            feedforward_rate: 0.1,
            recurrent_rate: 0.05,
            inhibitory_rate: 0.02,
            bias_rate: 0.05,
            prediction_bias_rate: 0.1,
            prediction_lateral_rate: 0.2,
            prediction_feedback_rate: 0.2,
        }
    }
}

impl LayerConfig {
    /// Default parameters with a `width` x `height` hidden grid.
    pub fn with_size(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    #[inline]
    pub fn grid(&self) -> GridSize {
        GridSize::new(self.width, self.height)
    }

    /// Set every radius at once.
    pub fn with_radii(
        mut self,
        receptive: usize,
        inhibition: usize,
        recurrent: usize,
        lateral: usize,
        feedback: usize,
    ) -> Self {
        self.receptive_radius = receptive;
        self.inhibition_radius = inhibition;
        self.recurrent_radius = recurrent;
        self.lateral_radius = lateral;
        self.feedback_radius = feedback;
        self
    }

    pub fn with_sparsity(mut self, sparsity: f32) -> Self {
        self.sparsity = sparsity;
        self
    }

    /// Set the sparse coder rates: feedforward, recurrent, inhibitory, bias.
    pub fn with_coder_rates(
        mut self,
        feedforward: f32,
        recurrent: f32,
        inhibitory: f32,
        bias: f32,
    ) -> Self {
        self.feedforward_rate = feedforward;
        self.recurrent_rate = recurrent;
        self.inhibitory_rate = inhibitory;
        self.bias_rate = bias;
        self
    }

    /// Set the prediction unit rates: bias, lateral, feedback.
    pub fn with_prediction_rates(mut self, bias: f32, lateral: f32, feedback: f32) -> Self {
        self.prediction_bias_rate = bias;
        self.prediction_lateral_rate = lateral;
        self.prediction_feedback_rate = feedback;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.grid().validate("hidden")?;

        if !(self.sparsity.is_finite() && 0.0 < self.sparsity && self.sparsity < 1.0) {
            return Err(HierarchyError::InvalidSparsity(self.sparsity));
        }

        let rates = [
            ("feedforward_rate", self.feedforward_rate),
            ("recurrent_rate", self.recurrent_rate),
            ("inhibitory_rate", self.inhibitory_rate),
            ("bias_rate", self.bias_rate),
            ("prediction_bias_rate", self.prediction_bias_rate),
            ("prediction_lateral_rate", self.prediction_lateral_rate),
            ("prediction_feedback_rate", self.prediction_feedback_rate),
        ];
        for (name, value) in rates {
            if !value.is_finite() || value < 0.0 {
                return Err(HierarchyError::InvalidRate { name, value });
            }
        }
        Ok(())
    }

    /// The sparse coder's share of this layer's learning parameters.
    pub fn coder_rates(&self) -> SparseCodingRates {
        SparseCodingRates {
            feedforward: self.feedforward_rate,
            recurrent: self.recurrent_rate,
            inhibitory: self.inhibitory_rate,
            bias: self.bias_rate,
            sparsity: self.sparsity,
        }
    }

    /// Parse a JSON array of layer configs, bottom layer first.
    ///
    /// Missing fields take their defaults; every entry is validated.
    #[cfg(feature = "serde")]
    pub fn stack_from_json(json: &str) -> Result<Vec<LayerConfig>> {
        let stack: Vec<LayerConfig> = serde_json::from_str(json)?;
        if stack.is_empty() {
            return Err(HierarchyError::EmptyStack);
        }
        for (l, cfg) in stack.iter().enumerate() {
            cfg.validate().map_err(|e| e.in_layer(l))?;
        }
        Ok(stack)
    }
}

/// Learning parameters for one [`SparseCodingLayer::learn`] pass.
///
/// [`SparseCodingLayer::learn`]: crate::sparse_coder::SparseCodingLayer::learn
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SparseCodingRates {
    pub feedforward: f32,
    pub recurrent: f32,
    pub inhibitory: f32,
    pub bias: f32,
    pub sparsity: f32,
}

impl SparseCodingRates {
    /// Scale every rate (not the sparsity target) by `factor`.
    pub fn scaled(self, factor: f32) -> Self {
        Self {
            feedforward: self.feedforward * factor,
            recurrent: self.recurrent * factor,
            inhibitory: self.inhibitory * factor,
            bias: self.bias * factor,
            sparsity: self.sparsity,
        }
    }

    pub fn is_finite(&self) -> bool {
        [
            self.feedforward,
            self.recurrent,
            self.inhibitory,
            self.bias,
            self.sparsity,
        ]
        .iter()
        .all(|r| r.is_finite())
    }
}
