#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::grid::GridSize;
use crate::hierarchy::{Layer, PredictiveHierarchy};

/// A read-only snapshot of what the hierarchy is doing.
///
/// Observers cannot mutate or steer the hierarchy. Snapshotting is on-demand
/// and allocates; the per-step loop stays unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HierarchySnapshot {
    pub input: GridSize,
    /// Mean |input − previous forecast|.
    pub prediction_error: f32,
    pub forecast: Vec<f32>,
    pub layers: Vec<LayerSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerSnapshot {
    pub hidden: GridSize,
    pub hidden_active: f32,
    pub prediction_active: f32,
    pub mean_bias: f32,
    pub representation_error: f32,
    pub prediction_error: f32,
    pub non_finite_resets: u64,
}

impl LayerSnapshot {
    fn of(layer: &Layer) -> Self {
        let coder = layer.coder();
        let mean_bias =
            coder.hidden().iter().map(|u| u.bias).sum::<f32>() / coder.hidden().len() as f32;

        Self {
            hidden: coder.hidden_size(),
            hidden_active: coder.active_fraction(),
            prediction_active: layer.prediction_active_fraction(),
            mean_bias,
            representation_error: coder.representation_error(),
            prediction_error: layer.prediction_error(),
            non_finite_resets: layer.non_finite_resets(),
        }
    }
}

#[cfg(feature = "serde")]
impl HierarchySnapshot {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub struct HierarchyAdapter<'a> {
    hierarchy: &'a PredictiveHierarchy,
}

impl<'a> HierarchyAdapter<'a> {
    pub fn new(hierarchy: &'a PredictiveHierarchy) -> Self {
        Self { hierarchy }
    }

    pub fn snapshot(&self) -> HierarchySnapshot {
        HierarchySnapshot {
            input: self.hierarchy.input_size(),
            prediction_error: self.hierarchy.prediction_error(),
            forecast: self.hierarchy.predictions().to_vec(),
            layers: self.hierarchy.layers().iter().map(LayerSnapshot::of).collect(),
        }
    }

    /// Feedforward weight patch of one hidden unit, for visualizers.
    pub fn receptive_field(&self, layer: usize, hx: usize, hy: usize) -> Vec<f32> {
        self.hierarchy.layer(layer).coder().receptive_field(hx, hy)
    }
}
