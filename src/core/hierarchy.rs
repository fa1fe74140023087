//! Predictive hierarchy: a stack of sparse coders plus prediction units that
//! forecast each layer's next hidden state, top-down.
//!
//! Per timestep: set the input, `update`, optionally `learn`, then `step_end`.
//! After `update`, `prediction(i)` is the forecast of input cell `i` at the
//! next step.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::LayerConfig;
use crate::error::{HierarchyError, Result};
use crate::grid::{connect, neighborhood, normalize_jointly, weighted_sum, Connection, GridSize, UnitId};
use crate::prng::WeightRng;
use crate::sparse_coder::{fire, gated_inhibition, SparseCodingLayer, RECONSTRUCTION_FLOOR};

/// Forecasts the next state of the hidden unit at the same index.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PredictionUnit {
    /// Same-layer hidden units' current state, self included.
    pub lateral: Vec<Connection>,
    /// Upper layer prediction bits. Empty on the top layer.
    pub feedback: Vec<Connection>,

    pub bias: f32,

    pub activation: f32,
    pub state: f32,
    pub state_prev: f32,
    pub bit: f32,
    pub bit_prev: f32,
}

/// One level of the hierarchy: a sparse coder and its prediction units.
#[derive(Debug, Clone)]
pub struct Layer {
    config: LayerConfig,
    pub(crate) coder: SparseCodingLayer,
    pub(crate) predictions: Vec<PredictionUnit>,
    prediction_resets: u64,
}

impl Layer {
    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn coder(&self) -> &SparseCodingLayer {
        &self.coder
    }

    pub fn predictions(&self) -> &[PredictionUnit] {
        &self.predictions
    }

    #[inline]
    pub fn prediction_state(&self, index: UnitId) -> f32 {
        self.predictions[index].state
    }

    #[inline]
    pub fn prediction_bit(&self, index: UnitId) -> f32 {
        self.predictions[index].bit
    }

    /// Fraction of prediction units whose bit is set.
    pub fn prediction_active_fraction(&self) -> f32 {
        let active = self.predictions.iter().filter(|p| p.bit > 0.0).count();
        active as f32 / self.predictions.len() as f32
    }

    /// Mean `|hidden state − previous prediction bit|`: how well last step's
    /// prediction matched the state this step.
    pub fn prediction_error(&self) -> f32 {
        let sum: f32 = self
            .coder
            .hidden
            .iter()
            .zip(&self.predictions)
            .map(|(h, p)| (h.state - p.bit_prev).abs())
            .sum();
        sum / self.predictions.len() as f32
    }

    /// Weights/biases reset by the non-finite guard, coder and predictions combined.
    pub fn non_finite_resets(&self) -> u64 {
        self.coder.non_finite_resets() + self.prediction_resets
    }
}

fn accept_importance(importance: f32) -> bool {
    if importance.is_finite() {
        return true;
    }
    tracing::warn!(importance, "skipping learning pass with non-finite importance");
    false
}

#[derive(Debug, Clone)]
pub struct PredictiveHierarchy {
    input_size: GridSize,
    layers: Vec<Layer>,

    forecast: Vec<f32>,
    forecast_prev: Vec<f32>,
}

impl PredictiveHierarchy {
    /// Build every sparse coder bottom-up, then every layer's prediction units.
    ///
    /// Layer 0 reads the `input_size` grid; layer `l > 0` reads layer `l − 1`'s
    /// hidden grid.
    pub fn new<R: WeightRng>(
        input_size: GridSize,
        configs: &[LayerConfig],
        rng: &mut R,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(HierarchyError::EmptyStack);
        }
        input_size.validate("input")?;
        for (l, cfg) in configs.iter().enumerate() {
            cfg.validate().map_err(|e| e.in_layer(l))?;
        }

        let mut coders = Vec::with_capacity(configs.len());
        let mut visible_size = input_size;
        for (l, cfg) in configs.iter().enumerate() {
            let coder = SparseCodingLayer::new(
                visible_size,
                cfg.grid(),
                cfg.receptive_radius,
                cfg.inhibition_radius,
                cfg.recurrent_radius,
                rng,
            )
            .map_err(|e| e.in_layer(l))?;
            visible_size = cfg.grid();
            coders.push(coder);
        }

        let mut layers = Vec::with_capacity(configs.len());
        for (l, (cfg, coder)) in configs.iter().zip(coders).enumerate() {
            let grid = cfg.grid();
            let upper = configs.get(l + 1).map(LayerConfig::grid);

            let mut predictions = Vec::with_capacity(grid.len());
            for i in 0..grid.len() {
                let (x, y) = grid.coords(i);
                let mut lateral = connect(
                    neighborhood(grid, x, y, cfg.lateral_radius, true),
                    -1.0,
                    1.0,
                    rng,
                );
                let mut feedback = match upper {
                    Some(upper) => {
                        let (ux, uy) = grid.project(x, y, upper);
                        connect(
                            neighborhood(upper, ux, uy, cfg.feedback_radius, true),
                            -1.0,
                            1.0,
                            rng,
                        )
                    }
                    None => Vec::new(),
                };
                normalize_jointly(&mut [lateral.as_mut_slice(), feedback.as_mut_slice()]);

                predictions.push(PredictionUnit {
                    lateral,
                    feedback,
                    bias: 0.0,
                    activation: 0.0,
                    state: 0.0,
                    state_prev: 0.0,
                    bit: 0.0,
                    bit_prev: 0.0,
                });
            }

            tracing::debug!(
                layer = l,
                hidden = grid.len(),
                visible = coder.visible_size().len(),
                feedforward = coder.hidden().iter().map(|u| u.feedforward.len()).sum::<usize>(),
                inhibitory = coder.hidden().iter().map(|u| u.inhibitory.len()).sum::<usize>(),
                feedback = predictions.iter().map(|p| p.feedback.len()).sum::<usize>(),
                "built layer"
            );

            layers.push(Layer {
                config: *cfg,
                coder,
                predictions,
                prediction_resets: 0,
            });
        }

        Ok(Self {
            input_size,
            layers,
            forecast: vec![0.0; input_size.len()],
            forecast_prev: vec![0.0; input_size.len()],
        })
    }

    #[inline]
    pub fn set_input(&mut self, index: UnitId, value: f32) {
        self.layers[0].coder.set_visible_input(index, value);
    }

    #[inline]
    pub fn set_input_xy(&mut self, x: usize, y: usize, value: f32) {
        self.layers[0].coder.set_visible_input_xy(x, y, value);
    }

    /// Set the whole input grid, row-major. Extra values are ignored.
    pub fn set_inputs(&mut self, values: &[f32]) {
        for (v, &value) in self.layers[0].coder.visible.iter_mut().zip(values) {
            v.input = value;
        }
    }

    /// Encode bottom-up, then predict top-down and project the bottom layer's
    /// prediction into input space.
    pub fn update(&mut self) {
        for l in 0..self.layers.len() {
            if l > 0 {
                let (lower, upper) = self.layers.split_at_mut(l);
                let below = &lower[l - 1].coder.hidden;
                for (v, h) in upper[0].coder.visible.iter_mut().zip(below) {
                    v.input = h.state;
                }
            }
            let coder = &mut self.layers[l].coder;
            coder.activate();
            coder.reconstruct();
        }

        for l in (0..self.layers.len()).rev() {
            let (lower, upper) = self.layers.split_at_mut(l + 1);
            let layer = &mut lower[l];
            let above = upper.first().map(|u| u.predictions.as_slice()).unwrap_or(&[]);

            for p in &mut layer.predictions {
                let lateral = weighted_sum(&p.lateral, |j| layer.coder.hidden[j].state);
                let feedback = weighted_sum(&p.feedback, |j| above[j].bit);
                p.activation = p.bias + lateral + feedback;
            }

            for i in 0..layer.predictions.len() {
                let own = layer.predictions[i].activation;
                let inhibition = gated_inhibition(&layer.coder.hidden[i].inhibitory, own, |j| {
                    layer.predictions[j].activation
                });
                let (state, bit) = fire(own + inhibition);
                let p = &mut layer.predictions[i];
                p.state = state;
                p.bit = bit;
            }
        }

        let bottom = &self.layers[0];
        let mut sums = vec![0.0f32; self.forecast.len()];
        let mut norms = vec![0.0f32; self.forecast.len()];
        for (h, p) in bottom.coder.hidden.iter().zip(&bottom.predictions) {
            for c in &h.feedforward {
                sums[c.index] += c.weight * p.bit;
                norms[c.index] += p.bit;
            }
        }
        for (f, (sum, norm)) in self.forecast.iter_mut().zip(sums.into_iter().zip(norms)) {
            *f = sum / norm.max(RECONSTRUCTION_FLOOR);
        }
    }

    /// Train prediction units on the error of last step's prediction bits,
    /// then every sparse coder. `importance` scales every rate.
    ///
    /// A non-finite `importance` is ignored: nothing learns this step.
    pub fn learn(&mut self, importance: f32) {
        if !accept_importance(importance) {
            return;
        }
        self.learn_predictions(importance);
        self.learn_sparse_coders(importance);
    }

    /// Prediction-unit half of [`learn`](Self::learn).
    pub fn learn_predictions(&mut self, importance: f32) {
        if !accept_importance(importance) {
            return;
        }
        for l in 0..self.layers.len() {
            let (lower, upper) = self.layers.split_at_mut(l + 1);
            let layer = &mut lower[l];
            let above = upper.first().map(|u| u.predictions.as_slice()).unwrap_or(&[]);
            let hidden = &layer.coder.hidden;

            let bias_rate = layer.config.prediction_bias_rate * importance;
            let lateral_rate = layer.config.prediction_lateral_rate * importance;
            let feedback_rate = layer.config.prediction_feedback_rate * importance;

            let mut resets = 0;
            for (i, p) in layer.predictions.iter_mut().enumerate() {
                let error = hidden[i].state - p.bit_prev;

                p.bias += bias_rate * error;
                for c in &mut p.lateral {
                    c.weight += lateral_rate * error * hidden[c.index].state_prev;
                }
                for c in &mut p.feedback {
                    c.weight += feedback_rate * error * above[c.index].bit_prev;
                }

                for c in p.lateral.iter_mut().chain(p.feedback.iter_mut()) {
                    if !c.weight.is_finite() {
                        c.weight = 0.0;
                        resets += 1;
                    }
                }
                if !p.bias.is_finite() {
                    p.bias = 0.0;
                    resets += 1;
                }
            }

            if resets > 0 {
                tracing::warn!(layer = l, resets, "prediction units: reset non-finite weights");
                layer.prediction_resets += resets;
            }
        }
    }

    /// Sparse-coder half of [`learn`](Self::learn).
    pub fn learn_sparse_coders(&mut self, importance: f32) {
        if !accept_importance(importance) {
            return;
        }
        for (l, layer) in self.layers.iter_mut().enumerate() {
            let rates = layer.config.coder_rates().scaled(importance);
            let resets = layer.coder.learn(rates);
            tracing::trace!(
                layer = l,
                active = layer.coder.active_fraction(),
                resets,
                "sparse coder learned"
            );
        }
    }

    /// Commit the step in every layer and keep the forecast as the previous one.
    pub fn step_end(&mut self) {
        for layer in &mut self.layers {
            layer.coder.step_end();
            for p in &mut layer.predictions {
                p.state_prev = p.state;
                p.bit_prev = p.bit;
            }
        }
        self.forecast_prev.copy_from_slice(&self.forecast);
    }

    /// Forecast of input cell `index` at the next step.
    #[inline]
    pub fn prediction(&self, index: UnitId) -> f32 {
        self.forecast[index]
    }

    #[inline]
    pub fn prediction_xy(&self, x: usize, y: usize) -> f32 {
        self.forecast[self.input_size.index(x, y)]
    }

    pub fn predictions(&self) -> &[f32] {
        &self.forecast
    }

    /// The forecast committed by the last `step_end`.
    #[inline]
    pub fn prediction_prev(&self, index: UnitId) -> f32 {
        self.forecast_prev[index]
    }

    pub fn predictions_prev(&self) -> &[f32] {
        &self.forecast_prev
    }

    /// Mean absolute difference between the current input and the previous
    /// step's forecast of it.
    pub fn prediction_error(&self) -> f32 {
        let sum: f32 = self.layers[0]
            .coder
            .visible
            .iter()
            .zip(&self.forecast_prev)
            .map(|(v, f)| (v.input - f).abs())
            .sum();
        sum / self.forecast_prev.len() as f32
    }

    /// Run a copy of the hierarchy forward on its own forecasts.
    ///
    /// Call after `update`. Each rollout step commits the previous step, feeds
    /// the forecast back as input and updates without learning; entry `k` is
    /// the forecast after `k + 1` fed-back steps. `self` is untouched.
    pub fn rollout(&self, steps: usize) -> Vec<Vec<f32>> {
        let mut sim = self.clone();
        let mut forecasts = Vec::with_capacity(steps);
        for _ in 0..steps {
            sim.step_end();
            let fed = sim.forecast_prev.clone();
            sim.set_inputs(&fed);
            sim.update();
            forecasts.push(sim.forecast.clone());
        }
        forecasts
    }

    pub fn input_size(&self) -> GridSize {
        self.input_size
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, l: usize) -> &Layer {
        &self.layers[l]
    }

    pub fn configs(&self) -> impl Iterator<Item = &LayerConfig> + '_ {
        self.layers.iter().map(Layer::config)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    fn stack() -> Vec<LayerConfig> {
        vec![
            LayerConfig::with_size(6, 6).with_radii(2, 2, 1, 2, 1).with_sparsity(0.1),
            LayerConfig::with_size(4, 4).with_radii(2, 2, 1, 2, 1).with_sparsity(0.1),
            LayerConfig::with_size(2, 2).with_radii(1, 1, 1, 1, 1).with_sparsity(0.25),
        ]
    }

    fn hierarchy(seed: u64) -> PredictiveHierarchy {
        let mut rng = Prng::new(seed);
        PredictiveHierarchy::new(GridSize::new(8, 8), &stack(), &mut rng).unwrap()
    }

    fn feed(h: &mut PredictiveHierarchy, data: &mut Prng) {
        for i in 0..h.input_size().len() {
            h.set_input(i, data.next_f32_01());
        }
    }

    #[test]
    fn construction_wires_layers_together() {
        let h = hierarchy(1);
        assert_eq!(h.num_layers(), 3);
        assert_eq!(h.layer(0).coder().visible_size(), GridSize::new(8, 8));
        assert_eq!(h.layer(1).coder().visible_size(), GridSize::new(6, 6));
        assert_eq!(h.layer(2).coder().visible_size(), GridSize::new(4, 4));

        assert!(h.layer(0).predictions().iter().all(|p| !p.feedback.is_empty()));
        assert!(h.layer(2).predictions().iter().all(|p| p.feedback.is_empty()));

        for layer in h.layers() {
            for p in layer.predictions() {
                let norm2: f32 = p
                    .lateral
                    .iter()
                    .chain(p.feedback.iter())
                    .map(|c| c.weight * c.weight)
                    .sum();
                assert!((norm2 - 1.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn construction_errors_name_the_layer() {
        let mut rng = Prng::new(1);
        assert!(matches!(
            PredictiveHierarchy::new(GridSize::new(4, 4), &[], &mut rng),
            Err(HierarchyError::EmptyStack)
        ));

        let mut configs = stack();
        configs[1].inhibition_radius = 0;
        match PredictiveHierarchy::new(GridSize::new(8, 8), &configs, &mut rng) {
            Err(HierarchyError::Layer { layer, source }) => {
                assert_eq!(layer, 1);
                assert!(matches!(*source, HierarchyError::EmptyNeighborhood { .. }));
            }
            other => panic!("expected layer error, got {:?}", other.map(|_| ())),
        }

        let mut configs = stack();
        configs[2].sparsity = 0.0;
        assert!(matches!(
            PredictiveHierarchy::new(GridSize::new(8, 8), &configs, &mut rng),
            Err(HierarchyError::Layer { layer: 2, .. })
        ));

        assert!(matches!(
            PredictiveHierarchy::new(GridSize::new(8, 0), &stack(), &mut rng),
            Err(HierarchyError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn upper_layers_read_lower_hidden_states() {
        let mut h = hierarchy(2);
        let mut data = Prng::new(3);
        feed(&mut h, &mut data);
        h.update();

        for l in 1..h.num_layers() {
            let below = h.layer(l - 1).coder();
            let here = h.layer(l).coder();
            for i in 0..below.hidden().len() {
                assert_eq!(here.visible_input(i), below.hidden_state(i));
            }
        }
    }

    #[test]
    fn forecast_is_renormalized_over_prediction_bits() {
        let mut h = hierarchy(4);
        let mut data = Prng::new(5);
        for _ in 0..5 {
            feed(&mut h, &mut data);
            h.update();
            h.learn(1.0);
            h.step_end();
        }
        feed(&mut h, &mut data);
        h.update();

        let bottom = h.layer(0);
        for vi in 0..h.input_size().len() {
            let mut sum = 0.0f32;
            let mut norm = 0.0f32;
            for (u, p) in bottom.coder().hidden().iter().zip(bottom.predictions()) {
                for c in u.feedforward.iter().filter(|c| c.index == vi) {
                    sum += c.weight * p.bit;
                    norm += p.bit;
                }
            }
            assert!((h.prediction(vi) - sum / norm.max(RECONSTRUCTION_FLOOR)).abs() <= 1e-6);
        }
    }

    #[test]
    fn step_end_commits_forecast_and_prediction_units() {
        let mut h = hierarchy(6);
        let mut data = Prng::new(7);
        feed(&mut h, &mut data);
        h.update();
        let forecast = h.predictions().to_vec();
        let committed: Vec<Vec<(f32, f32)>> = h
            .layers()
            .iter()
            .map(|layer| layer.predictions().iter().map(|p| (p.state, p.bit)).collect())
            .collect();

        h.step_end();
        assert_eq!(h.predictions_prev(), forecast.as_slice());
        for (layer, expected) in h.layers().iter().zip(&committed) {
            for (p, &(state, bit)) in layer.predictions().iter().zip(expected) {
                assert_eq!(p.state_prev, state);
                assert_eq!(p.bit_prev, bit);
            }
        }

        // A new step overwrites current values only.
        feed(&mut h, &mut data);
        h.update();
        assert_eq!(h.predictions_prev(), forecast.as_slice());
        for (layer, expected) in h.layers().iter().zip(&committed) {
            for (p, &(state, bit)) in layer.predictions().iter().zip(expected) {
                assert_eq!(p.state_prev, state);
                assert_eq!(p.bit_prev, bit);
            }
        }
    }

    #[test]
    fn repeated_update_without_step_end_is_identical() {
        let mut h = hierarchy(14);
        let mut data = Prng::new(15);
        for _ in 0..5 {
            feed(&mut h, &mut data);
            h.update();
            h.learn(1.0);
            h.step_end();
        }
        feed(&mut h, &mut data);

        h.update();
        let first = h.clone();
        h.update();

        assert_eq!(h.predictions(), first.predictions());
        for (a, b) in h.layers().iter().zip(first.layers()) {
            for (u, v) in a.coder().hidden().iter().zip(b.coder().hidden()) {
                assert_eq!((u.activation, u.state, u.bit), (v.activation, v.state, v.bit));
            }
            for (p, q) in a.predictions().iter().zip(b.predictions()) {
                assert_eq!((p.activation, p.state, p.bit), (q.activation, q.state, q.bit));
            }
        }
    }

    fn assert_same_parameters(a: &PredictiveHierarchy, b: &PredictiveHierarchy) {
        for (x, y) in a.layers().iter().zip(b.layers()) {
            for (p, q) in x.predictions().iter().zip(y.predictions()) {
                assert_eq!(p.bias, q.bias);
                assert_eq!(p.lateral, q.lateral);
                assert_eq!(p.feedback, q.feedback);
            }
            for (u, v) in x.coder().hidden().iter().zip(y.coder().hidden()) {
                assert_eq!(u.bias, v.bias);
                assert_eq!(u.feedforward, v.feedforward);
                assert_eq!(u.recurrent, v.recurrent);
                assert_eq!(u.inhibitory, v.inhibitory);
            }
        }
    }

    #[test]
    fn non_finite_importance_skips_learning() {
        let mut h = hierarchy(16);
        let mut data = Prng::new(17);
        for _ in 0..10 {
            feed(&mut h, &mut data);
            h.update();
            h.learn(1.0);
            h.step_end();
        }
        feed(&mut h, &mut data);
        h.update();

        let before = h.clone();
        h.learn(f32::NAN);
        h.learn(f32::INFINITY);
        h.learn_predictions(f32::NEG_INFINITY);
        h.learn_sparse_coders(f32::NAN);

        assert_same_parameters(&h, &before);
        assert!(h.layers().iter().all(|l| l.non_finite_resets() == 0));
    }

    #[test]
    fn non_finite_prediction_weights_are_reset() {
        let mut h = hierarchy(18);
        let mut data = Prng::new(19);
        for _ in 0..3 {
            feed(&mut h, &mut data);
            h.update();
            h.learn(1.0);
            h.step_end();
        }
        feed(&mut h, &mut data);
        h.update();

        h.layers[0].predictions[0].lateral[0].weight = f32::NAN;
        h.layers[1].predictions[2].bias = f32::NAN;
        h.learn_predictions(1.0);

        assert_eq!(h.layer(0).non_finite_resets(), 1);
        assert_eq!(h.layer(1).non_finite_resets(), 1);
        assert_eq!(h.layer(2).non_finite_resets(), 0);
        assert_eq!(h.layer(0).predictions()[0].lateral[0].weight, 0.0);
        assert_eq!(h.layer(1).predictions()[2].bias, 0.0);
        for layer in h.layers() {
            for p in layer.predictions() {
                assert!(p.bias.is_finite());
                assert!(p
                    .lateral
                    .iter()
                    .chain(p.feedback.iter())
                    .all(|c| c.weight.is_finite()));
            }
        }
    }

    #[test]
    fn zero_importance_freezes_weights() {
        let mut h = hierarchy(8);
        let mut data = Prng::new(9);
        feed(&mut h, &mut data);
        h.update();
        h.step_end();
        feed(&mut h, &mut data);
        h.update();

        let before = h.clone();
        h.learn(0.0);
        for (a, b) in h.layers().iter().zip(before.layers()) {
            for (p, q) in a.predictions().iter().zip(b.predictions()) {
                assert_eq!(p.bias, q.bias);
                assert_eq!(p.lateral, q.lateral);
                assert_eq!(p.feedback, q.feedback);
            }
            for (u, v) in a.coder().hidden().iter().zip(b.coder().hidden()) {
                assert_eq!(u.feedforward, v.feedforward);
                assert_eq!(u.bias, v.bias);
            }
        }
    }

    #[test]
    fn rollout_leaves_the_live_hierarchy_alone() {
        let mut h = hierarchy(10);
        let mut data = Prng::new(11);
        for _ in 0..20 {
            feed(&mut h, &mut data);
            h.update();
            h.learn(1.0);
            h.step_end();
        }
        feed(&mut h, &mut data);
        h.update();

        let forecast = h.predictions().to_vec();
        let prev = h.predictions_prev().to_vec();
        let rolled = h.rollout(4);

        assert_eq!(rolled.len(), 4);
        assert!(rolled.iter().all(|f| f.len() == 64));
        assert_eq!(h.predictions(), forecast.as_slice());
        assert_eq!(h.predictions_prev(), prev.as_slice());
    }

    #[test]
    fn prediction_error_compares_input_with_last_forecast() {
        let mut h = hierarchy(12);
        let mut data = Prng::new(13);
        feed(&mut h, &mut data);
        h.update();
        h.step_end();

        for i in 0..h.input_size().len() {
            h.set_input(i, h.prediction_prev(i));
        }
        assert_eq!(h.prediction_error(), 0.0);

        h.set_input_xy(0, 0, h.prediction_prev(0) + 64.0);
        assert!((h.prediction_error() - 1.0).abs() < 1e-4);
    }
}
