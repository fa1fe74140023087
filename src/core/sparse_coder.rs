//! Sparse coding layer: a visible grid of scalars feeding a hidden grid of
//! competing, recurrently-connected units.
//!
//! One timestep is `activate` → `reconstruct` → (`learn`) → `step_end`.
//! `activate` reads only the current input and the *previous* hidden state, so
//! it can be repeated any number of times before `step_end` with identical
//! results.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SparseCodingRates;
use crate::error::{HierarchyError, Result};
use crate::grid::{connect, neighborhood, normalize_jointly, weighted_sum, Connection, GridSize, UnitId};
use crate::prng::WeightRng;

/// Denominator floor for renormalized reconstructions.
pub const RECONSTRUCTION_FLOOR: f32 = 1e-4;

/// Sigmoid rescaled to (-1, 1).
#[inline]
pub fn squash(x: f32) -> f32 {
    2.0 / (1.0 + (-x).exp()) - 1.0
}

/// Comparison-gated inhibition: every peer whose activation beats `own`
/// contributes its (non-positive) weight.
#[inline]
pub(crate) fn gated_inhibition(
    connections: &[Connection],
    own: f32,
    activation: impl Fn(UnitId) -> f32,
) -> f32 {
    connections
        .iter()
        .filter(|c| activation(c.index) > own)
        .map(|c| c.falloff * c.weight)
        .sum()
}

/// `max(0, squash(x))` and its bit.
#[inline]
pub(crate) fn fire(x: f32) -> (f32, f32) {
    // NaN.max(0.0) is 0.0, so a poisoned activation stays silent.
    let state = squash(x).max(0.0);
    let bit = if state > 0.0 { 1.0 } else { 0.0 };
    (state, bit)
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VisibleUnit {
    pub input: f32,
    pub input_prev: f32,
    pub reconstruction: f32,
}

/// One competing hidden unit.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HiddenUnit {
    /// Visible cells within the receptive radius.
    pub feedforward: Vec<Connection>,
    /// Peer hidden units' previous state, self included.
    pub recurrent: Vec<Connection>,
    /// Competing peers, self excluded. Weights are always <= 0.
    pub inhibitory: Vec<Connection>,

    /// Homeostatic threshold, subtracted from the activation.
    pub bias: f32,

    pub activation: f32,
    pub state: f32,
    pub state_prev: f32,
    pub bit: f32,
    pub bit_prev: f32,

    /// This unit's previous state as reconstructed through peers' recurrent weights.
    pub reconstruction: f32,
}

#[derive(Debug, Clone)]
pub struct SparseCodingLayer {
    visible_size: GridSize,
    hidden_size: GridSize,

    receptive_radius: usize,
    inhibition_radius: usize,
    recurrent_radius: usize,

    pub(crate) visible: Vec<VisibleUnit>,
    pub(crate) hidden: Vec<HiddenUnit>,

    non_finite_resets: u64,
}

impl SparseCodingLayer {
    /// Allocate all units and connections with random, norm-scaled weights.
    ///
    /// Feedforward and recurrent weights are drawn from `[-1, 1)` and rescaled
    /// together to unit norm; inhibitory weights are drawn from `[-1, 0)` and
    /// rescaled to unit norm on their own.
    pub fn new<R: WeightRng>(
        visible_size: GridSize,
        hidden_size: GridSize,
        receptive_radius: usize,
        inhibition_radius: usize,
        recurrent_radius: usize,
        rng: &mut R,
    ) -> Result<Self> {
        visible_size.validate("visible")?;
        hidden_size.validate("hidden")?;

        let mut hidden = Vec::with_capacity(hidden_size.len());
        for hi in 0..hidden_size.len() {
            let (hx, hy) = hidden_size.coords(hi);
            let (cx, cy) = hidden_size.project(hx, hy, visible_size);

            let mut feedforward = connect(
                neighborhood(visible_size, cx, cy, receptive_radius, true),
                -1.0,
                1.0,
                rng,
            );
            let mut recurrent = connect(
                neighborhood(hidden_size, hx, hy, recurrent_radius, true),
                -1.0,
                1.0,
                rng,
            );
            normalize_jointly(&mut [feedforward.as_mut_slice(), recurrent.as_mut_slice()]);

            let mut inhibitory = connect(
                neighborhood(hidden_size, hx, hy, inhibition_radius, false),
                -1.0,
                0.0,
                rng,
            );
            if inhibitory.is_empty() && hidden_size.len() > 1 {
                return Err(HierarchyError::EmptyNeighborhood {
                    unit: hi,
                    radius: inhibition_radius,
                });
            }
            normalize_jointly(&mut [inhibitory.as_mut_slice()]);

            hidden.push(HiddenUnit {
                feedforward,
                recurrent,
                inhibitory,
                bias: 0.0,
                activation: 0.0,
                state: 0.0,
                state_prev: 0.0,
                bit: 0.0,
                bit_prev: 0.0,
                reconstruction: 0.0,
            });
        }

        Ok(Self {
            visible_size,
            hidden_size,
            receptive_radius,
            inhibition_radius,
            recurrent_radius,
            visible: vec![VisibleUnit::default(); visible_size.len()],
            hidden,
            non_finite_resets: 0,
        })
    }

    /// Compute activations, then resolve competition into states and bits.
    pub fn activate(&mut self) {
        let activations = self.compute_activations();
        for (u, a) in self.hidden.iter_mut().zip(activations) {
            u.activation = a;
        }

        let fired = self.compute_firing();
        for (u, (state, bit)) in self.hidden.iter_mut().zip(fired) {
            u.state = state;
            u.bit = bit;
        }
    }

    #[inline]
    fn activation_of(&self, i: UnitId) -> f32 {
        let u = &self.hidden[i];
        let drive = weighted_sum(&u.feedforward, |j| self.visible[j].input);
        let context = weighted_sum(&u.recurrent, |j| self.hidden[j].state_prev);
        drive + context - u.bias
    }

    #[inline]
    fn firing_of(&self, i: UnitId) -> (f32, f32) {
        let u = &self.hidden[i];
        let inhibition = gated_inhibition(&u.inhibitory, u.activation, |j| self.hidden[j].activation);
        fire(u.activation + inhibition)
    }

    #[cfg(not(feature = "parallel"))]
    fn compute_activations(&self) -> Vec<f32> {
        (0..self.hidden.len()).map(|i| self.activation_of(i)).collect()
    }

    #[cfg(feature = "parallel")]
    fn compute_activations(&self) -> Vec<f32> {
        (0..self.hidden.len())
            .into_par_iter()
            .map(|i| self.activation_of(i))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn compute_firing(&self) -> Vec<(f32, f32)> {
        (0..self.hidden.len()).map(|i| self.firing_of(i)).collect()
    }

    #[cfg(feature = "parallel")]
    fn compute_firing(&self) -> Vec<(f32, f32)> {
        (0..self.hidden.len())
            .into_par_iter()
            .map(|i| self.firing_of(i))
            .collect()
    }

    /// Renormalized reconstruction of the visible input and of the previous
    /// hidden state from the current hidden states.
    pub fn reconstruct(&mut self) {
        let mut visible_sums = vec![0.0f32; self.visible.len()];
        let mut visible_norms = vec![0.0f32; self.visible.len()];
        let mut hidden_sums = vec![0.0f32; self.hidden.len()];
        let mut hidden_norms = vec![0.0f32; self.hidden.len()];

        for u in &self.hidden {
            for c in &u.feedforward {
                visible_sums[c.index] += c.weight * u.state;
                visible_norms[c.index] += u.state;
            }
            for c in &u.recurrent {
                hidden_sums[c.index] += c.weight * u.state;
                hidden_norms[c.index] += u.state;
            }
        }

        for (v, (sum, norm)) in self
            .visible
            .iter_mut()
            .zip(visible_sums.into_iter().zip(visible_norms))
        {
            v.reconstruction = sum / norm.max(RECONSTRUCTION_FLOOR);
        }
        for (u, (sum, norm)) in self
            .hidden
            .iter_mut()
            .zip(hidden_sums.into_iter().zip(hidden_norms))
        {
            u.reconstruction = sum / norm.max(RECONSTRUCTION_FLOOR);
        }
    }

    /// Local learning: reconstruction-error descent on feedforward and
    /// recurrent weights for firing units, anti-Hebbian inhibition, and bias
    /// homeostasis toward `rates.sparsity`.
    ///
    /// Returns the number of weights/biases reset because they went non-finite.
    /// Non-finite rates skip the pass entirely.
    pub fn learn(&mut self, rates: SparseCodingRates) -> u64 {
        if !rates.is_finite() {
            tracing::warn!(?rates, "sparse coder: skipping learning with non-finite rates");
            return 0;
        }

        let visible_errors: Vec<f32> = self
            .visible
            .iter()
            .map(|v| v.input - v.reconstruction)
            .collect();
        let hidden_errors: Vec<f32> = self
            .hidden
            .iter()
            .map(|u| u.state_prev - u.reconstruction)
            .collect();
        let bits: Vec<f32> = self.hidden.iter().map(|u| u.bit).collect();

        let sparsity_squared = rates.sparsity * rates.sparsity;

        for u in &mut self.hidden {
            let bit = u.bit;

            if bit > 0.0 {
                for c in &mut u.feedforward {
                    c.weight += rates.feedforward * bit * visible_errors[c.index];
                }
                for c in &mut u.recurrent {
                    c.weight += rates.recurrent * bit * hidden_errors[c.index];
                }
            }

            for c in &mut u.inhibitory {
                let co_activation = bits[c.index] * bit;
                c.weight = (c.weight - rates.inhibitory * (co_activation - sparsity_squared)).min(0.0);
            }

            u.bias += rates.bias * (bit - rates.sparsity);
        }

        let resets = self.reset_non_finite();
        if resets > 0 {
            tracing::warn!(resets, "sparse coder: reset non-finite weights");
        }
        resets
    }

    fn reset_non_finite(&mut self) -> u64 {
        let mut resets = 0;
        for u in &mut self.hidden {
            let connections = u
                .feedforward
                .iter_mut()
                .chain(u.recurrent.iter_mut())
                .chain(u.inhibitory.iter_mut());
            for c in connections {
                if !c.weight.is_finite() {
                    c.weight = 0.0;
                    resets += 1;
                }
            }
            if !u.bias.is_finite() {
                u.bias = 0.0;
                resets += 1;
            }
        }
        self.non_finite_resets += resets;
        resets
    }

    /// Commit the current step: state → previous state, input → previous input.
    pub fn step_end(&mut self) {
        for v in &mut self.visible {
            v.input_prev = v.input;
        }
        for u in &mut self.hidden {
            u.state_prev = u.state;
            u.bit_prev = u.bit;
        }
    }

    #[inline]
    pub fn set_visible_input(&mut self, index: UnitId, value: f32) {
        self.visible[index].input = value;
    }

    #[inline]
    pub fn set_visible_input_xy(&mut self, x: usize, y: usize, value: f32) {
        let i = self.visible_size.index(x, y);
        self.visible[i].input = value;
    }

    #[inline]
    pub fn visible_input(&self, index: UnitId) -> f32 {
        self.visible[index].input
    }

    #[inline]
    pub fn visible_reconstruction(&self, index: UnitId) -> f32 {
        self.visible[index].reconstruction
    }

    #[inline]
    pub fn hidden_state(&self, index: UnitId) -> f32 {
        self.hidden[index].state
    }

    #[inline]
    pub fn hidden_state_xy(&self, x: usize, y: usize) -> f32 {
        self.hidden[self.hidden_size.index(x, y)].state
    }

    #[inline]
    pub fn hidden_state_prev(&self, index: UnitId) -> f32 {
        self.hidden[index].state_prev
    }

    #[inline]
    pub fn hidden_bit(&self, index: UnitId) -> f32 {
        self.hidden[index].bit
    }

    #[inline]
    pub fn hidden_bit_prev(&self, index: UnitId) -> f32 {
        self.hidden[index].bit_prev
    }

    pub fn visible(&self) -> &[VisibleUnit] {
        &self.visible
    }

    pub fn hidden(&self) -> &[HiddenUnit] {
        &self.hidden
    }

    pub fn visible_size(&self) -> GridSize {
        self.visible_size
    }

    pub fn hidden_size(&self) -> GridSize {
        self.hidden_size
    }

    pub fn receptive_radius(&self) -> usize {
        self.receptive_radius
    }

    pub fn inhibition_radius(&self) -> usize {
        self.inhibition_radius
    }

    pub fn recurrent_radius(&self) -> usize {
        self.recurrent_radius
    }

    /// Total weights/biases reset by the non-finite guard since construction.
    pub fn non_finite_resets(&self) -> u64 {
        self.non_finite_resets
    }

    /// Fraction of hidden units whose bit is set this step.
    pub fn active_fraction(&self) -> f32 {
        let active = self.hidden.iter().filter(|u| u.bit > 0.0).count();
        active as f32 / self.hidden.len() as f32
    }

    /// Mean squared difference between input and reconstruction.
    pub fn representation_error(&self) -> f32 {
        let sum: f32 = self
            .visible
            .iter()
            .map(|v| {
                let e = v.input - v.reconstruction;
                e * e
            })
            .sum();
        sum / self.visible.len() as f32
    }

    /// Feedforward weights of hidden unit `(hx, hy)` laid out as a
    /// `(2r+1) x (2r+1)` patch around its visible centre; cells outside the
    /// visible grid read 0.
    pub fn receptive_field(&self, hx: usize, hy: usize) -> Vec<f32> {
        let r = self.receptive_radius as isize;
        let dim = 2 * r + 1;
        let mut patch = vec![0.0; (dim * dim) as usize];

        let (cx, cy) = self.hidden_size.project(hx, hy, self.visible_size);
        let unit = &self.hidden[self.hidden_size.index(hx, hy)];
        for c in &unit.feedforward {
            let (vx, vy) = self.visible_size.coords(c.index);
            let px = vx as isize - cx as isize + r;
            let py = vy as isize - cy as isize + r;
            patch[(px + py * dim) as usize] = c.weight;
        }
        patch
    }
}
