//! # strata
//!
//! An online, unsupervised sparse predictive hierarchy.
//!
//! Each layer is a sparse coder: hidden units compete through learned lateral
//! inhibition to represent the layer below with a small set of active units.
//! Prediction units on top of each layer forecast that layer's next hidden
//! state, top-down, and the bottom layer's prediction is projected back into
//! input space. All learning is local and happens one timestep at a time.
//!
//! ## Quick Start
//!
//! ```
//! use strata::prelude::*;
//!
//! let configs = [
//!     LayerConfig::with_size(8, 8).with_radii(2, 2, 2, 2, 2),
//!     LayerConfig::with_size(4, 4).with_radii(2, 2, 2, 2, 2),
//! ];
//! let mut rng = Prng::new(42);
//! let mut hierarchy = PredictiveHierarchy::new(GridSize::new(8, 8), &configs, &mut rng)?;
//!
//! for t in 0..16 {
//!     hierarchy.set_input_xy(t % 8, 0, 1.0);
//!     hierarchy.update();
//!     hierarchy.learn(1.0);
//!     hierarchy.step_end();
//! }
//!
//! let next = hierarchy.prediction_xy(0, 0);
//! assert!(next.is_finite());
//! # Ok::<(), HierarchyError>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization of configs, units and snapshots, and
//!   JSON layer stacks via `serde_json`
//! - `parallel`: compute hidden-unit activations across threads via rayon
//!
//! ## Modules
//!
//! - [`sparse_coder`]: one sparse coding layer, usable standalone
//! - [`hierarchy`]: the stacked predictive hierarchy
//! - [`config`]: layer configuration and learning rates
//! - [`grid`]: grid geometry and connection helpers
//! - [`observer`]: read-only observation adapters

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/grid.rs"]
pub mod grid;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/sparse_coder.rs"]
pub mod sparse_coder;

#[path = "core/hierarchy.rs"]
pub mod hierarchy;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use strata::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{LayerConfig, SparseCodingRates};
    pub use crate::error::HierarchyError;
    pub use crate::grid::{Connection, GridSize, UnitId};
    pub use crate::hierarchy::{Layer, PredictionUnit, PredictiveHierarchy};
    pub use crate::observer::{HierarchyAdapter, HierarchySnapshot, LayerSnapshot};
    pub use crate::prng::{Prng, WeightRng};
    pub use crate::sparse_coder::{HiddenUnit, SparseCodingLayer, VisibleUnit};
}
