use thiserror::Error;

/// Topology and configuration errors. All of them surface at construction.
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("{what} grid must be non-empty, got {width}x{height}")]
    InvalidDimensions {
        what: &'static str,
        width: usize,
        height: usize,
    },

    #[error("hidden unit {unit} has no inhibitory peers (radius {radius})")]
    EmptyNeighborhood {
        unit: usize,
        radius: usize,
    },

    #[error("sparsity must be in (0, 1), got {0}")]
    InvalidSparsity(f32),

    #[error("{name} must be finite and >= 0, got {value}")]
    InvalidRate { name: &'static str, value: f32 },

    #[error("a hierarchy needs at least one layer")]
    EmptyStack,

    #[error("layer {layer}: {source}")]
    Layer {
        layer: usize,
        #[source]
        source: Box<HierarchyError>,
    },

    #[cfg(feature = "serde")]
    #[error("layer stack json: {0}")]
    Json(#[from] serde_json::Error),
}

impl HierarchyError {
    pub(crate) fn in_layer(self, layer: usize) -> Self {
        HierarchyError::Layer {
            layer,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = core::result::Result<T, HierarchyError>;
