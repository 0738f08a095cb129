mod registry;

pub use registry::{DimensionLimits, DimensionPolicy, ModelRegistry, ModelSpec};
