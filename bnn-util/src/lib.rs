pub mod bayes_dense;
pub mod bayes_mlp;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod likelihood;
pub mod metrics;
pub mod refine;
pub mod trainer;

pub use candle_core;
pub use candle_nn;
