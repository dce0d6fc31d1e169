pub mod config;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod infer;
pub mod kalman;
pub mod model;
pub mod records;
pub mod relation_map;
pub mod train;

/// CPU backend used for inference and validation passes.
pub type NdBackend = burn::backend::NdArray<f32>;
/// Autodiff wrapper over the CPU backend, used for training.
pub type TrainBackend = burn::backend::Autodiff<NdBackend>;
