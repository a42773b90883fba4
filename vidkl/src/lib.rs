pub mod cli;
pub mod distributions;
pub mod embedding;
pub mod guide;
pub mod kernels;
pub mod linalg;
pub mod model;
pub mod posterior;
pub mod priors;
pub mod svi;
pub mod trace;
pub mod vidkl;

pub use embedding::{FeatureExtractor, Mlp, NetworkParams, PREDICTION_SEED};
pub use guide::InferenceStrategy;
pub use kernels::{KernelKind, KernelParams};
pub use priors::{GaussianLatentPrior, KernelPrior, LatentPrior, LogNormalKernelPrior};
pub use trace::Trace;
pub use vidkl::{DklConfig, FitArgs, FittedState, ViDkl};

pub use candle_core;
pub use candle_nn;
