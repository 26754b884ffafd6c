pub mod candle_bnn_mlp;
pub mod candle_inference;
pub mod candle_linalg;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_param_map;
pub mod candle_rng_key;
pub mod cli;
pub mod fsvi;

pub use candle_core;
pub use candle_nn;
