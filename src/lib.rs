pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod training;

pub use config::FullConfig;
pub use error::{ConfigError, DataError, ModelError, TrainError};
pub use model::{Architecture, ArgumentNet, NetworkConfig};
