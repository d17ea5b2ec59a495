pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod model;
pub mod rendezvous;
pub mod session;
pub mod snapshot;

pub use client::InverterClient;
pub use config::{Config, ConfigError};
pub use coordinator::PollCoordinator;
pub use error::{RendezvousError, SessionError};
pub use model::{known_model_names, model_config, ModelConfig, ModelName};
pub use snapshot::Snapshot;
