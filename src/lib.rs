pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod gate;
pub mod ports;
pub mod recent;
pub mod request;
pub mod store;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{CancelAck, MutationEngine, MutationState, PendingAck, Submission};
pub use error::ErrorKind;
pub use gate::Token;
pub use request::{FieldError, MutationRequest, MutationResult};
