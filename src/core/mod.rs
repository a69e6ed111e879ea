//! Core infrastructure: configuration, errors, runtime orchestration.

pub mod config;
pub mod error;
pub mod runtime;

pub use config::Config;
pub use error::{MeridianError, MeridianResult};
pub use runtime::Runtime;
