// Library exports for embedding and testing
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::{Engine, EngineDeps};
pub use error::{IapError, Result};
