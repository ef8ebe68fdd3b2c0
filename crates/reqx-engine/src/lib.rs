// Library exports for the CLI and the integration tests

// ===== Rule model and configuration =====
pub mod config;
pub mod matcher;

// ===== Request interception =====
pub mod engine;
pub mod pipeline;
pub mod session;

// ===== Declarative rule layer =====
pub mod cookie;
pub mod fast_path;

// ===== Host seams and transport =====
pub mod host;
pub mod transport;

pub mod error;
pub mod metrics;

pub use engine::Engine;
pub use error::EngineError;
