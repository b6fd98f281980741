// This module contains the worker registry and the pairing algorithm.
pub mod registry;

// This module contains the control endpoint and the duration supervisor.
pub mod server;

// Re-exports.
pub use registry::{Registry, WorkerRecord};
pub use server::Server;
