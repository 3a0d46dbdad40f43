//! Test doubles for exercising run orchestration without a container runtime.

mod backend;

pub use backend::InMemoryBackend;
