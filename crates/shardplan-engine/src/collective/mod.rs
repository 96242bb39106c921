//! Communication backends

pub mod local;

pub use local::{LocalCommunicator, LocalHub, DEFAULT_TIMEOUT};
