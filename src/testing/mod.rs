//! Testing utilities and mock implementations
//!
//! In-memory connector and broker for exercising the client without a
//! network or a real Blynk server.

pub mod mocks;

pub use mocks::*;
