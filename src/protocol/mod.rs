//! Blynk wire protocol: command codes and frame codec
//!
//! Pure encode/decode of the binary framing used between the device and the
//! cloud broker. No I/O and no connection state live here.

pub mod commands;
pub mod frame;

pub use commands::{status, Command};
pub use frame::{decode, Frame, FrameError, Header, Payload, HEADER_SIZE};
