pub mod builder;
pub mod chain;
pub mod config;
pub mod error;
pub mod hit;
pub mod jsonrpc;
pub mod merkle;
pub mod resolver;
pub mod scanner;
pub mod script;
pub mod spv;
pub mod types;

#[cfg(test)]
mod testing;

pub extern crate bitcoin;
pub extern crate hex;

pub use config::RelayConfig;
pub use error::{BuildError, Error};

pub fn err_string(err: impl std::fmt::Display) -> String {
    err.to_string()
}

/// Byte-reversed copy of a 32-byte hash, converting between display (big-endian)
/// order and the internal (little-endian) order used on the wire.
pub fn reversed(bytes: &[u8; 32]) -> [u8; 32] {
    let mut out = *bytes;
    out.reverse();
    out
}
