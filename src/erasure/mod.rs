//! Erasure-coded striping of byte streams
//!
//! Source data is consumed in rounds of `k * packet_size` bytes. Each round
//! is encoded into `n` packets, one appended to each stripe, and any `k`
//! stripes reconstruct the source.

mod code;
mod striper;

pub use code::{ErasureCode, ReedSolomonCode};
pub use striper::{stripe_len, Striper};

/// Default packet size in bytes
pub const DEFAULT_PACKET_SIZE: usize = 10240;

/// Largest stripe count supported by the GF(2^8) code
pub const MAX_STRIPES: usize = 256;
