//! Engine-wide configuration.
//!
//! All tunable constants live in [`constants`]; import them from here
//! rather than redefining values locally.

mod constants;

pub use constants::*;

/// Rounds `n` up to the next multiple of 8, the alignment of log entries
/// and record images.
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}
