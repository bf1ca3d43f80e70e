//! Shared utilities.
//!
//! Path normalization helpers and test helpers.

pub mod path;

#[cfg(test)]
pub mod testutil;
