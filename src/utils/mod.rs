//! Shared helpers.

pub mod serde;
pub mod unwind;
