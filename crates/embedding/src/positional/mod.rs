//! Position-dependent embedding schemes.

pub mod encoder;
pub mod rope;
