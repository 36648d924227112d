//! Sampling strategies
//!
//! A [`Sampler`] turns the logits of the last evaluated position into one
//! token. The [`CandidateSet`] transforms it chains together (top-k, tail
//! free, locally typical, top-p, temperature, mirostat) narrow the
//! vocabulary but never empty it.

mod candidates;
mod mirostat;
mod sampler;

pub use candidates::{CandidateSet, TokenData};
pub use mirostat::{MirostatState, MIROSTAT_M};
pub use sampler::Sampler;
