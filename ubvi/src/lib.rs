//! Universal boosting variational inference with the Hellinger
//! distance.
//!
//! An unnormalized target `f` is approximated by a square-root mixture
//! `q ∝ (Σ_i λ_i sqrt(g_i))²`, grown greedily one component per round.
//! After every addition all weights `λ` are re-solved by non-negative
//! least squares over the component overlap matrix.
//!
//! # References
//!
//! Campbell & Li (2019). "Universal Boosting Variational Inference."
//! NeurIPS.

pub mod boosting;
pub mod common;
pub mod engine;
pub mod gaussian;
pub mod optim;
pub mod targets;
pub mod traits;
