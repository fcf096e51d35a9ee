#![allow(dead_code)]

pub use log::{debug, info, warn};

pub use matrix_util::dmatrix_util::*;
pub use matrix_util::tensor_util::*;
pub use matrix_util::traits::*;
pub use matrix_util::utils::*;

pub use candle_core::{DType, Device, IndexOp, Tensor, Var};

pub use rand::rngs::SmallRng;
pub use rand::{Rng, SeedableRng};

pub type Mat = nalgebra::DMatrix<f64>;
pub type DVec = nalgebra::DVector<f64>;

/// Floor applied to mixture weights before taking logs
pub const MIN_WEIGHT: f64 = 1e-64;
