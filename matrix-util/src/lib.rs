pub mod dmatrix_util;
pub mod nnls;
pub mod tensor_util;
pub mod traits;
pub mod utils;
