//! NaN / Inf checks for intermediate tensors

use tch::Tensor;

use crate::error::{PpoError, Result};

/// Fail with [`PpoError::Numerical`] if `tensor` holds any NaN or Inf
///
/// # Arguments
/// * `tensor` - Tensor to inspect (any shape)
/// * `name` - Name reported in the error
pub fn check_numerics(tensor: &Tensor, name: &str) -> Result<()> {
    let all_finite = f64::try_from(tensor.isfinite().all())?;
    if all_finite == 0.0 {
        return Err(PpoError::Numerical { name: name.to_string() });
    }
    Ok(())
}
