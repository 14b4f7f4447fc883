use thiserror::Error;

/// Errors raised by the diffusion core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DdpmError {
    #[error("invalid noise schedule (beta1={beta1}, beta2={beta2}, n_t={n_t}): expected 0 < beta1 < beta2 < 1 and n_t >= 1")]
    InvalidSchedule { beta1: f64, beta2: f64, n_t: usize },
    #[error("{context}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("label {label} is outside [0, {n_classes})")]
    InvalidLabel { label: i64, n_classes: usize },
    #[error("context mask values must be exactly 0 or 1, got {value}")]
    InvalidContextMask { value: f32 },
    #[error("timestep {timestep} is outside [1, {n_t}]")]
    InvalidTimestep { timestep: usize, n_t: usize },
    #[error("n_sample={n_sample} is not a positive multiple of n_classes={n_classes}")]
    SampleCountNotMultiple { n_sample: usize, n_classes: usize },
    #[error("context drop probability must be in [0, 1], got {0}")]
    InvalidDropProbability(f64),
    #[error("image size {0} must be a positive multiple of 4")]
    InvalidImageSize(usize),
    #[error("feature width {0} must be a positive multiple of 8")]
    InvalidFeatureWidth(usize),
    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: String, reason: String },
}

pub(crate) fn ensure_dims<const D: usize>(
    context: &'static str,
    expected: [usize; D],
    actual: [usize; D],
) -> Result<(), DdpmError> {
    if expected == actual {
        Ok(())
    } else {
        Err(DdpmError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}
