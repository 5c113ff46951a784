use crate::dtypes::{DType, StateMode};

/// Represents a number of different errors that can occur from creating tensors
/// or launching scan operations.
///
/// Every variant is detected at pass entry, before any work is dispatched; a
/// failed call never hands back partial results.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Device is out of memory
    OutOfMemory,
    /// Not enough elements were provided when creating a tensor
    WrongNumElements,
    /// A tensor's extents disagree with the rest of the pass.
    ShapeMismatch {
        tensor: &'static str,
        expected: String,
        found: Vec<usize>,
    },
    /// The element type is outside the supported precision matrix, or differs
    /// from the precision of the rest of the pass.
    UnsupportedPrecision { tensor: &'static str, dtype: DType },
    /// `tensor` cannot serve a pass whose hidden state is `mode`: complex passes need
    /// paired `(re, im)` storage, real passes must not have it.
    UnsupportedVariant {
        tensor: &'static str,
        mode: StateMode,
    },
    /// The saved trajectory handed to the backward pass was not produced by a forward
    /// pass over the given inputs.
    InconsistentTrajectory { reason: String },
    /// A transition parameter would make the discrete transition grow, or a value is
    /// not finite. Only reported under [crate::scan_ops::discretize::StabilityCheck::Strict].
    NumericInstability { tensor: &'static str, index: usize },
    /// The chunk size of a scan must be at least one step.
    ZeroChunkSize,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn shape(
        tensor: &'static str,
        expected: impl std::fmt::Debug,
        found: &[usize],
    ) -> Self {
        Self::ShapeMismatch {
            tensor,
            expected: format!("{expected:?}"),
            found: found.to_vec(),
        }
    }

    pub(crate) fn layout(tensor: &'static str, expected: &str, found: &[usize]) -> Self {
        Self::ShapeMismatch {
            tensor,
            expected: expected.to_string(),
            found: found.to_vec(),
        }
    }
}
