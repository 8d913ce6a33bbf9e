use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error("shape {shape:?} needs {expected} elements, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("cannot concatenate along axis {axis}: {reason}")]
    Concatenate { axis: usize, reason: String },

    #[error("index {index} is out of bounds for axis {axis} with size {size}")]
    IndexOutOfBounds { index: i64, axis: usize, size: usize },

    #[error("too many indices: tensor is {ndim}-dimensional, got {given}")]
    TooManyIndices { ndim: usize, given: usize },

    #[error("slice step cannot be zero")]
    ZeroStep,

    #[error("boolean mask of length {mask} does not match axis {axis} of size {size}")]
    MaskLength { mask: usize, axis: usize, size: usize },

    #[error("unsupported value type: {0}")]
    TypeMismatch(String),

    #[error("nothing to merge")]
    Empty,

    #[error("codec error: {0}")]
    Codec(String),
}
