use std::fmt;
use std::path::PathBuf;

/// Failures the refinement engine distinguishes from ordinary I/O or
/// tensor errors. They travel inside `anyhow::Error` and are recovered
/// with `downcast_ref` where a policy depends on the kind.
#[derive(Debug, Clone, PartialEq)]
pub enum RefineError {
    /// Malformed ratio, non-positive counts, mismatched shapes
    InvalidParameter(String),
    /// A refined loc or scale became non-finite
    NumericInstability {
        tensor: String,
        member: Option<usize>,
    },
    /// Checkpoint write/read failure
    Persistence { path: PathBuf, reason: String },
}

impl RefineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        RefineError::InvalidParameter(msg.into())
    }

    pub fn non_finite(tensor: impl Into<String>) -> Self {
        RefineError::NumericInstability {
            tensor: tensor.into(),
            member: None,
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        RefineError::Persistence {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Attach the ensemble member index to a numeric failure.
    pub fn in_member(self, index: usize) -> Self {
        match self {
            RefineError::NumericInstability { tensor, .. } => RefineError::NumericInstability {
                tensor,
                member: Some(index),
            },
            other => other,
        }
    }
}

impl fmt::Display for RefineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefineError::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            RefineError::NumericInstability {
                tensor,
                member: Some(m),
            } => write!(
                f,
                "non-finite values in tensor `{}` (ensemble member {})",
                tensor, m
            ),
            RefineError::NumericInstability {
                tensor,
                member: None,
            } => write!(f, "non-finite values in tensor `{}`", tensor),
            RefineError::Persistence { path, reason } => {
                write!(f, "checkpoint {:?}: {}", path, reason)
            }
        }
    }
}

impl std::error::Error for RefineError {}
