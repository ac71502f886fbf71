//! Crate-wide error type.
//!
//! Every fallible operation returns `Result<_, CovError>`. The binary maps the
//! variant to a process exit code via [`CovError::exit_code`].
//!
//! Only [`CovError::DegenerateGeometry`] is recoverable: the combinator turns it
//! into a zero correction plus a warning. Everything else aborts the run before
//! any output is written.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CovError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("missing tabulated kernel '{table}' for mode {mode}")]
    MissingTabulatedKernel { table: String, mode: usize },

    #[error("degenerate geometry in bin {bin}: {reason}")]
    DegenerateGeometry { bin: usize, reason: String },

    #[error("assembly inconsistency: {0}")]
    AssemblyInconsistency(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("run cancelled")]
    Cancelled,
}

impl CovError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    pub fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical(message.into())
    }

    /// Process exit code for the `lsscov` binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) | Self::Io(_) => 2,
            Self::MissingTabulatedKernel { .. } => 3,
            Self::DegenerateGeometry { .. } | Self::AssemblyInconsistency(_) | Self::Numerical(_) => 4,
            Self::Cancelled => 5,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DegenerateGeometry { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_degenerate_geometry_is_recoverable() {
        let degenerate = CovError::DegenerateGeometry {
            bin: 3,
            reason: "empty".to_string(),
        };
        assert!(degenerate.is_recoverable());
        assert!(!CovError::config("bad").is_recoverable());
        assert!(!CovError::Cancelled.is_recoverable());
    }

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(CovError::config("x").exit_code(), 2);
        assert_eq!(
            CovError::MissingTabulatedKernel {
                table: "Wn_1.table".into(),
                mode: 1
            }
            .exit_code(),
            3
        );
        assert_eq!(CovError::AssemblyInconsistency("x".into()).exit_code(), 4);
        assert_eq!(CovError::Cancelled.exit_code(), 5);
    }

    #[test]
    fn messages_name_the_offending_item() {
        let err = CovError::MissingTabulatedKernel {
            table: "Tplus_2.table".into(),
            mode: 2,
        };
        assert!(err.to_string().contains("Tplus_2.table"));
    }
}
