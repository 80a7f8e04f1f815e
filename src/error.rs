//! Crate-wide error type.
//!
//! Structural problems (sample order, dimensions, group layout, batch size) are
//! fatal and surface as a `QtlError` before any batch runs. Per-variant and
//! per-permutation numerical problems never reach this type: they are
//! sentineled or flagged on the record that produced them.

use std::path::PathBuf;
use thiserror::Error;

use bed_reader::BedErrorPlus;

#[derive(Error, Debug)]
pub enum QtlError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Inputs that cannot be mapped at all (sample order mismatch, discontiguous groups, missing companion data)
    #[error("Input validation failed: {message}")]
    InputValidation { message: String },

    /// Covariate design without full column rank
    #[error("Degenerate design: {message}")]
    DegenerateDesign { message: String },

    /// Requested batch would not fit the configured memory budget
    #[error("Resource limit exceeded: {message}")]
    Resource { message: String },

    /// Invalid configuration values
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Malformed text input
    #[error("Parse error in {} at line {line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// PLINK decoding errors
    #[error("PLINK error: {0}")]
    Plink(String),
}

pub type Result<T> = std::result::Result<T, QtlError>;

impl QtlError {
    pub fn input_validation(message: impl Into<String>) -> Self {
        Self::InputValidation {
            message: message.into(),
        }
    }

    pub fn degenerate_design(message: impl Into<String>) -> Self {
        Self::DegenerateDesign {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

impl From<Box<BedErrorPlus>> for QtlError {
    fn from(e: Box<BedErrorPlus>) -> Self {
        Self::Plink(e.to_string())
    }
}

impl From<ndarray::ShapeError> for QtlError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::InputValidation {
            message: format!("matrix shape error: {}", e),
        }
    }
}
