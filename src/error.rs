//! Error handling for GPU generation
//!
//! Every failure a regeneration can report is a variant of [`GenError`].
//! None of them are fatal: pipelines keep their last ready state when a
//! regeneration fails.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the crate
pub type GenResult<T> = Result<T, GenError>;

#[derive(Debug, Error)]
pub enum GenError {
    #[error("Invalid dispatch grid {grid:?}: {reason}")]
    InvalidDispatch {
        grid: [u32; 3],
        reason: &'static str,
    },

    #[error("Invalid layout for region '{region}': {reason}")]
    InvalidLayout {
        region: String,
        reason: String,
    },

    #[error("Failed to allocate {size} bytes for '{label}': {reason}")]
    Allocation {
        label: String,
        size: u64,
        reason: String,
    },

    #[error("Kernel '{kernel}' failed to compile: {message}")]
    Compile {
        kernel: String,
        message: String,
    },

    #[error("Dispatch of '{kernel}' failed: {message}")]
    Dispatch {
        kernel: String,
        message: String,
    },

    #[error("Draw failed: {0}")]
    Draw(String),

    #[error("Texture '{path}' could not be loaded: {message}")]
    Texture {
        path: PathBuf,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GenError {
    /// Whether this error came from the GPU side rather than bad input
    pub fn is_gpu_failure(&self) -> bool {
        matches!(
            self,
            GenError::Allocation { .. } | GenError::Compile { .. } | GenError::Dispatch { .. }
        )
    }
}

impl From<toml::de::Error> for GenError {
    fn from(e: toml::de::Error) -> Self {
        GenError::Config(e.to_string())
    }
}

/// Helper trait for attaching a component label to foreign errors
pub trait GpuErrorContext<T> {
    fn gpu_context(self, component: &str) -> GenResult<T>;
}

impl<T, E> GpuErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn gpu_context(self, component: &str) -> GenResult<T> {
        self.map_err(|e| GenError::Dispatch {
            kernel: component.to_string(),
            message: e.to_string(),
        })
    }
}

impl<T> GpuErrorContext<T> for Option<T> {
    fn gpu_context(self, component: &str) -> GenResult<T> {
        self.ok_or_else(|| GenError::Dispatch {
            kernel: component.to_string(),
            message: "missing value".to_string(),
        })
    }
}

/// Create an allocation error for a labelled buffer
pub fn allocation_error(label: &str, size: u64, reason: impl std::fmt::Display) -> GenError {
    GenError::Allocation {
        label: label.to_string(),
        size,
        reason: reason.to_string(),
    }
}

/// Create a dispatch error for a kernel
pub fn dispatch_error(kernel: &str, message: impl std::fmt::Display) -> GenError {
    GenError::Dispatch {
        kernel: kernel.to_string(),
        message: message.to_string(),
    }
}
