//! Error types for the presentation layer

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The Vulkan loader library could not be opened
    #[error("Could not open the Vulkan library: {0}")]
    LibraryNotFound(String),

    /// A mandatory entry point could not be resolved for its tier
    #[error("Could not acquire proc: {0}")]
    ProcAddressNotFound(&'static str),

    /// Bring-up failed before a usable object could be produced
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
