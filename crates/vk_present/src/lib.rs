//! # vk_present
//!
//! Vulkan bring-up and frame presentation for embedders that render through
//! an external context (e.g. Skia) but leave instance, device, swapchain
//! and present scheduling to this crate.
//!
//! ## Features
//!
//! - **Three-Tier Proc Table**: Loader, instance, and device function
//!   resolution with per-tier validity
//! - **RAII Handles**: Destruction-order-safe wrappers with ownership
//!   release for handing handles to other systems
//! - **Swapchain Lifecycle**: Wholesale recreation on resize and
//!   out-of-date reports, seeded with the previous swapchain
//! - **Batched Presentation**: Multiple rendering threads enqueue frames;
//!   one coordinator presents them in a single batch gated by a rotating
//!   shared-fence pool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vk_present::{
//!     GpuConfig, GpuContext, RenderContext, RenderContextDescriptor,
//!     RenderContextFactory, Window,
//! };
//!
//! struct NoopContext;
//! impl RenderContext for NoopContext {}
//!
//! struct NoopFactory;
//! impl RenderContextFactory for NoopFactory {
//!     fn create(&self, _: &RenderContextDescriptor<'_>) -> Option<Box<dyn RenderContext>> {
//!         Some(Box::new(NoopContext))
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GpuConfig::default().with_env_overrides();
//!     let context = GpuContext::initialize(&config, &[])?;
//!     let mut window = Window::new(Arc::clone(&context), None, true, &NoopFactory)?;
//!     assert!(window.is_valid());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::missing_errors_doc)]

pub mod application;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod handle;
pub mod proc_table;
pub mod surface;
pub mod swapchain;
pub mod window;

pub use application::Application;
pub use config::{ApiVersion, ConfigError, GpuConfig};
pub use context::{
    GpuContext, RenderContext, RenderContextDescriptor, RenderContextFactory,
};
pub use device::Device;
pub use error::{VulkanError, VulkanResult};
pub use handle::VulkanHandle;
pub use proc_table::{ProcResolver, ProcTable};
pub use surface::{NativeSurface, RawWindowSurface, Surface};
pub use swapchain::{AcquireStatus, Drawable, PresentQueue, Swapchain};
pub use window::Window;
