//! Per-window presentation orchestration
//!
//! A [`Window`] ties one native surface to the shared [`GpuContext`]: it
//! owns the surface and current swapchain, builds the embedder's rendering
//! context, and drives the acquire/recreate/present state machine. Windows
//! start valid and stay valid until an unrecoverable presentation failure,
//! after which every frame operation declines.

use std::sync::Arc;

use crate::context::{GpuContext, RenderContext, RenderContextFactory};
use crate::error::{VulkanError, VulkanResult};
use crate::surface::{NativeSurface, Surface};
use crate::swapchain::{AcquireStatus, Drawable, Swapchain};

/// Terminal outcomes of the acquire/recreate loop.
enum AcquireLoopResult<D> {
    Acquired(D),
    SurfaceLost,
    RecreationFailed,
}

/// The acquire state machine, generic over the acquiring object so it can
/// run against a mock chain as well as a live swapchain.
///
/// Out-of-date surfaces trigger one recreation per report and a retry,
/// without bound; lost surfaces and failed recreations terminate the loop.
fn run_acquire_loop<C, D>(
    ctx: &mut C,
    mut acquire: impl FnMut(&mut C) -> (AcquireStatus, Option<D>),
    mut recreate: impl FnMut(&mut C) -> bool,
) -> AcquireLoopResult<D> {
    loop {
        match acquire(ctx) {
            (AcquireStatus::Success, Some(drawable)) => {
                return AcquireLoopResult::Acquired(drawable);
            }
            (AcquireStatus::Success, None) | (AcquireStatus::ErrorSurfaceLost, _) => {
                return AcquireLoopResult::SurfaceLost;
            }
            (AcquireStatus::ErrorSurfaceOutOfDate, _) => {
                if !recreate(ctx) {
                    return AcquireLoopResult::RecreationFailed;
                }
            }
        }
    }
}

/// One presentable window over the shared GPU context.
///
/// Field order matters: the swapchain must drop before the surface it was
/// built on, and both before the context drops its `Arc` reference.
pub struct Window {
    swapchain: Option<Swapchain>,
    surface: Option<Surface>,
    render_context: Arc<dyn RenderContext>,
    context: Arc<GpuContext>,
    valid: bool,
}

impl Window {
    /// Build a window.
    ///
    /// Offscreen windows skip the surface and swapchain but still build the
    /// rendering context. Onscreen windows require a valid native surface;
    /// any bring-up failure, including the factory declining, errors out and
    /// nothing partial is left behind.
    pub fn new(
        context: Arc<GpuContext>,
        native_surface: Option<Box<dyn NativeSurface>>,
        offscreen: bool,
        render_context_factory: &dyn RenderContextFactory,
    ) -> VulkanResult<Self> {
        let descriptor = context.render_context_descriptor();
        let render_context: Arc<dyn RenderContext> = render_context_factory
            .create(&descriptor)
            .map(Arc::from)
            .ok_or_else(|| {
                VulkanError::InitializationFailed(
                    "Render context factory declined the device".to_string(),
                )
            })?;

        if offscreen {
            return Ok(Self {
                swapchain: None,
                surface: None,
                render_context,
                context,
                valid: true,
            });
        }

        let native_surface = native_surface.ok_or_else(|| {
            VulkanError::InitializationFailed(
                "Onscreen window constructed without a native surface".to_string(),
            )
        })?;
        let surface = Surface::new(
            context.proc_table(),
            context.application(),
            native_surface,
        )?;

        let mut window = Self {
            swapchain: None,
            surface: Some(surface),
            render_context,
            context,
            valid: true,
        };
        window.recreate_swapchain()?;
        Ok(window)
    }

    /// Whether the window can still present.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The size of the current swapchain, or zero for offscreen windows.
    pub fn size(&self) -> (u32, u32) {
        self.swapchain.as_ref().map_or((0, 0), Swapchain::size)
    }

    /// The rendering context built at construction.
    pub fn render_context(&self) -> &Arc<dyn RenderContext> {
        &self.render_context
    }

    /// Acquire the next drawable, recreating the swapchain as needed.
    ///
    /// A native surface that has resized is handled proactively: the
    /// swapchain is recreated before acquisition rather than after the
    /// driver reports it out of date. Returns `None`, and invalidates the
    /// window, on surface loss or a failed recreation.
    pub fn acquire_surface(&mut self) -> Option<Drawable> {
        if !self.valid || self.swapchain.is_none() {
            return None;
        }

        if self.surface_size_changed() && self.recreate_swapchain().is_err() {
            log::error!("Could not recreate swapchain for a resized surface");
            self.valid = false;
            return None;
        }

        let result = run_acquire_loop(
            self,
            |window| match window.swapchain.as_mut() {
                Some(swapchain) => swapchain.acquire_surface(),
                None => (AcquireStatus::ErrorSurfaceLost, None),
            },
            |window| window.recreate_swapchain().is_ok(),
        );

        match result {
            AcquireLoopResult::Acquired(drawable) => Some(drawable),
            AcquireLoopResult::SurfaceLost => {
                log::error!("Surface lost; window can no longer present");
                self.valid = false;
                None
            }
            AcquireLoopResult::RecreationFailed => {
                log::error!("Swapchain recreation failed; window can no longer present");
                self.valid = false;
                None
            }
        }
    }

    /// Finish the current frame.
    ///
    /// On the device thread the image is presented immediately. On any other
    /// thread it is enqueued for the next [`GpuContext::present_all`] batch
    /// and its commands are flushed. Returns false for invalid or offscreen
    /// windows, or when submission fails.
    pub fn swap_buffers(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        let on_device_thread = self.context.is_device_thread();
        let Some(swapchain) = self.swapchain.as_mut() else {
            return false;
        };

        let submitted = if on_device_thread {
            swapchain.submit()
        } else {
            swapchain.add_to_present();
            swapchain.flush_commands().map(|_| ())
        };
        match submitted {
            Ok(()) => true,
            Err(e) => {
                log::error!("Frame submission failed: {e}");
                false
            }
        }
    }

    /// Present every enqueued frame as one batch. See
    /// [`GpuContext::present_all`].
    pub fn present_all(&self) -> VulkanResult<()> {
        self.context.present_all()
    }

    /// Wait for the outstanding present batch. See
    /// [`GpuContext::wait_for_shared_fence`].
    pub fn wait_for_shared_fence(&self) -> bool {
        self.context.wait_for_shared_fence()
    }

    /// Reset the outstanding present's fence. See
    /// [`GpuContext::reset_shared_fence`].
    pub fn reset_shared_fence(&self) -> bool {
        self.context.reset_shared_fence()
    }

    fn surface_size_changed(&self) -> bool {
        let (Some(surface), Some(swapchain)) = (self.surface.as_ref(), self.swapchain.as_ref())
        else {
            return false;
        };
        let current = surface.size();
        current != (0, 0) && current != swapchain.size()
    }

    /// Replace the swapchain wholesale, seeding the new one with the old
    /// for resource hand-off. The old swapchain is taken out first so a
    /// failed recreation never leaves two live swapchains.
    fn recreate_swapchain(&mut self) -> VulkanResult<()> {
        let previous = self.swapchain.take();
        let surface = self.surface.as_ref().ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: "Offscreen window has no swapchain to recreate".to_string(),
            }
        })?;

        let swapchain = Swapchain::new(
            self.context.proc_table(),
            self.context.device(),
            surface,
            Arc::clone(&self.render_context),
            previous,
            self.context.device().graphics_queue_index(),
            self.context.present_queue(),
        )?;
        self.swapchain = Some(swapchain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockChain {
        responses: Vec<(AcquireStatus, Option<u32>)>,
        recreations: usize,
        recreate_succeeds: bool,
    }

    impl MockChain {
        fn new(responses: Vec<(AcquireStatus, Option<u32>)>) -> Self {
            Self {
                responses,
                recreations: 0,
                recreate_succeeds: true,
            }
        }

        fn next(&mut self) -> (AcquireStatus, Option<u32>) {
            if self.responses.is_empty() {
                (AcquireStatus::ErrorSurfaceLost, None)
            } else {
                self.responses.remove(0)
            }
        }
    }

    fn drive(chain: &mut MockChain) -> AcquireLoopResult<u32> {
        run_acquire_loop(
            chain,
            MockChain::next,
            |chain| {
                chain.recreations += 1;
                chain.recreate_succeeds
            },
        )
    }

    #[test]
    fn test_out_of_date_recreates_once_per_report_then_succeeds() {
        let mut chain = MockChain::new(vec![
            (AcquireStatus::ErrorSurfaceOutOfDate, None),
            (AcquireStatus::ErrorSurfaceOutOfDate, None),
            (AcquireStatus::ErrorSurfaceOutOfDate, None),
            (AcquireStatus::Success, Some(7)),
        ]);

        let result = drive(&mut chain);
        assert!(matches!(result, AcquireLoopResult::Acquired(7)));
        assert_eq!(chain.recreations, 3);
    }

    #[test]
    fn test_surface_lost_terminates_without_recreation() {
        let mut chain = MockChain::new(vec![(AcquireStatus::ErrorSurfaceLost, None)]);

        let result = drive(&mut chain);
        assert!(matches!(result, AcquireLoopResult::SurfaceLost));
        assert_eq!(chain.recreations, 0);
    }

    #[test]
    fn test_failed_recreation_terminates_the_loop() {
        let mut chain = MockChain::new(vec![
            (AcquireStatus::ErrorSurfaceOutOfDate, None),
            (AcquireStatus::Success, Some(1)),
        ]);
        chain.recreate_succeeds = false;

        let result = drive(&mut chain);
        assert!(matches!(result, AcquireLoopResult::RecreationFailed));
        assert_eq!(chain.recreations, 1);
    }

    #[test]
    fn test_success_without_drawable_is_treated_as_lost() {
        let mut chain = MockChain::new(vec![(AcquireStatus::Success, None)]);

        let result = drive(&mut chain);
        assert!(matches!(result, AcquireLoopResult::SurfaceLost));
    }
}
