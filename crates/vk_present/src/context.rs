//! One-time GPU bring-up and cross-window present coordination
//!
//! [`GpuContext`] owns the proc table, instance and device, plus the two
//! pieces of state that multi-window presentation shares: the pending-present
//! queue and the rotating shared-fence pool. It is constructed once and
//! handed to every [`crate::window::Window`] behind an `Arc`.

use ash::vk;
use std::ffi::CStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;

use crate::application::Application;
use crate::config::GpuConfig;
use crate::device::Device;
use crate::error::{VulkanError, VulkanResult};
use crate::handle::VulkanHandle;
use crate::proc_table::{ProcResolver, ProcTable};
use crate::swapchain::{PresentQueue, Swapchain};

/// Opaque external rendering state (e.g. a Skia context).
///
/// The presentation layer never calls into it; it only guarantees the
/// context outlives every swapchain image handed out under it.
pub trait RenderContext {}

/// Builds the embedder's [`RenderContext`] during window construction.
pub trait RenderContextFactory {
    /// Build a rendering context over the described device, or `None` when
    /// the embedder cannot (which invalidates window construction).
    fn create(&self, descriptor: &RenderContextDescriptor<'_>)
        -> Option<Box<dyn RenderContext>>;
}

/// Everything an external renderer needs to drive the device this crate
/// brought up. The handles stay owned by the [`GpuContext`].
pub struct RenderContextDescriptor<'a> {
    /// The live instance
    pub instance: vk::Instance,
    /// The selected physical device
    pub physical_device: vk::PhysicalDevice,
    /// The logical device
    pub device: vk::Device,
    /// The graphics queue
    pub queue: vk::Queue,
    /// Family index of `queue`
    pub queue_family_index: u32,
    /// Instance API version
    pub api_version: u32,
    /// Names of the instance extensions enabled at bring-up
    pub enabled_extensions: &'a [&'static CStr],
    /// Features of the selected physical device
    pub features: vk::PhysicalDeviceFeatures,
    /// Resolver for any proc the renderer needs beyond the handles above
    pub proc_resolver: Option<ProcResolver>,
    /// Always false: this crate keeps ownership of instance and device
    pub owns_instance_and_device: bool,
}

/// Rotating fence pool shared by every presenting window.
///
/// Bookkeeping only; the fence backend is injected so the rotation protocol
/// is testable without a device. A present hands out the current slot's
/// fence and then advances, so wait and reset operate on the slot of an
/// earlier batch and up to one batch per slot is in flight at once.
pub(crate) struct SharedFencePool<F> {
    slots: Vec<Option<F>>,
    index: usize,
    presenting: bool,
}

impl<F> SharedFencePool<F> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: 0,
            presenting: false,
        }
    }

    /// Hand out the current slot's fence, creating it on first use, then
    /// advance to the next slot and mark the pool presenting.
    pub(crate) fn acquire_present_fence<E>(
        &mut self,
        create: impl FnOnce() -> Result<F, E>,
    ) -> Result<&mut F, E> {
        let slot_index = self.index;
        let fence = match self.slots[slot_index].take() {
            Some(fence) => fence,
            None => create()?,
        };
        self.index = (self.index + 1) % self.slots.len();
        self.presenting = true;
        Ok(self.slots[slot_index].insert(fence))
    }

    /// The fence a wait must block on, or `None` when nothing is presenting.
    pub(crate) fn wait_target(&self) -> Option<&F> {
        if self.presenting {
            self.slots[self.index].as_ref()
        } else {
            None
        }
    }

    /// Clear the presenting flag and hand back the slot fence for a reset,
    /// or `None` when nothing is presenting. A second call without an
    /// intervening present returns `None`.
    pub(crate) fn begin_reset(&mut self) -> Option<&F> {
        if !self.presenting {
            return None;
        }
        self.presenting = false;
        self.slots[self.index].as_ref()
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

/// The bring-up result shared by every window: proc table, application,
/// device, and the cross-window present state.
///
/// Field order matters: the shared fences must drop before the device they
/// were created on, the device before the instance, and the loader last.
pub struct GpuContext {
    shared_fences: Mutex<SharedFencePool<VulkanHandle<vk::Fence>>>,
    present_queue: Arc<PresentQueue>,
    device: Device,
    application: Application,
    vk: ProcTable,
    enabled_extensions: Vec<&'static CStr>,
    device_thread: ThreadId,
}

impl GpuContext {
    /// Bring up the GPU: load the loader tier, create the instance with the
    /// surface extensions the embedder's windows will need, and open a
    /// logical device on the first compatible adapter.
    ///
    /// The calling thread becomes the device thread;
    /// [`Window::swap_buffers`](crate::window::Window::swap_buffers) submits
    /// directly on it and defers to the batched present path from any other
    /// thread.
    pub fn initialize(
        config: &GpuConfig,
        surface_extensions: &[&'static CStr],
    ) -> VulkanResult<Arc<Self>> {
        let mut vk = ProcTable::new();
        if !vk.has_acquired_mandatory_proc_addresses() {
            return Err(VulkanError::InitializationFailed(
                "Proc table has not acquired mandatory proc addresses".to_string(),
            ));
        }

        let mut enabled_extensions = vec![ash::extensions::khr::Surface::name()];
        for &extension in surface_extensions {
            if !enabled_extensions.contains(&extension) {
                enabled_extensions.push(extension);
            }
        }

        let application = Application::new(&mut vk, config, enabled_extensions.clone())?;
        let device = application.acquire_first_compatible_logical_device(&mut vk)?;

        log::info!(
            "GPU context initialized on thread {:?}",
            std::thread::current().id()
        );

        Ok(Arc::new(Self {
            shared_fences: Mutex::new(SharedFencePool::new(config.present_threads.max(1))),
            present_queue: Arc::new(PresentQueue::new()),
            device,
            application,
            vk,
            enabled_extensions,
            device_thread: std::thread::current().id(),
        }))
    }

    /// The fully-resolved proc table.
    pub fn proc_table(&self) -> &ProcTable {
        &self.vk
    }

    /// The instance wrapper.
    pub fn application(&self) -> &Application {
        &self.application
    }

    /// The logical device wrapper.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The pending-present queue shared by every window.
    pub fn present_queue(&self) -> Arc<PresentQueue> {
        Arc::clone(&self.present_queue)
    }

    /// Whether the calling thread is the one that ran bring-up.
    pub fn is_device_thread(&self) -> bool {
        std::thread::current().id() == self.device_thread
    }

    /// Descriptor for handing the brought-up device to an external renderer.
    pub fn render_context_descriptor(&self) -> RenderContextDescriptor<'_> {
        RenderContextDescriptor {
            instance: self.application.instance(),
            physical_device: self.device.physical_device(),
            device: self.device.handle(),
            queue: self.device.queue(),
            queue_family_index: self.device.graphics_queue_index(),
            api_version: self.application.api_version(),
            enabled_extensions: &self.enabled_extensions,
            features: self
                .device
                .physical_device_features(&self.vk)
                .unwrap_or_default(),
            proc_resolver: self.vk.create_proc_resolver(),
            owns_instance_and_device: false,
        }
    }

    /// Present every frame enqueued by
    /// [`Window::swap_buffers`](crate::window::Window::swap_buffers) on
    /// non-device threads as one batch, rotating the shared fence pool onto
    /// a fence that signals once the batch is on the queue.
    ///
    /// Must be driven by a single coordinator thread.
    pub fn present_all(&self) -> VulkanResult<()> {
        let device_fns = self.vk.device_procs()?.raw.clone();

        // Pool bookkeeping under the lock, driver calls outside it so a
        // concurrent fence wait never stalls the coordinator on the mutex.
        let fence = {
            let mut pool = lock(&self.shared_fences);
            let fence_handle = pool.acquire_present_fence(|| {
                // Created unsignaled; a reused slot comes back unsignaled
                // through the caller's wait-then-reset sequence.
                let info = vk::FenceCreateInfo::builder();
                let fence = unsafe {
                    device_fns
                        .create_fence(&info, None)
                        .map_err(VulkanError::Api)?
                };
                let d = device_fns.clone();
                Ok::<_, VulkanError>(VulkanHandle::new(fence, move |f| unsafe {
                    d.destroy_fence(f, None)
                }))
            })?;
            fence_handle.get().ok_or_else(|| VulkanError::InvalidOperation {
                reason: "shared fence slot is empty".to_string(),
            })?
        };

        Swapchain::present_all(&self.vk, &self.device, &self.present_queue, fence)
    }

    /// Block until the batch that was presented on the current slot has been
    /// consumed by the queue. Returns false, without blocking, when no
    /// present is outstanding, the slot has never carried a batch, or the
    /// wait fails. The presenting flag stays set; only
    /// [`reset_shared_fence`](Self::reset_shared_fence) clears it.
    pub fn wait_for_shared_fence(&self) -> bool {
        let Ok(device_procs) = self.vk.device_procs() else {
            return false;
        };
        let fence = {
            let pool = lock(&self.shared_fences);
            match pool.wait_target().and_then(VulkanHandle::get) {
                Some(fence) => fence,
                None => return false,
            }
        };

        // Unbounded wait, outside the pool lock.
        match unsafe { device_procs.raw.wait_for_fences(&[fence], true, u64::MAX) } {
            Ok(()) => true,
            Err(e) => {
                log::error!("Shared fence wait failed: {e:?}");
                false
            }
        }
    }

    /// Reset the outstanding present's fence and clear the presenting flag.
    /// Returns false when no present is outstanding; a second call without
    /// an intervening present is a no-op. The caller is trusted to have
    /// waited first.
    pub fn reset_shared_fence(&self) -> bool {
        let Ok(device_procs) = self.vk.device_procs() else {
            return false;
        };
        let fence = {
            let mut pool = lock(&self.shared_fences);
            match pool.begin_reset().and_then(VulkanHandle::get) {
                Some(fence) => fence,
                None => return false,
            }
        };

        match unsafe { device_procs.raw.reset_fences(&[fence]) } {
            Ok(()) => true,
            Err(e) => {
                log::error!("Shared fence reset failed: {e:?}");
                false
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::convert::Infallible;
    use std::rc::Rc;

    // Fence backend standing in for vk::Fence: carries an identity and
    // counts resets.
    struct MockFence {
        id: usize,
        resets: Rc<Cell<usize>>,
    }

    impl MockFence {
        fn reset(&self) {
            self.resets.set(self.resets.get() + 1);
        }
    }

    // Presents a batch; the fence handed out carries the id of the batch.
    fn present(pool: &mut SharedFencePool<MockFence>, id: usize, resets: &Rc<Cell<usize>>) -> usize {
        pool.acquire_present_fence(|| {
            Ok::<_, Infallible>(MockFence {
                id,
                resets: Rc::clone(resets),
            })
        })
        .unwrap()
        .id
    }

    #[test]
    fn test_wait_without_present_returns_false() {
        let pool: SharedFencePool<MockFence> = SharedFencePool::new(2);
        assert!(pool.wait_target().is_none());
    }

    #[test]
    fn test_present_hands_out_current_slot_then_advances() {
        let resets = Rc::new(Cell::new(0));
        let mut pool: SharedFencePool<MockFence> = SharedFencePool::new(2);
        assert_eq!(pool.index(), 0);

        let presented = present(&mut pool, 1, &resets);
        assert_eq!(presented, 1);
        assert_eq!(pool.index(), 1);

        // The in-flight batch sits in slot 0; the wait slot has never
        // carried a batch, so a wait declines instead of blocking on the
        // batch just submitted.
        assert!(pool.wait_target().is_none());
    }

    #[test]
    fn test_wait_targets_the_earlier_batch_after_wrap() {
        let resets = Rc::new(Cell::new(0));
        let mut pool: SharedFencePool<MockFence> = SharedFencePool::new(2);

        present(&mut pool, 1, &resets);
        present(&mut pool, 2, &resets);
        assert_eq!(pool.index(), 0);

        let target = pool.wait_target().unwrap();
        assert_eq!(target.id, 1);
    }

    #[test]
    fn test_reset_after_wait_resets_the_slot_fence() {
        let resets = Rc::new(Cell::new(0));
        let mut pool: SharedFencePool<MockFence> = SharedFencePool::new(1);
        present(&mut pool, 1, &resets);

        // A successful wait does not clear the presenting flag; the target
        // stays available until reset.
        assert!(pool.wait_target().is_some());
        assert!(pool.wait_target().is_some());

        let fence = pool.begin_reset().unwrap();
        fence.reset();
        assert_eq!(resets.get(), 1);
        assert!(pool.wait_target().is_none());

        // Second reset without an intervening present declines.
        assert!(pool.begin_reset().is_none());
        assert_eq!(resets.get(), 1);
    }

    #[test]
    fn test_slot_fences_are_reused_across_wraps() {
        let resets = Rc::new(Cell::new(0));
        let mut pool: SharedFencePool<MockFence> = SharedFencePool::new(2);

        let mut creations = 0;
        for _ in 0..6 {
            pool.acquire_present_fence(|| {
                creations += 1;
                Ok::<_, Infallible>(MockFence {
                    id: creations,
                    resets: Rc::clone(&resets),
                })
            })
            .unwrap();
        }
        assert_eq!(creations, 2);
    }
}
