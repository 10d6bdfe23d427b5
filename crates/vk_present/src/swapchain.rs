//! Swapchain lifecycle and frame submission
//!
//! Owns the ring of presentable images for one surface: per-slot semaphores,
//! usage fences, and the layout-transition command buffers that bracket
//! external rendering. A swapchain is recreated wholesale whenever its
//! configuration changes; the previous swapchain is passed in as a creation
//! hint so the driver can recycle resources.

use ash::extensions::khr;
use ash::vk;
use std::sync::{Arc, Mutex};

use crate::context::RenderContext;
use crate::device::Device;
use crate::error::{VulkanError, VulkanResult};
use crate::handle::VulkanHandle;
use crate::proc_table::ProcTable;
use crate::surface::Surface;

/// Formats requested from the surface, in preference order.
const DESIRED_SURFACE_FORMATS: [vk::Format; 2] =
    [vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM];

/// Outcome of a swapchain image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    /// An image was acquired and transitioned for rendering
    Success,
    /// The surface is gone; unrecoverable for this swapchain and window
    ErrorSurfaceLost,
    /// The surface no longer matches the swapchain; recreate and retry
    ErrorSurfaceOutOfDate,
}

/// An acquired swapchain image, ready to be rendered into.
#[derive(Debug, Clone, Copy)]
pub struct Drawable {
    /// The swapchain image
    pub image: vk::Image,
    /// Color view over the image
    pub view: vk::ImageView,
    /// Image extent in pixels
    pub extent: vk::Extent2D,
    /// Pixel format of the image
    pub format: vk::Format,
    /// Index of the image within the swapchain
    pub image_index: u32,
}

/// One enqueued frame awaiting the next batched present.
#[derive(Debug, Clone, Copy)]
pub struct PendingPresent {
    swapchain: vk::SwapchainKHR,
    image_index: u32,
    wait_semaphore: vk::Semaphore,
}

/// Cross-thread list of frames awaiting the next batched present.
///
/// Rendering threads push through [`Swapchain::add_to_present`]; the present
/// coordinator drains through [`Swapchain::present_all`].
#[derive(Default)]
pub struct PresentQueue {
    pending: Mutex<Vec<PendingPresent>>,
}

impl PresentQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, entry: PendingPresent) {
        self.lock().push(entry);
    }

    fn drain(&self) -> Vec<PendingPresent> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of frames currently enqueued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no frames are enqueued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingPresent>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-slot synchronization and transition commands.
///
/// `in_flight` is true only while a submission carrying `usage_fence` is
/// outstanding; only then may anything wait on the fence.
struct Backbuffer {
    usage_fence: VulkanHandle<vk::Fence>,
    image_available: VulkanHandle<vk::Semaphore>,
    render_finished: VulkanHandle<vk::Semaphore>,
    begin_commands: vk::CommandBuffer,
    end_commands: vk::CommandBuffer,
    in_flight: bool,
}

impl Backbuffer {
    fn new(
        device: &ash::Device,
        begin_commands: vk::CommandBuffer,
        end_commands: vk::CommandBuffer,
    ) -> VulkanResult<Self> {
        // The usage fence is created signaled so the first wait on a fresh
        // slot never blocks.
        let fence_info =
            vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe {
            device
                .create_fence(&fence_info, None)
                .map_err(VulkanError::Api)?
        };
        let d = device.clone();
        let usage_fence = VulkanHandle::new(fence, move |f| unsafe { d.destroy_fence(f, None) });

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let mut semaphores = [VulkanHandle::empty(), VulkanHandle::empty()];
        for slot in &mut semaphores {
            let semaphore = unsafe {
                device
                    .create_semaphore(&semaphore_info, None)
                    .map_err(VulkanError::Api)?
            };
            let d = device.clone();
            *slot = VulkanHandle::new(semaphore, move |s| unsafe {
                d.destroy_semaphore(s, None)
            });
        }
        let [image_available, render_finished] = semaphores;

        Ok(Self {
            usage_fence,
            image_available,
            render_finished,
            begin_commands,
            end_commands,
            in_flight: false,
        })
    }
}

/// The ring of presentable images bound to one surface.
///
/// Field order matters: the backbuffer ring and the image views must drop
/// before the swapchain handle that owns their images.
pub struct Swapchain {
    device_fns: ash::Device,
    loader: khr::Swapchain,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    backbuffers: Vec<Backbuffer>,
    image_views: Vec<VulkanHandle<vk::ImageView>>,
    handle: VulkanHandle<vk::SwapchainKHR>,
    images: Vec<vk::Image>,
    current_backbuffer: usize,
    current_image: u32,
    extent: vk::Extent2D,
    format: vk::SurfaceFormatKHR,
    present_queue: Arc<PresentQueue>,
    // Held so the external rendering context outlives every image the
    // embedder may have wrapped through it.
    _render_context: Arc<dyn RenderContext>,
}

impl Swapchain {
    /// Create a swapchain for `surface`, optionally seeded with the previous
    /// swapchain for resource hand-off. The previous swapchain is destroyed
    /// regardless of outcome.
    pub fn new(
        vk: &ProcTable,
        device: &Device,
        surface: &Surface,
        render_context: Arc<dyn RenderContext>,
        previous: Option<Swapchain>,
        graphics_queue_index: u32,
        present_queue: Arc<PresentQueue>,
    ) -> VulkanResult<Self> {
        let device_procs = vk.device_procs()?;
        let loader = device_procs.swapchain.clone();
        let device_fns = device_procs.raw.clone();

        let capabilities = device.surface_capabilities(vk, surface)?;
        let format = device.choose_surface_format(vk, surface, &DESIRED_SURFACE_FORMATS)?;
        let present_mode = device.choose_present_mode(vk, surface)?;
        let extent = select_extent(&capabilities, surface.size());

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let old_swapchain = previous
            .as_ref()
            .and_then(|p| p.handle.get())
            .unwrap_or(vk::SwapchainKHR::null());

        let queue_family_indices = [graphics_queue_index];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let raw = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        // The previous swapchain has served as a creation hint; it can go
        // now, along with its ring.
        drop(previous);

        let destroy_loader = loader.clone();
        let handle = VulkanHandle::new(raw, move |s| unsafe {
            destroy_loader.destroy_swapchain(s, None);
        });

        let images = unsafe {
            loader
                .get_swapchain_images(raw)
                .map_err(VulkanError::Api)?
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(color_subresource_range());
            let view = unsafe {
                device_fns
                    .create_image_view(&view_info, None)
                    .map_err(VulkanError::Api)?
            };
            let d = device_fns.clone();
            image_views.push(VulkanHandle::new(view, move |v| unsafe {
                d.destroy_image_view(v, None);
            }));
        }

        // Two transition command buffers per ring slot: one bracketing the
        // start of rendering, one preparing for present.
        let command_pool = device.command_pool();
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(images.len() as u32 * 2);
        let command_buffers = unsafe {
            device_fns
                .allocate_command_buffers(&allocate_info)
                .map_err(VulkanError::Api)?
        };

        let mut backbuffers = Vec::with_capacity(images.len());
        for pair in command_buffers.chunks_exact(2) {
            backbuffers.push(Backbuffer::new(&device_fns, pair[0], pair[1])?);
        }

        log::debug!(
            "Created swapchain: {} images, {}x{}, {:?}",
            images.len(),
            extent.width,
            extent.height,
            format.format
        );

        Ok(Self {
            device_fns,
            loader,
            queue: device.queue(),
            command_pool,
            backbuffers,
            image_views,
            handle,
            images,
            current_backbuffer: 0,
            current_image: 0,
            extent,
            format,
            present_queue,
            _render_context: render_context,
        })
    }

    /// Whether the swapchain holds a live native handle.
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// The cached size the ring was built for.
    pub fn size(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    /// The chosen surface format.
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Number of images in the ring.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next presentable image.
    ///
    /// Waits for the ring slot's previous use to finish, acquires, and
    /// transitions the image for color-attachment rendering. Out-of-date and
    /// suboptimal surfaces report [`AcquireStatus::ErrorSurfaceOutOfDate`];
    /// the caller recreates the swapchain and retries.
    pub fn acquire_surface(&mut self) -> (AcquireStatus, Option<Drawable>) {
        let Some(raw) = self.handle.get() else {
            return (AcquireStatus::ErrorSurfaceLost, None);
        };

        let next = (self.current_backbuffer + 1) % self.backbuffers.len();
        let backbuffer = &self.backbuffers[next];
        let (Some(fence), Some(image_available)) = (
            backbuffer.usage_fence.get(),
            backbuffer.image_available.get(),
        ) else {
            return (AcquireStatus::ErrorSurfaceLost, None);
        };

        // Slot reuse gate: the previous frame on this slot must be off the
        // GPU before its semaphores and commands are recycled. The fence is
        // not reset here; that happens in `flush_commands` right before the
        // submit that signals it, so an acquire that fails or is abandoned
        // never leaves the fence permanently unsignaled.
        if backbuffer.in_flight {
            if let Err(e) = unsafe { self.device_fns.wait_for_fences(&[fence], true, u64::MAX) } {
                log::error!("Could not recycle the backbuffer fence: {e:?}");
                return (AcquireStatus::ErrorSurfaceLost, None);
            }
        }

        let image_index = match unsafe {
            self.loader
                .acquire_next_image(raw, u64::MAX, image_available, vk::Fence::null())
        } {
            Ok((index, false)) => index,
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                return (AcquireStatus::ErrorSurfaceOutOfDate, None);
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                return (AcquireStatus::ErrorSurfaceLost, None);
            }
            Err(e) => {
                log::error!("Unexpected acquire failure: {e:?}");
                return (AcquireStatus::ErrorSurfaceLost, None);
            }
        };

        let image = self.images[image_index as usize];
        if self
            .transition_for_render(backbuffer, image, image_available)
            .is_err()
        {
            return (AcquireStatus::ErrorSurfaceLost, None);
        }

        self.current_backbuffer = next;
        self.current_image = image_index;

        let drawable = Drawable {
            image,
            view: self.image_views[image_index as usize]
                .get()
                .unwrap_or(vk::ImageView::null()),
            extent: self.extent,
            format: self.format.format,
            image_index,
        };
        (AcquireStatus::Success, Some(drawable))
    }

    /// Submit the present transition and present the current image on the
    /// calling thread's queue (single-threaded owner path).
    pub fn submit(&mut self) -> VulkanResult<()> {
        let render_finished = self.flush_commands()?;

        let raw = self.handle.get().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "swapchain handle is gone".to_string(),
        })?;
        let wait_semaphores = [render_finished];
        let swapchains = [raw];
        let image_indices = [self.current_image];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.loader
                .queue_present(self.queue, &present_info)
                .map_err(VulkanError::Api)?;
        }
        Ok(())
    }

    /// Enqueue the current image for the next batched present without
    /// touching shared present state.
    pub fn add_to_present(&self) {
        let Some(raw) = self.handle.get() else {
            return;
        };
        let backbuffer = &self.backbuffers[self.current_backbuffer];
        let Some(wait_semaphore) = backbuffer.render_finished.get() else {
            return;
        };
        self.present_queue.add(PendingPresent {
            swapchain: raw,
            image_index: self.current_image,
            wait_semaphore,
        });
    }

    /// Submit the present transition for the current image without
    /// presenting (multi-threaded path). Returns the render-finished
    /// semaphore the eventual present must wait on.
    pub fn flush_commands(&mut self) -> VulkanResult<vk::Semaphore> {
        let backbuffer = &mut self.backbuffers[self.current_backbuffer];
        let (Some(render_finished), Some(fence)) = (
            backbuffer.render_finished.get(),
            backbuffer.usage_fence.get(),
        ) else {
            return Err(VulkanError::InvalidOperation {
                reason: "backbuffer sync objects are gone".to_string(),
            });
        };
        backbuffer.in_flight = false;

        let image = self.images[self.current_image as usize];
        record_transition(
            &self.device_fns,
            backbuffer.end_commands,
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::MEMORY_READ,
        )?;

        // The fence is reset only here, with the signaling submit directly
        // behind it; a failure on either side leaves `in_flight` false so
        // nothing ever waits on an unsignalable fence.
        unsafe {
            self.device_fns
                .reset_fences(&[fence])
                .map_err(VulkanError::Api)?;
        }

        let command_buffers = [backbuffer.end_commands];
        let signal_semaphores = [render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        unsafe {
            self.device_fns
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(VulkanError::Api)?;
        }
        backbuffer.in_flight = true;
        Ok(render_finished)
    }

    /// Present every frame enqueued on `pending` in one batched call, then
    /// push `fence` through the queue so it signals once the batch has been
    /// consumed.
    pub fn present_all(
        vk: &ProcTable,
        device: &Device,
        pending: &PresentQueue,
        fence: vk::Fence,
    ) -> VulkanResult<()> {
        let device_procs = vk.device_procs()?;
        let entries = pending.drain();

        if !entries.is_empty() {
            let wait_semaphores: Vec<vk::Semaphore> =
                entries.iter().map(|e| e.wait_semaphore).collect();
            let swapchains: Vec<vk::SwapchainKHR> =
                entries.iter().map(|e| e.swapchain).collect();
            let image_indices: Vec<u32> = entries.iter().map(|e| e.image_index).collect();

            let present_info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&wait_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            unsafe {
                device_procs
                    .swapchain
                    .queue_present(device.queue(), &present_info)
                    .map_err(VulkanError::Api)?;
            }
        }

        // An empty submission after the batch; the fence signals when the
        // queue reaches it, i.e. once every batched present has been handed
        // to the driver.
        device.queue_submit(&[], &[], &[], &[], Some(fence))
    }

    fn transition_for_render(
        &self,
        backbuffer: &Backbuffer,
        image: vk::Image,
        image_available: vk::Semaphore,
    ) -> VulkanResult<()> {
        record_transition(
            &self.device_fns,
            backbuffer.begin_commands,
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )?;

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [backbuffer.begin_commands];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .build();
        unsafe {
            self.device_fns
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                .map_err(VulkanError::Api)
        }
    }
}

/// Fences of slots with a submission still outstanding; slots that never
/// submitted (or whose last frame was abandoned) have signaled or inert
/// fences and must not be waited on.
fn pending_fences(backbuffers: &[Backbuffer]) -> Vec<vk::Fence> {
    backbuffers
        .iter()
        .filter(|b| b.in_flight)
        .filter_map(|b| b.usage_fence.get())
        .collect()
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // The ring's commands may still be on the GPU; wait for every
        // in-flight slot before freeing its command buffers.
        let fences = pending_fences(&self.backbuffers);
        if !fences.is_empty() {
            let _ = unsafe { self.device_fns.wait_for_fences(&fences, true, u64::MAX) };
        }

        let command_buffers: Vec<vk::CommandBuffer> = self
            .backbuffers
            .iter()
            .flat_map(|b| [b.begin_commands, b.end_commands])
            .collect();
        if !command_buffers.is_empty() {
            unsafe {
                self.device_fns
                    .free_command_buffers(self.command_pool, &command_buffers);
            }
        }
        // Views, semaphores, fences and the swapchain handle drop through
        // their own handles.
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn record_transition(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> VulkanResult<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .build();

    unsafe {
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::Api)?;
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
        device
            .end_command_buffer(command_buffer)
            .map_err(VulkanError::Api)
    }
}

/// Extent selection: the surface's fixed extent when it reports one, else
/// the window size clamped to the surface limits.
fn select_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    surface_size: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: surface_size.0.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: surface_size.1.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_uses_surface_fixed_extent() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = select_extent(&capabilities, (1024, 768));
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_extent_clamps_window_size() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let extent = select_extent(&capabilities, (4000, 50));
        assert_eq!((extent.width, extent.height), (1920, 100));
    }

    fn ring_slot(raw_fence: u64, in_flight: bool) -> Backbuffer {
        use ash::vk::Handle;
        Backbuffer {
            usage_fence: VulkanHandle::borrowed(vk::Fence::from_raw(raw_fence)),
            image_available: VulkanHandle::empty(),
            render_finished: VulkanHandle::empty(),
            begin_commands: vk::CommandBuffer::null(),
            end_commands: vk::CommandBuffer::null(),
            in_flight,
        }
    }

    #[test]
    fn test_teardown_waits_only_on_submitted_slots() {
        use ash::vk::Handle;

        // A slot whose acquire was abandoned (or that never submitted) has
        // no pending signal; waiting on it would block forever.
        let ring = [ring_slot(1, true), ring_slot(2, false), ring_slot(3, true)];
        let fences = pending_fences(&ring);
        assert_eq!(
            fences,
            vec![vk::Fence::from_raw(1), vk::Fence::from_raw(3)]
        );

        let idle_ring = [ring_slot(4, false), ring_slot(5, false)];
        assert!(pending_fences(&idle_ring).is_empty());
    }

    #[test]
    fn test_present_queue_drains_in_order() {
        let queue = PresentQueue::new();
        assert!(queue.is_empty());

        queue.add(PendingPresent {
            swapchain: vk::SwapchainKHR::null(),
            image_index: 0,
            wait_semaphore: vk::Semaphore::null(),
        });
        queue.add(PendingPresent {
            swapchain: vk::SwapchainKHR::null(),
            image_index: 1,
            wait_semaphore: vk::Semaphore::null(),
        });
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].image_index, 0);
        assert_eq!(drained[1].image_index, 1);
        assert!(queue.is_empty());
    }
}
