//! Logical device wrapper
//!
//! Selects a graphics-capable queue family on one physical device, creates
//! the logical device and a command pool, and exposes the submission and
//! query primitives the swapchain needs. The physical device handle is
//! borrowed from the instance and never destroyed here.

use ash::extensions::khr;
use ash::vk;

use crate::error::{VulkanError, VulkanResult};
use crate::handle::VulkanHandle;
use crate::proc_table::ProcTable;
use crate::surface::Surface;

/// Wrapper over a Vulkan logical device bound to one physical device.
///
/// Field order matters: the command pool must drop before the device.
pub struct Device {
    command_pool: VulkanHandle<vk::CommandPool>,
    device: VulkanHandle<vk::Device>,
    raw: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    graphics_queue_index: u32,
}

impl Device {
    /// Create a logical device on `physical_device` and resolve the
    /// device-tier procs into `vk`.
    ///
    /// Errors if no queue family advertises graphics capability, or device
    /// creation fails; the caller typically moves on to the next physical
    /// device.
    pub fn new(vk: &mut ProcTable, physical_device: vk::PhysicalDevice) -> VulkanResult<Self> {
        let instance = vk.instance_procs()?;

        let queue_families = unsafe {
            instance
                .raw
                .get_physical_device_queue_family_properties(physical_device)
        };
        let graphics_queue_index = select_graphics_queue_family(&queue_families).ok_or_else(|| {
            VulkanError::InitializationFailed("No graphics queue family found".to_string())
        })?;

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_index)
            .queue_priorities(&queue_priorities)
            .build();
        let queue_create_infos = [queue_create_info];

        let device_extensions = [khr::Swapchain::name().as_ptr()];
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions);

        let raw = unsafe {
            instance
                .raw
                .create_device(physical_device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        // Wrap before resolving the tier so a resolution failure still
        // destroys the device.
        let destroy_device = raw.clone();
        let device = VulkanHandle::new(raw.handle(), move |_| unsafe {
            let _ = destroy_device.device_wait_idle();
            destroy_device.destroy_device(None);
        });

        vk.setup_device_procs(raw.clone())?;

        let queue = unsafe { raw.get_device_queue(graphics_queue_index, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_queue_index);
        let pool = unsafe {
            raw.create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };
        let destroy_pool = raw.clone();
        let command_pool = VulkanHandle::new(pool, move |p| unsafe {
            destroy_pool.destroy_command_pool(p, None);
        });

        log::info!("Created logical device on queue family {graphics_queue_index}");

        Ok(Self {
            command_pool,
            device,
            raw,
            physical_device,
            queue,
            graphics_queue_index,
        })
    }

    /// The raw logical device handle.
    pub fn handle(&self) -> vk::Device {
        self.device.get().unwrap_or(vk::Device::null())
    }

    /// The borrowed physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The graphics queue handle.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// The command pool for presentation command buffers.
    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool.get().unwrap_or(vk::CommandPool::null())
    }

    /// Index of the selected graphics queue family.
    pub fn graphics_queue_index(&self) -> u32 {
        self.graphics_queue_index
    }

    /// Transfer device ownership to a longer-lived owner; this wrapper will
    /// no longer destroy it.
    pub fn release_device_ownership(&mut self) -> Option<vk::Device> {
        self.device.release()
    }

    /// Query surface capabilities for this physical device.
    pub fn surface_capabilities(
        &self,
        vk: &ProcTable,
        surface: &Surface,
    ) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        let procs = vk.instance_procs()?;
        unsafe {
            procs
                .surface
                .get_physical_device_surface_capabilities(self.physical_device, surface.handle())
                .map_err(VulkanError::Api)
        }
    }

    /// Query the physical device feature set.
    pub fn physical_device_features(
        &self,
        vk: &ProcTable,
    ) -> VulkanResult<vk::PhysicalDeviceFeatures> {
        let procs = vk.instance_procs()?;
        Ok(unsafe { procs.raw.get_physical_device_features(self.physical_device) })
    }

    /// Choose a surface format from a ranked desired-format list.
    ///
    /// The first exact match wins, in the order of `desired_formats`. If
    /// nothing matches, the first surface-advertised format is used. An
    /// empty desired list is an error; callers must state what they want.
    pub fn choose_surface_format(
        &self,
        vk: &ProcTable,
        surface: &Surface,
        desired_formats: &[vk::Format],
    ) -> VulkanResult<vk::SurfaceFormatKHR> {
        let procs = vk.instance_procs()?;
        let available = unsafe {
            procs
                .surface
                .get_physical_device_surface_formats(self.physical_device, surface.handle())
                .map_err(VulkanError::Api)?
        };
        select_surface_format(&available, desired_formats)
    }

    /// Choose a present mode: FIFO when advertised (it is universally
    /// supported and never tears), otherwise the first available mode.
    pub fn choose_present_mode(
        &self,
        vk: &ProcTable,
        surface: &Surface,
    ) -> VulkanResult<vk::PresentModeKHR> {
        let procs = vk.instance_procs()?;
        let available = unsafe {
            procs
                .surface
                .get_physical_device_surface_present_modes(self.physical_device, surface.handle())
                .map_err(VulkanError::Api)?
        };
        select_present_mode(&available)
    }

    /// Submit a batch of command buffers on the graphics queue.
    pub fn queue_submit(
        &self,
        wait_dest_pipeline_stages: &[vk::PipelineStageFlags],
        wait_semaphores: &[vk::Semaphore],
        signal_semaphores: &[vk::Semaphore],
        command_buffers: &[vk::CommandBuffer],
        fence: Option<vk::Fence>,
    ) -> VulkanResult<()> {
        debug_assert_eq!(wait_dest_pipeline_stages.len(), wait_semaphores.len());

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_dest_pipeline_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores)
            .build();

        unsafe {
            self.raw
                .queue_submit(self.queue, &[submit_info], fence.unwrap_or(vk::Fence::null()))
                .map_err(VulkanError::Api)
        }
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.raw.device_wait_idle().map_err(VulkanError::Api) }
    }
}

/// First queue family advertising graphics capability.
fn select_graphics_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Ranked desired-format selection; see [`Device::choose_surface_format`].
fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    desired_formats: &[vk::Format],
) -> VulkanResult<vk::SurfaceFormatKHR> {
    if desired_formats.is_empty() {
        return Err(VulkanError::InvalidOperation {
            reason: "desired surface format list is empty".to_string(),
        });
    }
    if available.is_empty() {
        return Err(VulkanError::InvalidOperation {
            reason: "surface advertises no formats".to_string(),
        });
    }

    for &desired in desired_formats {
        if let Some(found) = available.iter().find(|f| f.format == desired) {
            return Ok(*found);
        }
    }

    log::debug!("No desired surface format available; falling back to the first advertised");
    Ok(available[0])
}

fn select_present_mode(available: &[vk::PresentModeKHR]) -> VulkanResult<vk::PresentModeKHR> {
    if available.is_empty() {
        return Err(VulkanError::InvalidOperation {
            reason: "surface advertises no present modes".to_string(),
        });
    }

    if available.contains(&vk::PresentModeKHR::FIFO) {
        Ok(vk::PresentModeKHR::FIFO)
    } else {
        Ok(available[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn format(f: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: f,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_first_graphics_family_is_selected() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(select_graphics_queue_family(&families), Some(2));
    }

    #[test]
    fn test_no_graphics_family_is_an_error() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(select_graphics_queue_family(&families), None);
        assert_eq!(select_graphics_queue_family(&[]), None);
    }

    #[test]
    fn test_surface_format_prefers_desired_order() {
        let available = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::R8G8B8A8_UNORM),
        ];
        let chosen = select_surface_format(
            &available,
            &[vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM],
        )
        .unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_surface_format_falls_back_to_first_available() {
        let available = [format(vk::Format::R5G6B5_UNORM_PACK16)];
        let chosen = select_surface_format(&available, &[vk::Format::R8G8B8A8_UNORM]).unwrap();
        assert_eq!(chosen.format, vk::Format::R5G6B5_UNORM_PACK16);
    }

    #[test]
    fn test_empty_desired_format_list_is_rejected() {
        let available = [format(vk::Format::R8G8B8A8_UNORM)];
        assert!(matches!(
            select_surface_format(&available, &[]),
            Err(VulkanError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_present_mode_prefers_fifo() {
        let available = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&available).unwrap(),
            vk::PresentModeKHR::FIFO
        );

        let no_fifo = [vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&no_fifo).unwrap(),
            vk::PresentModeKHR::IMMEDIATE
        );
    }
}
