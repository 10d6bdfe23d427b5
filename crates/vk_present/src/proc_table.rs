//! Dynamic resolution of Vulkan entry points
//!
//! Everything in this crate calls the driver through a [`ProcTable`] instead
//! of linking statically. Entry points are resolved in three tiers, each at a
//! well-defined lifecycle point: loader procs when the table is created,
//! instance procs once an instance exists, device procs once a logical device
//! exists. A tier is all-or-nothing for its mandatory subset; optional entry
//! points (debug utils) are resolved best-effort.

use ash::extensions::{ext, khr};
use ash::vk;
use ash::Entry;
use std::ffi::CStr;

use crate::error::{VulkanError, VulkanResult};

/// Instance-tier function tables.
pub struct InstanceProcs {
    /// Core instance-level entry points
    pub raw: ash::Instance,
    /// Surface extension entry points (capability queries, destruction)
    pub surface: khr::Surface,
    /// Debug-utils entry points; `None` when the extension was not enabled
    pub debug_utils: Option<ext::DebugUtils>,
}

/// Device-tier function tables.
pub struct DeviceProcs {
    /// Core device-level entry points (command buffers, sync primitives,
    /// memory, submission)
    pub raw: ash::Device,
    /// Swapchain extension entry points (create/acquire/present)
    pub swapchain: khr::Swapchain,
}

/// Resolver handed to the external rendering context: device-level lookup
/// first, instance-level as fallback.
pub type ProcResolver =
    Box<dyn Fn(&CStr, vk::Instance, vk::Device) -> vk::PFN_vkVoidFunction + Send + Sync>;

/// Function-pointer tables for the three resolution tiers.
///
/// Created once per process. The loader library is opened at construction and
/// closed when the table drops. Callers must check
/// [`ProcTable::has_acquired_mandatory_proc_addresses`] before constructing
/// anything on top of the table.
pub struct ProcTable {
    entry: Option<Entry>,
    instance: Option<InstanceProcs>,
    device: Option<DeviceProcs>,
}

impl ProcTable {
    /// Open the Vulkan loader library and resolve the loader-tier procs.
    ///
    /// Never panics; a missing library leaves the table not-acquired, which
    /// every downstream constructor checks and fails fast on.
    pub fn new() -> Self {
        let entry = match unsafe { Entry::load() } {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::error!("Could not open the Vulkan library: {e}");
                None
            }
        };

        Self {
            entry,
            instance: None,
            device: None,
        }
    }

    /// Build a table over a statically linked entry supplied by the embedder.
    pub fn from_static(entry: Entry) -> Self {
        Self {
            entry: Some(entry),
            instance: None,
            device: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn unloaded() -> Self {
        Self {
            entry: None,
            instance: None,
            device: None,
        }
    }

    /// Whether the loader tier resolved its mandatory entry points.
    pub fn has_acquired_mandatory_proc_addresses(&self) -> bool {
        self.entry.is_some()
    }

    /// Whether the instance tier is set up.
    pub fn are_instance_procs_setup(&self) -> bool {
        self.instance.is_some()
    }

    /// Whether the device tier is set up.
    pub fn are_device_procs_setup(&self) -> bool {
        self.device.is_some()
    }

    /// True only once both the instance and device tiers are set up.
    pub fn is_valid(&self) -> bool {
        self.instance.is_some() && self.device.is_some()
    }

    /// Loader-tier entry points.
    pub fn entry(&self) -> VulkanResult<&Entry> {
        self.entry
            .as_ref()
            .ok_or(VulkanError::ProcAddressNotFound("vkGetInstanceProcAddr"))
    }

    /// Instance-tier entry points.
    pub fn instance_procs(&self) -> VulkanResult<&InstanceProcs> {
        self.instance.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "instance procs are not set up".to_string(),
        })
    }

    /// Device-tier entry points.
    pub fn device_procs(&self) -> VulkanResult<&DeviceProcs> {
        self.device.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "device procs are not set up".to_string(),
        })
    }

    /// Resolve the instance tier from a freshly created instance.
    ///
    /// `debug_utils_enabled` reflects whether the debug-utils extension was
    /// actually enabled on the instance; when false the optional debug entry
    /// points are simply absent, which is not an error.
    pub fn setup_instance_procs(
        &mut self,
        instance: ash::Instance,
        debug_utils_enabled: bool,
    ) -> VulkanResult<()> {
        let entry = self.entry()?;

        let surface = khr::Surface::new(entry, &instance);
        let debug_utils = debug_utils_enabled.then(|| ext::DebugUtils::new(entry, &instance));

        self.instance = Some(InstanceProcs {
            raw: instance,
            surface,
            debug_utils,
        });
        log::debug!("Instance proc addresses are set up");
        Ok(())
    }

    /// Resolve the device tier from a freshly created logical device.
    pub fn setup_device_procs(&mut self, device: ash::Device) -> VulkanResult<()> {
        let instance = self.instance_procs()?;

        let swapchain = khr::Swapchain::new(&instance.raw, &device);

        self.device = Some(DeviceProcs {
            raw: device,
            swapchain,
        });
        log::debug!("Device proc addresses are set up");
        Ok(())
    }

    /// Resolve a single entry point by name at instance scope.
    ///
    /// A null instance is an acceptable parameter for loader-scope lookups.
    /// Resolution is deterministic: the same name resolves to the same
    /// pointer for the lifetime of the table.
    pub fn acquire_instance_proc(
        &self,
        name: &CStr,
        instance: vk::Instance,
    ) -> vk::PFN_vkVoidFunction {
        let entry = self.entry.as_ref()?;
        unsafe { (entry.static_fn().get_instance_proc_addr)(instance, name.as_ptr()) }
    }

    /// Resolve a single entry point by name at device scope.
    pub fn acquire_device_proc(&self, name: &CStr, device: vk::Device) -> vk::PFN_vkVoidFunction {
        if device == vk::Device::null() {
            return None;
        }
        let instance = self.instance.as_ref()?;
        unsafe { (instance.raw.fp_v1_0().get_device_proc_addr)(device, name.as_ptr()) }
    }

    /// Build the resolver callback handed to the external rendering context.
    ///
    /// Returns `None` unless both the instance and device tiers are set up.
    pub fn create_proc_resolver(&self) -> Option<ProcResolver> {
        if !self.is_valid() {
            return None;
        }

        // Capture the raw fn pointers so the closure does not borrow the
        // table; both are plain extern fns and stay valid while the library
        // handle is open, which the rendering context's owner guarantees by
        // holding the GPU context alive.
        let get_instance_proc_addr = self.entry.as_ref()?.static_fn().get_instance_proc_addr;
        let get_device_proc_addr = self.instance.as_ref()?.raw.fp_v1_0().get_device_proc_addr;

        Some(Box::new(move |name, instance, device| {
            if device != vk::Device::null() {
                let proc_addr = unsafe { get_device_proc_addr(device, name.as_ptr()) };
                if proc_addr.is_some() {
                    return proc_addr;
                }
            }
            unsafe { get_instance_proc_addr(instance, name.as_ptr()) }
        }))
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unloaded_table_reports_not_acquired() {
        let vk = ProcTable::unloaded();
        assert!(!vk.has_acquired_mandatory_proc_addresses());
        assert!(!vk.are_instance_procs_setup());
        assert!(!vk.are_device_procs_setup());
        assert!(!vk.is_valid());
    }

    #[test]
    fn test_unloaded_table_rejects_tier_access() {
        let vk = ProcTable::unloaded();
        assert!(vk.entry().is_err());
        assert!(vk.instance_procs().is_err());
        assert!(vk.device_procs().is_err());
        assert!(vk.create_proc_resolver().is_none());
    }

    #[test]
    fn test_unloaded_table_resolves_nothing() {
        let vk = ProcTable::unloaded();
        let name = CStr::from_bytes_with_nul(b"vkCreateInstance\0").unwrap();
        assert!(vk.acquire_instance_proc(name, vk::Instance::null()).is_none());
        assert!(vk.acquire_device_proc(name, vk::Device::null()).is_none());
    }

    #[test]
    fn test_fresh_table_has_no_upper_tiers() {
        // Whether or not a loader is installed, a fresh table never has
        // instance or device tiers before an instance/device exists.
        let vk = ProcTable::new();
        assert!(!vk.are_instance_procs_setup());
        assert!(!vk.are_device_procs_setup());
        assert!(!vk.is_valid());
    }
}
