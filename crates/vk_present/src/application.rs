//! Vulkan instance wrapper
//!
//! Negotiates optional debug extensions, creates the native instance, and
//! enumerates physical devices. One `Application` exists per process; it is
//! created by [`crate::context::GpuContext`] during bring-up.

use ash::extensions::ext::DebugUtils;
use ash::vk;
use std::ffi::{CStr, CString};

use crate::config::GpuConfig;
use crate::device::Device;
use crate::error::{VulkanError, VulkanResult};
use crate::handle::VulkanHandle;
use crate::proc_table::ProcTable;

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

/// Wrapper over a Vulkan instance.
///
/// Owns the instance handle and, when validation is enabled and supported,
/// a debug-utils messenger. Field order matters: the messenger must drop
/// before the instance it is attached to.
pub struct Application {
    debug_messenger: VulkanHandle<vk::DebugUtilsMessengerEXT>,
    instance: VulkanHandle<vk::Instance>,
    api_version: u32,
}

impl Application {
    /// Create the native instance.
    ///
    /// Fails fast if `vk` has not acquired its mandatory loader procs. On
    /// success the instance-tier procs are resolved into `vk`; if that
    /// resolution fails the instance is still destroyed correctly through its
    /// handle and the constructor errors.
    pub fn new(
        vk: &mut ProcTable,
        config: &GpuConfig,
        enabled_extensions: Vec<&'static CStr>,
    ) -> VulkanResult<Self> {
        if !vk.has_acquired_mandatory_proc_addresses() {
            return Err(VulkanError::InitializationFailed(
                "Proc table has not acquired mandatory proc addresses".to_string(),
            ));
        }

        let entry = vk.entry()?;

        // Check if we want to enable debugging.
        let supported_extensions = supported_instance_extensions(entry);
        let enable_instance_debugging = config.enable_validation
            && extension_supported(&supported_extensions, DebugUtils::name());
        if config.enable_validation && !enable_instance_debugging {
            log::warn!("Validation requested but the debug-utils extension is unsupported");
        }

        // Configure extensions and layers.
        let mut extensions = enabled_extensions;
        if enable_instance_debugging {
            extensions.push(DebugUtils::name());
        }
        let extension_ptrs: Vec<*const std::os::raw::c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();

        let layers: Vec<&CStr> = if enable_instance_debugging {
            vec![CStr::from_bytes_with_nul(VALIDATION_LAYER)
                .map_err(|_| VulkanError::InitializationFailed("bad layer name".to_string()))?]
        } else {
            vec![]
        };
        let layer_ptrs: Vec<*const std::os::raw::c_char> =
            layers.iter().map(|layer| layer.as_ptr()).collect();

        let application_name = CString::new(config.application_name.as_str())
            .map_err(|_| VulkanError::InitializationFailed("bad application name".to_string()))?;
        let engine_name = CStr::from_bytes_with_nul(b"vk_present\0")
            .map_err(|_| VulkanError::InitializationFailed("bad engine name".to_string()))?;

        let api_version = config.api_version.make();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&application_name)
            .application_version(config.application_version.make())
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(api_version);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        // No retry on failure; the object simply never exists.
        let raw_instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        // Wrap before resolving the tier so a resolution failure still
        // destroys the instance.
        let destroy_instance = raw_instance.clone();
        let instance = VulkanHandle::new(raw_instance.handle(), move |_| {
            log::info!("Destroying Vulkan instance");
            unsafe { destroy_instance.destroy_instance(None) };
        });

        vk.setup_instance_procs(raw_instance, enable_instance_debugging)?;

        let debug_messenger = if enable_instance_debugging {
            Self::attach_debug_messenger(vk)
        } else {
            VulkanHandle::empty()
        };

        Ok(Self {
            debug_messenger,
            instance,
            api_version,
        })
    }

    /// Attach a debug-utils messenger. Failure is logged and non-fatal.
    fn attach_debug_messenger(vk: &ProcTable) -> VulkanHandle<vk::DebugUtilsMessengerEXT> {
        let Ok(procs) = vk.instance_procs() else {
            return VulkanHandle::empty();
        };
        let Some(debug_utils) = procs.debug_utils.clone() else {
            return VulkanHandle::empty();
        };

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        match unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) } {
            Ok(messenger) => {
                log::debug!("Debug reporting is enabled");
                VulkanHandle::new(messenger, move |m| unsafe {
                    debug_utils.destroy_debug_utils_messenger(m, None);
                })
            }
            Err(e) => {
                log::warn!("Debugging was enabled but could not be set up: {e:?}");
                VulkanHandle::empty()
            }
        }
    }

    /// The negotiated API version.
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// The raw instance handle.
    pub fn instance(&self) -> vk::Instance {
        self.instance.get().unwrap_or(vk::Instance::null())
    }

    /// Transfer instance ownership to a longer-lived owner; this wrapper will
    /// no longer destroy it.
    pub fn release_instance_ownership(&mut self) -> Option<vk::Instance> {
        self.instance.release()
    }

    /// Enumerate physical devices. Empty on any enumeration failure or zero
    /// count, with the failure logged.
    pub fn enumerate_physical_devices(&self, vk: &ProcTable) -> Vec<vk::PhysicalDevice> {
        let Ok(procs) = vk.instance_procs() else {
            return vec![];
        };

        match unsafe { procs.raw.enumerate_physical_devices() } {
            Ok(devices) => {
                if devices.is_empty() {
                    log::warn!("No physical devices found");
                }
                devices
            }
            Err(e) => {
                log::warn!("Could not enumerate physical devices: {e:?}");
                vec![]
            }
        }
    }

    /// Return a logical device for the first physical device that accepts
    /// one.
    pub fn acquire_first_compatible_logical_device(
        &self,
        vk: &mut ProcTable,
    ) -> VulkanResult<Device> {
        for physical_device in self.enumerate_physical_devices(vk) {
            match Device::new(vk, physical_device) {
                Ok(device) => return Ok(device),
                Err(e) => log::debug!("Skipping incompatible physical device: {e}"),
            }
        }

        Err(VulkanError::InitializationFailed(
            "Could not acquire compatible logical device".to_string(),
        ))
    }
}

fn supported_instance_extensions(entry: &ash::Entry) -> Vec<vk::ExtensionProperties> {
    match entry.enumerate_instance_extension_properties(None) {
        Ok(properties) => properties,
        Err(e) => {
            log::warn!("Could not enumerate instance extensions: {e:?}");
            vec![]
        }
    }
}

fn extension_supported(supported: &[vk::ExtensionProperties], name: &CStr) -> bool {
    supported.iter().any(|properties| {
        let supported_name = unsafe { CStr::from_ptr(properties.extension_name.as_ptr()) };
        supported_name == name
    })
}

/// Routes validation messages into the `log` crate.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr((*callback_data).p_message).to_string_lossy()
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_fails_fast_on_unacquired_table() {
        let mut vk = ProcTable::unloaded();
        let config = GpuConfig::default();
        let result = Application::new(&mut vk, &config, vec![]);
        assert!(matches!(result, Err(VulkanError::InitializationFailed(_))));
        assert!(!vk.are_instance_procs_setup());
    }

    #[test]
    fn test_extension_supported_matches_exact_name() {
        let mut properties = vk::ExtensionProperties::default();
        let name = b"VK_KHR_surface\0";
        for (i, &b) in name.iter().enumerate() {
            properties.extension_name[i] = b as std::os::raw::c_char;
        }

        let supported = vec![properties];
        let surface = CStr::from_bytes_with_nul(b"VK_KHR_surface\0").unwrap();
        let swapchain = CStr::from_bytes_with_nul(b"VK_KHR_swapchain\0").unwrap();
        assert!(extension_supported(&supported, surface));
        assert!(!extension_supported(&supported, swapchain));
    }

    #[test]
    fn test_enumerate_on_table_without_instance_tier_is_empty() {
        let vk = ProcTable::unloaded();
        // No Application can exist without bring-up; exercise the helper path
        // through a handcrafted call instead.
        let devices_len = {
            let application = Application {
                debug_messenger: VulkanHandle::empty(),
                instance: VulkanHandle::empty(),
                api_version: 0,
            };
            application.enumerate_physical_devices(&vk).len()
        };
        assert_eq!(devices_len, 0);
    }
}
