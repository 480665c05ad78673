// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation (validation layers + required extensions checked up front)
// - Window surface creation
// - Physical device selection against a fixed suitability predicate
// - Logical device + graphics/present queue creation

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::swapchain::SurfaceSupport;
use crate::config::Config;
use crate::error::{SetupError, Unsuitable};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Depth formats in order of preference
const DEPTH_FORMATS: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Queue families the renderer submits to. They may be the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Everything the suitability predicate looks at, captured once per adapter
/// so the predicate itself stays a pure function.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub features: vk::PhysicalDeviceFeatures,
    /// Per queue family: (supports graphics, can present to our surface)
    pub queue_families: Vec<(bool, bool)>,
    pub extensions: HashSet<CString>,
    pub format_count: usize,
    pub present_mode_count: usize,
}

impl DeviceCandidate {
    fn query(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let mut queue_families = Vec::with_capacity(families.len());
        for (index, family) in families.iter().enumerate() {
            let present = unsafe {
                surface_loader.get_physical_device_surface_support(
                    physical_device,
                    index as u32,
                    surface,
                )
            }?;
            queue_families.push((family.queue_flags.contains(vk::QueueFlags::GRAPHICS), present));
        }

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }?
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
            .collect();

        let format_count = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)
        }?
        .len();
        let present_mode_count = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }?
        .len();

        Ok(Self {
            name,
            device_type: props.device_type,
            features,
            queue_families,
            extensions,
            format_count,
            present_mode_count,
        })
    }

    /// The suitability predicate. Returns the queue families to use.
    pub fn check(&self, require_discrete: bool) -> Result<QueueFamilies, Unsuitable> {
        if require_discrete && self.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            return Err(Unsuitable::NotDiscrete);
        }
        if self.features.sampler_anisotropy != vk::TRUE {
            return Err(Unsuitable::MissingFeature("sampler_anisotropy"));
        }
        if self.features.sample_rate_shading != vk::TRUE {
            return Err(Unsuitable::MissingFeature("sample_rate_shading"));
        }

        let graphics = self
            .queue_families
            .iter()
            .position(|&(graphics, _)| graphics)
            .ok_or(Unsuitable::NoGraphicsQueue)? as u32;
        // Prefer presenting from the graphics family so the queues alias.
        let present = if self.queue_families[graphics as usize].1 {
            graphics
        } else {
            self.queue_families
                .iter()
                .position(|&(_, present)| present)
                .ok_or(Unsuitable::NoPresentQueue)? as u32
        };

        for required in required_device_extensions() {
            if !self.extensions.contains(required) {
                return Err(Unsuitable::MissingExtension(
                    required.to_string_lossy().into_owned(),
                ));
            }
        }

        if self.format_count == 0 || self.present_mode_count == 0 {
            return Err(Unsuitable::NoSwapchainSupport {
                formats: self.format_count,
                present_modes: self.present_mode_count,
            });
        }

        Ok(QueueFamilies { graphics, present })
    }
}

fn required_device_extensions() -> [&'static CStr; 1] {
    [khr::Swapchain::name()]
}

/// Highest sample count usable for both color and depth attachments, capped
/// at `cap` samples.
pub fn max_sample_count(limits: &vk::PhysicalDeviceLimits, cap: u32) -> vk::SampleCountFlags {
    let supported = limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| count.as_raw() <= cap && supported.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Presentation target
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,

    // Queue handles (may alias)
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    // Debug utils (if validation enabled)
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub depth_format: vk::Format,
    pub msaa_samples: vk::SampleCountFlags,
}

impl VulkanDevice {
    /// Create the instance, surface and logical device for `window`.
    pub fn new<W>(window: &W, config: &Config) -> Result<Arc<Self>>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let app_name = &config.window.title;
        let enable_validation = config.validation_enabled();
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let display_handle = window.raw_display_handle();
        let instance = Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Create the window surface
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle,
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;
        let surface_loader = khr::Surface::new(&entry, &instance);

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) = Self::pick_physical_device(
            &instance,
            &surface_loader,
            surface,
            config.graphics.require_discrete_gpu,
        )?;

        // Step 6: Create logical device
        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, queue_families)?;

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let depth_format = Self::find_depth_format(&instance, physical_device)?;
        let msaa_samples = max_sample_count(&properties.limits, config.graphics.msaa_samples);

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queues: graphics family {}, present family {}; depth {:?}; {:?} samples",
            queue_families.graphics,
            queue_families.present,
            depth_format,
            msaa_samples
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            present_queue,
            queue_families,
            debug_utils,
            properties,
            memory_properties,
            depth_format,
            msaa_samples,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("No Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Window-system extensions are always required; debug utils only
        // when validating.
        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)
                .context("Failed to query window-system extensions")?
                .to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }
        Self::check_instance_extensions(entry, &extensions)?;

        let layer_names = if enable_validation {
            Self::check_validation_layer(entry)?;
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        // Chained so that instance creation itself is validated too.
        let mut debug_info = debug_messenger_info();
        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if enable_validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn check_instance_extensions(entry: &Entry, required: &[*const c_char]) -> Result<()> {
        let available: HashSet<CString> = entry
            .enumerate_instance_extension_properties(None)?
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
            .collect();

        let missing: Vec<String> = required
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .filter(|name| !available.contains(*name))
            .map(|name| name.to_string_lossy().into_owned())
            .collect();

        if !missing.is_empty() {
            return Err(SetupError::MissingInstanceExtensions(missing).into());
        }
        log::debug!("All {} required instance extensions are supported", required.len());
        Ok(())
    }

    fn check_validation_layer(entry: &Entry) -> Result<()> {
        let found = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !found {
            return Err(SetupError::MissingValidationLayer(
                VALIDATION_LAYER.to_string_lossy().into_owned(),
            )
            .into());
        }
        Ok(())
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);
        let create_info = debug_messenger_info();

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to set up debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        require_discrete: bool,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            return Err(SetupError::NoAdapter.into());
        }

        // First adapter that passes wins
        for device in devices {
            let candidate = DeviceCandidate::query(instance, surface_loader, surface, device)?;
            match candidate.check(require_discrete) {
                Ok(families) => {
                    log::info!("Using physical device `{}`", candidate.name);
                    return Ok((device, families));
                }
                Err(reason) => {
                    log::warn!("Skipping physical device `{}`: {}", candidate.name, reason);
                }
            }
        }

        Err(SetupError::NoSuitableAdapter.into())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let mut unique_families = vec![families.graphics];
        if !families.is_shared() {
            unique_families.push(families.present);
        }
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .sample_rate_shading(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    fn find_depth_format(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::Format> {
        DEPTH_FORMATS
            .into_iter()
            .find(|&format| {
                let props = unsafe {
                    instance.get_physical_device_format_properties(physical_device, format)
                };
                props
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            })
            .ok_or_else(|| SetupError::NoDepthFormat.into())
    }

    /// Current capabilities, formats and present modes of the window surface
    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.physical_device, self.surface)?,
            })
        }
    }

    /// Whether `format` can be the source/destination of a linear-filtered blit
    pub fn supports_linear_blit(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .build()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_candidate() -> DeviceCandidate {
        DeviceCandidate {
            name: "Test GPU".into(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            features: vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                sample_rate_shading: vk::TRUE,
                ..Default::default()
            },
            queue_families: vec![(true, true)],
            extensions: [khr::Swapchain::name().to_owned()].into_iter().collect(),
            format_count: 2,
            present_mode_count: 1,
        }
    }

    #[test]
    fn shared_family_is_used_for_both_queues() {
        let families = good_candidate().check(true).unwrap();
        assert_eq!(families, QueueFamilies { graphics: 0, present: 0 });
        assert!(families.is_shared());
    }

    #[test]
    fn separate_present_family_is_found() {
        let mut candidate = good_candidate();
        candidate.queue_families = vec![(false, false), (true, false), (false, true)];
        let families = candidate.check(true).unwrap();
        assert_eq!(families, QueueFamilies { graphics: 1, present: 2 });
        assert!(!families.is_shared());
    }

    #[test]
    fn integrated_gpu_needs_opt_in() {
        let mut candidate = good_candidate();
        candidate.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        assert_eq!(candidate.check(true), Err(Unsuitable::NotDiscrete));
        assert!(candidate.check(false).is_ok());
    }

    #[test]
    fn missing_features_are_reported() {
        let mut candidate = good_candidate();
        candidate.features.sample_rate_shading = vk::FALSE;
        assert_eq!(
            candidate.check(true),
            Err(Unsuitable::MissingFeature("sample_rate_shading"))
        );
    }

    #[test]
    fn missing_swapchain_extension_is_reported() {
        let mut candidate = good_candidate();
        candidate.extensions.clear();
        assert!(matches!(
            candidate.check(true),
            Err(Unsuitable::MissingExtension(name)) if name == "VK_KHR_swapchain"
        ));
    }

    #[test]
    fn empty_present_modes_are_rejected() {
        let mut candidate = good_candidate();
        candidate.present_mode_count = 0;
        assert!(matches!(
            candidate.check(true),
            Err(Unsuitable::NoSwapchainSupport { present_modes: 0, .. })
        ));
    }

    #[test]
    fn no_present_queue_is_rejected() {
        let mut candidate = good_candidate();
        candidate.queue_families = vec![(true, false)];
        assert_eq!(candidate.check(true), Err(Unsuitable::NoPresentQueue));
    }

    #[test]
    fn sample_count_respects_limits_and_cap() {
        let limits = vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4,
            ..Default::default()
        };
        assert_eq!(max_sample_count(&limits, 64), vk::SampleCountFlags::TYPE_4);
        assert_eq!(max_sample_count(&limits, 2), vk::SampleCountFlags::TYPE_2);
        assert_eq!(max_sample_count(&limits, 1), vk::SampleCountFlags::TYPE_1);
    }
}
