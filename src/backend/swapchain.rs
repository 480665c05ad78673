// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// everything whose size follows the surface: the multisampled color target,
// the depth buffer and one framebuffer per swap image.
//
// The swap configuration is immutable for the life of a swapchain. When the
// surface changes (resize, out-of-date) the whole set is rebuilt.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::image::{self, Image, ImageDesc};
use super::pipeline::{framebuffer_attachments, Framebuffers, RenderPass};
use super::VulkanDevice;

/// What the surface offers on the selected adapter
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Everything chosen for one swapchain lifetime
#[derive(Debug, Clone, Copy)]
pub struct SwapConfig {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapConfig {
    pub fn choose(
        support: &SurfaceSupport,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        Ok(Self {
            format: choose_surface_format(&support.formats)?,
            present_mode: choose_present_mode(&support.present_modes, preferred_present_mode),
            extent: choose_extent(&support.capabilities, window_extent),
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// First 8-bit sRGB format, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let srgb = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    // A lone UNDEFINED entry means the surface has no preference at all.
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Ok(srgb);
        }
    }

    formats
        .iter()
        .copied()
        .find(|f| {
            matches!(f.format, vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .context("Surface reports no formats")
}

/// The preferred low-latency mode if offered, else FIFO (always available).
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|&mode| mode == preferred)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, unless it reports the "undefined" sentinel,
/// in which case the window size clamped to the surface limits.
pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window_extent
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window_extent
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum so we never wait on the driver, bounded by the
/// maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Result of presenting (or of a usable acquire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Optimal,
    /// Still presentable, but the swapchain should be rebuilt.
    Suboptimal,
    /// No longer usable; rebuild before drawing again.
    OutOfDate,
}

/// Result of acquiring a swap image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub config: SwapConfig,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Create a swapchain. `old` is retired by the new one and may be dropped
    /// once this returns.
    pub fn new(
        device: Arc<VulkanDevice>,
        config: SwapConfig,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        log::info!(
            "Creating swapchain: {}x{}, {:?}/{:?}, {:?}, {} images requested",
            config.extent.width,
            config.extent.height,
            config.format.format,
            config.format.color_space,
            config.present_mode,
            config.image_count
        );

        let families = device.queue_families;
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, shared_families): (_, &[u32]) = if families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, &[])
        } else {
            (vk::SharingMode::CONCURRENT, &family_indices)
        };

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(config.image_count)
            .image_format(config.format.format)
            .image_color_space(config.format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.swapchain));

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match image::create_image_view(
                &device,
                image,
                config.format.format,
                vk::ImageAspectFlags::COLOR,
                1,
            ) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for &view in &image_views {
                            device.device.destroy_image_view(view, None);
                        }
                        swapchain_loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            config,
            device,
        })
    }

    /// Acquire next image for rendering; `signal` fires once it is usable
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                signal,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen once `wait_on` is signaled
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_on: &[vk::Semaphore],
    ) -> Result<SurfaceStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_on)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(SurfaceStatus::Optimal),
            Ok(true) => Ok(SurfaceStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Source of the window's pixel size, plus a way to block until the window
/// system has something new to say.
pub trait ExtentSource {
    fn framebuffer_extent(&self) -> vk::Extent2D;
    fn wait_events(&mut self);
    fn should_close(&self) -> bool;
}

/// Block while the window has zero area (minimized). Returns `None` only if
/// the window is closed while waiting.
pub fn wait_for_drawable_extent<S: ExtentSource + ?Sized>(source: &mut S) -> Option<vk::Extent2D> {
    let mut extent = source.framebuffer_extent();
    if extent.width == 0 || extent.height == 0 {
        log::info!("Window minimized, waiting for a drawable size");
    }
    while extent.width == 0 || extent.height == 0 {
        if source.should_close() {
            return None;
        }
        source.wait_events();
        extent = source.framebuffer_extent();
    }
    Some(extent)
}

/// The swapchain plus every extent-dependent attachment and framebuffer.
///
/// Field order is drop order: framebuffers reference the attachment views
/// and the swap image views, so they go first.
pub struct SurfaceManager {
    framebuffers: Framebuffers,
    _color: Option<Image>,
    _depth: Image,
    swapchain: Swapchain,
    preferred_present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl SurfaceManager {
    pub fn create(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        config: SwapConfig,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        Self::build(device, render_pass, config, preferred_present_mode, None)
    }

    fn build(
        device: Arc<VulkanDevice>,
        render_pass: &RenderPass,
        config: SwapConfig,
        preferred_present_mode: vk::PresentModeKHR,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let swapchain = Swapchain::new(device.clone(), config, old)?;
        let extent = config.extent;

        let depth = image::create_image(
            &device,
            &ImageDesc {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                samples: render_pass.samples,
                format: device.depth_format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                aspect: vk::ImageAspectFlags::DEPTH,
            },
        )
        .context("Failed to create depth buffer")?;

        // Only needed when rendering multisampled; otherwise the swap image
        // is the color attachment.
        let color = if render_pass.samples != vk::SampleCountFlags::TYPE_1 {
            Some(
                image::create_image(
                    &device,
                    &ImageDesc {
                        width: extent.width,
                        height: extent.height,
                        mip_levels: 1,
                        samples: render_pass.samples,
                        format: config.format.format,
                        tiling: vk::ImageTiling::OPTIMAL,
                        usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                            | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                        memory_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                        aspect: vk::ImageAspectFlags::COLOR,
                    },
                )
                .context("Failed to create multisampled color buffer")?,
            )
        } else {
            None
        };

        let attachment_sets: Vec<Vec<vk::ImageView>> = swapchain
            .image_views
            .iter()
            .map(|&swap_view| {
                framebuffer_attachments(
                    render_pass.samples,
                    color.as_ref().map(|c| c.view),
                    depth.view,
                    swap_view,
                )
            })
            .collect();
        let framebuffers = Framebuffers::new(device.clone(), render_pass, &attachment_sets, extent)?;

        Ok(Self {
            framebuffers,
            _color: color,
            _depth: depth,
            swapchain,
            preferred_present_mode,
            device,
        })
    }

    /// Choose a configuration for the current surface state. Callers compare
    /// its format against the render pass before calling `recreate`.
    pub fn next_config(&self, window_extent: vk::Extent2D) -> Result<SwapConfig> {
        let support = self.device.surface_support()?;
        SwapConfig::choose(&support, window_extent, self.preferred_present_mode)
    }

    /// Tear down and recreate every extent-dependent resource. The device
    /// must already be idle.
    pub fn recreate(&mut self, render_pass: &RenderPass, config: SwapConfig) -> Result<()> {
        let next = Self::build(
            self.device.clone(),
            render_pass,
            config,
            self.preferred_present_mode,
            Some(&self.swapchain),
        )?;
        // Old framebuffers, attachments, then the retired swapchain drop here.
        *self = next;
        Ok(())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.config.extent
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.images.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers.get(image_index as usize)
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn support(current: (u32, u32)) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D {
                    width: current.0,
                    height: current.1,
                },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                ..Default::default()
            },
            formats: vec![format(vk::Format::B8G8R8A8_UNORM), format(vk::Format::B8G8R8A8_SRGB)],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn srgb_format_is_preferred() {
        let chosen = choose_surface_format(&support((800, 600)).formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn first_format_is_fallback() {
        let formats = [format(vk::Format::R16G16B16A16_SFLOAT), format(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn undefined_format_means_anything_goes() {
        let chosen = choose_surface_format(&[format(vk::Format::UNDEFINED)]).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn no_formats_is_an_error() {
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn current_extent_wins_unless_undefined() {
        let fixed = support((800, 600));
        assert_eq!(
            choose_extent(&fixed.capabilities, extent(1920, 1080)),
            extent(800, 600)
        );

        let free = support((u32::MAX, u32::MAX));
        assert_eq!(
            choose_extent(&free.capabilities, extent(1920, 1080)),
            extent(1920, 1080)
        );
        assert_eq!(
            choose_extent(&free.capabilities, extent(10_000, 0)),
            extent(4096, 1)
        );
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        let mut caps = support((800, 600)).capabilities;
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn choosing_twice_gives_the_same_configuration() {
        let support = support((u32::MAX, u32::MAX));
        let a = SwapConfig::choose(&support, extent(1280, 720), vk::PresentModeKHR::MAILBOX).unwrap();
        let b = SwapConfig::choose(&support, extent(1280, 720), vk::PresentModeKHR::MAILBOX).unwrap();

        assert_eq!(a.format.format, b.format.format);
        assert_eq!(a.format.color_space, b.format.color_space);
        assert_eq!(a.extent, b.extent);
        assert_eq!(a.image_count, b.image_count);
        assert_eq!(a.present_mode, b.present_mode);
    }

    /// Reports zero area until `waits_until_restored` event waits happen.
    struct MinimizedWindow {
        waits: usize,
        waits_until_restored: usize,
        closing: bool,
    }

    impl ExtentSource for MinimizedWindow {
        fn framebuffer_extent(&self) -> vk::Extent2D {
            if self.waits >= self.waits_until_restored {
                extent(640, 480)
            } else {
                extent(0, 0)
            }
        }

        fn wait_events(&mut self) {
            self.waits += 1;
        }

        fn should_close(&self) -> bool {
            self.closing
        }
    }

    #[test]
    fn zero_extent_blocks_until_restored() {
        let mut window = MinimizedWindow {
            waits: 0,
            waits_until_restored: 3,
            closing: false,
        };
        assert_eq!(wait_for_drawable_extent(&mut window), Some(extent(640, 480)));
        assert_eq!(window.waits, 3);
    }

    #[test]
    fn visible_window_does_not_wait() {
        let mut window = MinimizedWindow {
            waits: 0,
            waits_until_restored: 0,
            closing: false,
        };
        assert_eq!(wait_for_drawable_extent(&mut window), Some(extent(640, 480)));
        assert_eq!(window.waits, 0);
    }

    #[test]
    fn closing_while_minimized_gives_up() {
        let mut window = MinimizedWindow {
            waits: 0,
            waits_until_restored: usize::MAX,
            closing: true,
        };
        assert_eq!(wait_for_drawable_extent(&mut window), None);
    }
}
