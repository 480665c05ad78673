// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an Arc of the device,
// so nothing can outlive the VkDevice it was created from.

pub mod buffer;
pub mod commands;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::SurfaceManager;
