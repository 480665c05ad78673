// Fatal setup errors
//
// Anything in here means the machine (or the config) cannot run this
// renderer at all. There is no recovery path: the error propagates up to
// main and the process exits with status 1.
//
// Out-of-date / suboptimal surfaces are NOT errors. They are ordinary values
// handled by the frame loop (see frame.rs).

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("validation layer {0} requested, but not available")]
    MissingValidationLayer(String),

    #[error("missing required instance extensions: {}", .0.join(", "))]
    MissingInstanceExtensions(Vec<String>),

    #[error("no Vulkan-capable GPU found")]
    NoAdapter,

    #[error("no GPU satisfies the renderer's requirements")]
    NoSuitableAdapter,

    #[error("no memory type matches type bits {type_bits:#b} with {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("no supported depth attachment format")]
    NoDepthFormat,

    #[error("unsupported image layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("{0} is empty, nothing to draw")]
    EmptyAsset(&'static str),

    #[error("format {0:?} does not support linear blitting")]
    LinearBlitUnsupported(vk::Format),
}

/// Why a particular adapter was passed over. Logged, never fatal on its own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Unsuitable {
    #[error("not a discrete GPU")]
    NotDiscrete,
    #[error("missing device feature `{0}`")]
    MissingFeature(&'static str),
    #[error("no graphics queue family")]
    NoGraphicsQueue,
    #[error("no queue family can present to the surface")]
    NoPresentQueue,
    #[error("missing device extension {0}")]
    MissingExtension(String),
    #[error("insufficient swapchain support ({formats} formats, {present_modes} present modes)")]
    NoSwapchainSupport { formats: usize, present_modes: usize },
}
