// Synchronization primitives
//
// One FrameSync per frame slot. The fence starts signaled so the first wait
// on a fresh slot returns immediately.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        // Null handles are ignored by the destroy calls in Drop
        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device,
        };
        unsafe {
            let device = &sync.device.device;
            sync.image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            sync.render_finished = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create semaphore")?;
            sync.in_flight_fence = device
                .create_fence(&fence_info, None)
                .context("Failed to create fence")?;
        }
        Ok(sync)
    }

    /// Block until the GPU has finished the last submission on this slot.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .context("Failed to wait for frame fence")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset frame fence")
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            let device = &self.device.device;
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
