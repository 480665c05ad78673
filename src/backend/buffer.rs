// Buffer utilities for vertex, index, and uniform buffers
//
// Every buffer gets its own allocation from a memory type picked by
// find_memory_type. Device-local geometry is filled through a staging copy;
// uniform buffers stay mapped for their whole life.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

use super::commands::{self, CommandPool};
use super::VulkanDevice;
use crate::error::SetupError;

/// A buffer and the memory bound to it
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Host pointer for persistently mapped buffers
    mapped: Option<*mut u8>,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Copy `bytes` to the start of a host-visible buffer.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes overflows a {} byte buffer",
            bytes.len(),
            self.size
        );

        match self.mapped {
            Some(ptr) => unsafe {
                ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            },
            None => unsafe {
                let ptr = self
                    .device
                    .device
                    .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                    .context("Failed to map buffer memory")? as *mut u8;
                ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
                self.device.device.unmap_memory(self.memory);
            },
        }
        Ok(())
    }

    /// Keep the memory mapped until the buffer is dropped.
    fn map_persistent(&mut self) -> Result<()> {
        let ptr = unsafe {
            self.device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map uniform buffer")?;
        self.mapped = Some(ptr as *mut u8);
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.is_some() {
                self.device.device.unmap_memory(self.memory);
            }
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Create a buffer with its own allocation from a matching memory type
pub fn create_buffer(
    device: &Arc<VulkanDevice>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
) -> Result<Buffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let vk_device = &device.device;
    let buffer =
        unsafe { vk_device.create_buffer(&buffer_info, None) }.context("Failed to create buffer")?;

    let requirements = unsafe { vk_device.get_buffer_memory_requirements(buffer) };
    let memory = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        memory_flags,
    )
    .map_err(anyhow::Error::from)
    .and_then(|memory_type_index| {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        unsafe { vk_device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")
    });
    let memory = match memory {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { vk_device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    // From here on Drop cleans up both handles
    let buffer = Buffer {
        buffer,
        memory,
        size,
        mapped: None,
        device: device.clone(),
    };
    unsafe { vk_device.bind_buffer_memory(buffer.buffer, buffer.memory, 0) }
        .context("Failed to bind buffer memory")?;

    Ok(buffer)
}

/// Find the first memory type allowed by `type_bits` that has every flag in
/// `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, SetupError> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
        .ok_or(SetupError::NoSuitableMemoryType { type_bits, required })
}

/// Upload `data` into a new device-local buffer through a host-visible
/// staging buffer. The staging buffer is gone when this returns.
pub fn upload_via_staging<T: Pod>(
    device: &Arc<VulkanDevice>,
    pool: &CommandPool,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<Buffer> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let size = bytes.len() as vk::DeviceSize;

    let staging = create_buffer(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.write(bytes)?;

    let target = create_buffer(
        device,
        size,
        vk::BufferUsageFlags::TRANSFER_DST | usage,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    commands::one_shot(device, pool, |cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]);
        }
        Ok(())
    })?;

    Ok(target)
}

/// A host-coherent uniform buffer that stays mapped
pub fn create_uniform_buffer(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Buffer> {
    let mut buffer = create_buffer(
        device,
        size,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    buffer.map_persistent()?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &property_flags) in flags.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index: 0,
            };
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
            | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_type_with_all_flags() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST,
            HOST | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(find_memory_type(&props, 0b1111, HOST).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_allowed_type_bits() {
        let props = properties(&[HOST, HOST, HOST]);
        assert_eq!(find_memory_type(&props, 0b100, HOST).unwrap(), 2);
    }

    #[test]
    fn ignores_types_past_the_reported_count() {
        let mut props = properties(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        assert!(matches!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Err(SetupError::NoSuitableMemoryType { type_bits: 0b11, .. })
        ));
    }

    #[test]
    fn no_match_is_an_error() {
        let props = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(find_memory_type(&props, 0b1, HOST).is_err());
        assert!(find_memory_type(&props, 0, vk::MemoryPropertyFlags::empty()).is_err());
    }
}
