// Shader module loading
//
// SPIR-V arrives as raw bytes from disk; read_spv checks the length and
// magic number and fixes up alignment before the driver sees it.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::sync::Arc;

use super::VulkanDevice;

pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: Arc<VulkanDevice>, bytes: &[u8]) -> Result<Self> {
        let code = decode_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

/// Split SPIR-V bytes into words
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V bytecode")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_read_in_little_endian() {
        let mut bytes = 0x0723_0203u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        assert_eq!(decode_spirv(&bytes).unwrap(), vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn truncated_bytecode_is_rejected() {
        assert!(decode_spirv(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        assert!(decode_spirv(&[0u8; 8]).is_err());
    }
}
