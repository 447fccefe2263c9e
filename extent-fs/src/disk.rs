//! # 磁盘访问层
//!
//! 对 [`BlockDevice`] 的薄封装：缓冲区必须是整块，
//! 传输块数不足时转为 [`Error::DiskIo`]。

use alloc::sync::Arc;
use core::fmt;

use block_dev::BlockDevice;

use crate::{Error, Result};

#[derive(Clone)]
pub struct Disk {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.device.num_blocks())
            .finish()
    }
}

impl Disk {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let block_size = device.block_size();
        Self { device, block_size }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.device.num_blocks()
    }

    /// 整块的字节数
    #[inline]
    pub fn bytes_of(&self, blocks: u32) -> usize {
        blocks as usize * self.block_size
    }

    /// 容纳 `bytes` 字节所需的块数
    #[inline]
    pub fn blocks_for(&self, bytes: usize) -> u32 {
        bytes.div_ceil(self.block_size) as u32
    }

    pub fn read(&self, lba: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.block_size, 0);
        let want = buf.len() / self.block_size;
        let got = self.device.read_blocks(lba as usize, buf);
        if got < want {
            log::error!("short read at lba {lba}: {got}/{want} blocks");
            return Err(Error::DiskIo);
        }
        Ok(())
    }

    pub fn write(&self, lba: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.block_size, 0);
        let want = buf.len() / self.block_size;
        let got = self.device.write_blocks(lba as usize, buf);
        if got < want {
            log::error!("short write at lba {lba}: {got}/{want} blocks");
            return Err(Error::DiskIo);
        }
        Ok(())
    }
}
