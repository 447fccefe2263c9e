//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、U盘、镜像文件等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 一次调用可以连续读写多个块，返回值是实际传输的块数，
//! 少于请求的块数即表示传输失败，由调用者决定如何处理。

#![no_std]

use core::any::Any;

/// 默认块大小
pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    /// 从 `block_id` 开始连续读取 `buf.len() / block_size()` 个块，返回读到的块数
    fn read_blocks(&self, block_id: usize, buf: &mut [u8]) -> usize;

    /// 从 `block_id` 开始连续写入 `buf.len() / block_size()` 个块，返回写入的块数
    fn write_blocks(&self, block_id: usize, buf: &[u8]) -> usize;

    /// 设备总块数
    fn num_blocks(&self) -> usize;

    #[inline]
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }
}
