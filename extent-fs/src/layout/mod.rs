//! # 磁盘数据结构层
//!
//! extent-fs 的磁盘布局：
//! 卷控制块 | 主空闲区段表 | 由分配器管理的区域（目录、文件、次级区段表、三级表）
//!
//! 这里的结构体都是 `#[repr(C)]` 的纯数据，可以直接按字节读写磁盘。

use core::{mem, slice};

mod extent;
pub use extent::{Extent, Slot};

mod dir_entry;
pub use dir_entry::DirEntry;

mod vcb;
pub use vcb::{FreeSpaceInfo, VolumeControlBlock};

/// 任意位模式都合法、没有填充字节的磁盘数据类型
///
/// # Safety
///
/// 实现者必须是 `#[repr(C)]` 且所有字段都是整数或整数数组。
pub unsafe trait Pod: Copy + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u32 {}

#[inline]
pub fn as_bytes<T: Pod>(items: &[T]) -> &[u8] {
    unsafe { slice::from_raw_parts(items.as_ptr().cast(), mem::size_of_val(items)) }
}

#[inline]
pub fn as_bytes_mut<T: Pod>(items: &mut [T]) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(items.as_mut_ptr().cast(), mem::size_of_val(items)) }
}
