#![no_std]

extern crate alloc;

/* extent-fs 的整体架构，自上而下 */

// 卷层：挂载/卸载、目录缓存与打开文件表
mod volume;

// 文件控制块层：按字节偏移读写文件
mod file;

// 目录项存储层：目录项数组的创建、读写与增删
mod directory;

// 空闲空间管理层：区段分配与多级区段表换页
mod free_space;

// 磁盘数据结构层：表示磁盘文件系统的数据结构
pub mod layout;

// 磁盘访问层：按块读写并检查传输完整性
mod disk;

mod config;
mod error;

pub use block_dev::{BLOCK_SIZE, BlockDevice};

pub use self::{
    config::Config,
    directory::{DirHandle, Directory},
    disk::Disk,
    error::{Error, Result},
    file::{FileDescriptor, OpenFlag, Whence},
    free_space::FreeSpaceMap,
    layout::{DirEntry, Extent, VolumeControlBlock},
    volume::{Stat, Volume, VolumeInfo},
};

/// 卷控制块中的签名，用于识别已格式化的卷
pub const SIGNATURE: u64 = 0x4558_5446_5331_0001;

/// 主空闲区段表的起始块
pub const FREE_SPACE_START: u32 = 1;

/// 每个目录项最多持有的区段数
pub const MAX_EXTENTS: usize = 8;

/// 文件名字段长度，最后一字节留给 \0
pub const NAME_CAP: usize = 32;
