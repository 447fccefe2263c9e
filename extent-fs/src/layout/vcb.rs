use super::Pod;
use crate::{NAME_CAP, SIGNATURE};

/// 卷控制块，位于 0 号块
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct VolumeControlBlock {
    signature: u64,
    volume_name: [u8; NAME_CAP],
    pub total_blocks: u32,
    pub block_size: u32,
    /// 根目录起始块
    pub root_location: u32,
    /// 主空闲区段表起始块
    pub free_space_location: u32,
    pub free_space: FreeSpaceInfo,
}

/// 空闲区段表的簿记信息
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FreeSpaceInfo {
    /// 空闲块总数
    pub total_free: u32,
    /// 每张区段表占据的块数
    pub reserved_blocks: u32,
    /// 逻辑上已使用的表项数（含空位）
    pub extent_length: u32,
    /// 内存中驻留的表页号
    pub current_table: u32,
    /// 每张表的表项容量
    pub table_capacity: u32,
    /// 三级表登记的次级表个数
    pub tertiary_length: u32,
    /// 三级表所在块，[`FreeSpaceInfo::NO_TERTIARY`] 表示尚未创建
    pub tertiary_location: u32,
    _reserved: u32,
}

unsafe impl Pod for VolumeControlBlock {}
unsafe impl Pod for FreeSpaceInfo {}

impl Default for FreeSpaceInfo {
    fn default() -> Self {
        Self {
            total_free: 0,
            reserved_blocks: 0,
            extent_length: 0,
            current_table: 0,
            table_capacity: 0,
            tertiary_length: 0,
            tertiary_location: Self::NO_TERTIARY,
            _reserved: 0,
        }
    }
}

impl FreeSpaceInfo {
    pub const NO_TERTIARY: u32 = u32::MAX;

    /// 只有一个空闲段的主表
    pub fn new(total_free: u32, reserved_blocks: u32, table_capacity: u32) -> Self {
        Self {
            total_free,
            reserved_blocks,
            extent_length: 1,
            table_capacity,
            ..Self::default()
        }
    }

    #[inline]
    pub fn has_tertiary(&self) -> bool {
        self.tertiary_location != Self::NO_TERTIARY
    }
}

impl VolumeControlBlock {
    pub fn new(name: &str, total_blocks: u32, block_size: u32) -> Self {
        let mut volume_name = [0; NAME_CAP];
        let len = name
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .take_while(|&end| end < NAME_CAP)
            .last()
            .unwrap_or(0);
        volume_name[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            signature: SIGNATURE,
            volume_name,
            total_blocks,
            block_size,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.signature == SIGNATURE
    }

    pub fn volume_name(&self) -> &str {
        let len = self
            .volume_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_CAP);
        core::str::from_utf8(&self.volume_name[..len]).unwrap_or_default()
    }
}
