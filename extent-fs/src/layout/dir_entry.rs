use core::str;

use super::{Extent, Pod};
use crate::{Error, MAX_EXTENTS, NAME_CAP, Result};

/// 目录项：文件或目录的元信息，连同它的区段表
///
/// 目录本身也是目录项数组，第 0 项为 "."，
/// 其 `size` 是整个数组的字节数；第 1 项为 ".."，是父目录第 0 项的拷贝。
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct DirEntry {
    pub created: i64,
    pub modified: i64,
    pub accessed: i64,
    /// 字节数
    pub size: u32,
    is_dir: u32,
    is_used: u32,
    extent_count: u32,
    name: [u8; NAME_CAP],
    extents: [Extent; MAX_EXTENTS],
}

unsafe impl Pod for DirEntry {}

impl DirEntry {
    /// 目录项大小恒为136字节
    pub const SIZE: usize = 136;

    pub fn new(name: &str, is_dir: bool, now: i64) -> Result<Self> {
        let mut entry = Self {
            created: now,
            modified: now,
            accessed: now,
            is_dir: is_dir as u32,
            is_used: 1,
            ..Self::default()
        };
        entry.set_name(name)?;
        Ok(entry)
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_CAP);
        str::from_utf8(&self.name[..len]).unwrap_or_default()
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() >= NAME_CAP || bytes.contains(&0) {
            return Err(Error::InvalidArgument);
        }
        self.name = [0; NAME_CAP];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn clear_name(&mut self) {
        self.name = [0; NAME_CAP];
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    #[inline]
    pub fn set_dir(&mut self, is_dir: bool) {
        self.is_dir = is_dir as u32;
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.is_used != 0
    }

    #[inline]
    pub fn set_used(&mut self, used: bool) {
        self.is_used = used as u32;
    }

    #[inline]
    pub fn extents(&self) -> &[Extent] {
        &self.extents[..(self.extent_count as usize).min(MAX_EXTENTS)]
    }

    #[inline]
    pub fn extents_mut(&mut self) -> &mut [Extent] {
        let len = (self.extent_count as usize).min(MAX_EXTENTS);
        &mut self.extents[..len]
    }

    #[inline]
    pub fn first_block(&self) -> Option<u32> {
        self.extents().first().map(|e| e.start)
    }

    /// 已分配的总块数
    pub fn total_blocks(&self) -> u32 {
        self.extents().iter().map(|e| e.count).sum()
    }

    /// 追加区段，与最后一段相接时直接合并
    pub fn append_extent(&mut self, extent: Extent) -> Result<()> {
        if let Some(last) = self.extents_mut().last_mut()
            && last.end() == extent.start
        {
            last.count += extent.count;
            return Ok(());
        }

        let len = self.extent_count as usize;
        if len >= MAX_EXTENTS {
            return Err(Error::TooManyExtents);
        }
        self.extents[len] = extent;
        self.extent_count += 1;
        Ok(())
    }

    pub fn set_extents(&mut self, extents: &[Extent]) -> Result<()> {
        if extents.len() > MAX_EXTENTS {
            return Err(Error::TooManyExtents);
        }
        self.extents = [Extent::default(); MAX_EXTENTS];
        self.extents[..extents.len()].copy_from_slice(extents);
        self.extent_count = extents.len() as u32;
        Ok(())
    }

    /// 只保留前 `len` 段
    pub fn truncate_extents(&mut self, len: usize) {
        let old = self.extents().len();
        if len < old {
            self.extents[len..old].fill(Extent::default());
            self.extent_count = len as u32;
        }
    }

    #[inline]
    pub fn clear_extents(&mut self) {
        self.truncate_extents(0);
    }

    /// 文件内第 `block` 块对应的磁盘块号，以及从该块起所在区段内剩余的连续块数
    pub fn locate(&self, block: u32) -> Option<(u32, u32)> {
        let mut skipped = 0;
        for extent in self.extents() {
            if block < skipped + extent.count {
                let inner = block - skipped;
                return Some((extent.start + inner, extent.count - inner));
            }
            skipped += extent.count;
        }
        None
    }
}
