//! # 目录项存储层
//!
//! 目录是存放在自身区段上的目录项数组：
//! - 第 0 项 "." 指向自己，`size` 记录整个数组的字节数，数组长度由它算出；
//! - 第 1 项 ".." 是父目录第 0 项的**拷贝**，根目录的 ".." 就是它自己。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::disk::Disk;
use crate::free_space::FreeSpaceMap;
use crate::layout::{DirEntry, Extent, as_bytes, as_bytes_mut};
use crate::{Error, MAX_EXTENTS, Result};

/// 共享的目录句柄，同一目录在内存中只有一份
pub type DirHandle = Arc<Mutex<Directory>>;

/// 前两项是 "." 和 ".."
const FIRST_FREE: usize = 2;

#[derive(Debug, Clone)]
pub struct Directory {
    entries: Vec<DirEntry>,
}

impl Directory {
    /// 分配并写入一个至少含 `count` 项的新目录，`parent` 为空表示根目录
    ///
    /// 优先申请一整段连续空间，不行再接受碎片，但不能超过目录项的区段上限。
    pub fn create(
        count: usize,
        parent: Option<&DirEntry>,
        fs: &mut FreeSpaceMap,
        disk: &Disk,
        now: i64,
    ) -> Result<Self> {
        if count < FIRST_FREE {
            return Err(Error::InvalidArgument);
        }
        let blocks = disk.blocks_for(count * DirEntry::SIZE);
        let extents = match fs.allocate(blocks, blocks) {
            Err(Error::OutOfSpace) => fs.allocate(blocks, 1)?,
            result => result?,
        };
        if extents.len() > MAX_EXTENTS {
            log::warn!(
                "directory of {blocks} blocks would need {} extents",
                extents.len()
            );
            fs.release_all(&extents)?;
            return Err(Error::TooManyExtents);
        }

        // 整块空间都用来放目录项
        let len = disk.bytes_of(blocks) / DirEntry::SIZE;
        let mut entries = vec![DirEntry::default(); len];

        let mut this = DirEntry::new(".", true, now)?;
        this.set_extents(&extents)?;
        this.size = (len * DirEntry::SIZE) as u32;

        let mut up = parent.copied().unwrap_or(this);
        up.set_name("..")?;
        up.set_used(true);

        entries[0] = this;
        entries[1] = up;

        let dir = Self { entries };
        if let Err(err) = dir.write(disk) {
            fs.release_all(&extents)?;
            return Err(err);
        }

        log::debug!("directory of {len} entries created at {extents:?}");
        Ok(dir)
    }

    /// 读入起始于 `lba` 的目录
    pub fn read(disk: &Disk, lba: u32) -> Result<Self> {
        let mut block = vec![0u8; disk.block_size()];
        disk.read(lba, &mut block)?;

        let mut this = DirEntry::default();
        as_bytes_mut(core::slice::from_mut(&mut this))
            .copy_from_slice(&block[..DirEntry::SIZE]);

        let size = this.size as usize;
        if !this.is_dir()
            || this.first_block() != Some(lba)
            || size < FIRST_FREE * DirEntry::SIZE
            || disk.bytes_of(this.total_blocks()) < size
        {
            log::error!("block {lba} does not hold a directory");
            return Err(Error::InvalidArgument);
        }

        let mut buf = vec![0u8; disk.bytes_of(this.total_blocks())];
        buf[..block.len()].copy_from_slice(&block);

        // 第一块已经读过
        let mut cursor = block.len();
        for (i, extent) in this.extents().iter().enumerate() {
            let (lba, count) = if i == 0 {
                (extent.start + 1, extent.count - 1)
            } else {
                (extent.start, extent.count)
            };
            if count == 0 {
                continue;
            }
            let len = disk.bytes_of(count);
            disk.read(lba, &mut buf[cursor..cursor + len])?;
            cursor += len;
        }

        let mut entries = vec![DirEntry::default(); size / DirEntry::SIZE];
        let bytes = as_bytes_mut(&mut entries);
        let len = bytes.len();
        bytes.copy_from_slice(&buf[..len]);

        Ok(Self { entries })
    }

    /// 写回整个目录项数组
    pub fn write(&self, disk: &Disk) -> Result<()> {
        let this = self.this();
        let extents = this.extents();
        let mut buf = vec![0u8; disk.bytes_of(this.total_blocks())];
        let bytes = as_bytes(&self.entries);
        buf[..bytes.len()].copy_from_slice(bytes);

        if let [extent] = extents {
            return disk.write(extent.start, &buf);
        }

        let mut cursor = 0;
        for extent in extents {
            let len = disk.bytes_of(extent.count);
            disk.write(extent.start, &buf[cursor..cursor + len])?;
            cursor += len;
        }
        Ok(())
    }

    /// "." 项
    #[inline]
    pub fn this(&self) -> &DirEntry {
        &self.entries[0]
    }

    /// ".." 项
    #[inline]
    pub fn parent(&self) -> &DirEntry {
        &self.entries[1]
    }

    /// 目录起始块，也是目录缓存的键
    #[inline]
    pub fn location(&self) -> u32 {
        self.this().first_block().unwrap_or_default()
    }

    #[inline]
    pub fn extents(&self) -> &[Extent] {
        self.this().extents()
    }

    /// 目录项个数，由 "." 的大小算出
    #[inline]
    pub fn len(&self) -> usize {
        (self.this().size as usize / DirEntry::SIZE).min(self.entries.len())
    }

    #[inline]
    pub fn entry(&self, index: usize) -> Option<&DirEntry> {
        self.entries[..self.len()].get(index)
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> Option<&mut DirEntry> {
        let len = self.len();
        self.entries[..len].get_mut(index)
    }

    /// 已使用的目录项及其下标
    pub fn entries(&self) -> impl Iterator<Item = (usize, &DirEntry)> {
        self.entries[..self.len()]
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_used())
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries()
            .find(|(_, entry)| entry.name() == name)
            .map(|(index, _)| index)
    }

    /// 只剩 "." 和 ".."
    pub fn is_empty(&self) -> bool {
        self.entries().all(|(index, _)| index < FIRST_FREE)
    }

    /// 把 `template` 放进第一个空闲的目录项
    pub fn create_entry(&mut self, template: &DirEntry) -> Result<usize> {
        let len = self.len();
        let index = (FIRST_FREE..len)
            .find(|&i| !self.entries[i].is_used())
            .ok_or(Error::DirectoryFull)?;

        let mut entry = *template;
        entry.set_used(true);
        self.entries[index] = entry;
        Ok(index)
    }

    /// 释放目录项拥有的全部区段
    ///
    /// `mark_used` 为真时保留该项（截断后复用），否则逻辑删除。
    pub fn remove_entry(
        &mut self,
        index: usize,
        mark_used: bool,
        fs: &mut FreeSpaceMap,
    ) -> Result<()> {
        if index < FIRST_FREE {
            return Err(Error::InvalidArgument);
        }
        let entry = self.entry_mut(index).ok_or(Error::InvalidArgument)?;
        if entry.is_dir() {
            entry.clear_name();
        }
        entry.size = 0;
        entry.set_used(mark_used);

        let extents = entry.extents().to_vec();
        entry.clear_extents();
        fs.release_all(&extents)
    }
}
