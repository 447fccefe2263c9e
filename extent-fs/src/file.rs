//! # 文件控制块层
//!
//! 每个打开的文件对应一个 [`FileControlBlock`]，持有一块大小的缓冲区：
//! - 不满一块的读写经过缓冲区，缓冲区写满或切换到别的块时才落盘；
//! - 块对齐且至少一整块的读写直接在调用者的缓冲区和磁盘之间传输；
//! - 落盘前若已分配的块不够，就向分配器申请，每次申请量翻倍。

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use derive_more::{From, Into};
use enumflags2::{BitFlags, bitflags};

use crate::directory::DirHandle;
use crate::disk::Disk;
use crate::free_space::FreeSpaceMap;
use crate::layout::{DirEntry, Extent};
use crate::{Error, Result};

#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// 只写
    WRONLY = 0b0000_0000_0001,
    /// 读写兼备
    RDWR   = 0b0000_0000_0010,
    /// 文件不存在则创建
    CREATE = 0b0010_0000_0000,
    /// 先清空文件，再交给用户
    TRUNC  = 0b0100_0000_0000,
    /// 偏移从文件末尾开始
    APPEND = 0b1000_0000_0000,
}

impl OpenFlag {
    // enumflags2拒绝值为0的标志
    /// 只读
    pub const RDONLY: u32 = 0b0000_0000_0000;
}

/// 打开文件表的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[repr(transparent)]
pub struct FileDescriptor(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

pub struct FileControlBlock {
    /// 文件所在目录
    dir: DirHandle,
    /// 文件在目录中的下标
    index: usize,
    flags: BitFlags<OpenFlag>,
    /// 当前字节偏移
    offset: u32,
    /// 文件字节数，包括缓冲区中尚未落盘的部分
    size: u32,
    buf: Box<[u8]>,
    /// 缓冲区中是文件的第几块
    buffered: Option<u32>,
    dirty: bool,
    /// 上一次扩容申请的块数
    grant: u32,
    initial_grant: u32,
    clock: fn() -> i64,
}

impl core::fmt::Debug for FileControlBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileControlBlock")
            .field("index", &self.index)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("buffered", &self.buffered)
            .field("dirty", &self.dirty)
            .field("grant", &self.grant)
            .finish()
    }
}

impl FileControlBlock {
    pub fn new(
        dir: DirHandle,
        index: usize,
        flags: BitFlags<OpenFlag>,
        block_size: usize,
        initial_grant: u32,
        clock: fn() -> i64,
    ) -> Result<Self> {
        let size = dir
            .lock()
            .entry(index)
            .map(|entry| entry.size)
            .ok_or(Error::InvalidArgument)?;
        let offset = if flags.contains(OpenFlag::APPEND) {
            size
        } else {
            0
        };

        Ok(Self {
            dir,
            index,
            flags,
            offset,
            size,
            buf: vec![0; block_size].into_boxed_slice(),
            buffered: None,
            dirty: false,
            grant: 0,
            initial_grant,
            clock,
        })
    }

    #[inline]
    pub fn readable(&self) -> bool {
        !self.flags.contains(OpenFlag::WRONLY)
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.flags.intersects(OpenFlag::WRONLY | OpenFlag::RDWR)
    }

    #[inline]
    pub fn dir(&self) -> &DirHandle {
        &self.dir
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    fn block_size(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    fn blocks_for(&self, bytes: u32) -> u32 {
        (bytes as usize).div_ceil(self.block_size()) as u32
    }

    /// 在持锁的情况下访问自己的目录项
    fn map_entry<V>(&self, f: impl FnOnce(&mut DirEntry) -> V) -> Result<V> {
        let mut dir = self.dir.lock();
        dir.entry_mut(self.index)
            .map(f)
            .ok_or(Error::InvalidArgument)
    }

    /// 文件第 `block` 块的磁盘块号及该区段内剩余的连续块数
    fn locate(&self, block: u32) -> Result<(u32, u32)> {
        self.map_entry(|entry| entry.locate(block))?
            .ok_or_else(|| {
                log::error!("block {block} of entry {} is not allocated", self.index);
                Error::InvalidArgument
            })
    }

    /// 把文件字节数和修改时间记入目录项
    fn record_size(&self) -> Result<()> {
        let size = self.size;
        let now = (self.clock)();
        self.map_entry(|entry| {
            entry.size = size;
            entry.modified = now;
        })
    }

    /// 保证文件至少拥有 `blocks` 块
    ///
    /// 第一次申请 `initial_grant` 块，之后每次翻倍；
    /// 剩余空间不够翻倍时只申请剩余空间，但至少要补足缺口。
    fn grow(&mut self, blocks: u32, fs: &mut FreeSpaceMap) -> Result<()> {
        let have = self.map_entry(|entry| entry.total_blocks())?;
        if have >= blocks {
            return Ok(());
        }
        let shortfall = blocks - have;

        self.grant = match self.grant {
            0 => self.initial_grant.max(1),
            grant => grant.saturating_mul(2),
        };
        let request = self
            .grant
            .max(shortfall)
            .min(fs.free_blocks().max(shortfall));
        let extents = fs.allocate(request, 1)?;

        let appended = self.map_entry(|entry| {
            for (i, extent) in extents.iter().enumerate() {
                if let Err(err) = entry.append_extent(*extent) {
                    return Err((i, err));
                }
            }
            Ok(())
        })?;
        if let Err((i, err)) = appended {
            log::warn!("entry {} is out of extent slots", self.index);
            fs.release_all(&extents[i..])?;
            return Err(err);
        }

        log::debug!(
            "entry {} grew from {have} to {} blocks",
            self.index,
            have + request
        );
        Ok(())
    }

    /// 把脏缓冲区写到它对应的块上
    pub fn commit(&mut self, disk: &Disk, fs: &mut FreeSpaceMap) -> Result<()> {
        let Some(block) = self.buffered else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        self.grow(block + 1, fs)?;
        let (lba, _) = self.locate(block)?;
        disk.write(lba, &self.buf)?;
        self.dirty = false;
        self.record_size()?;

        log::debug!("entry {} committed block {block} at {lba}", self.index);
        Ok(())
    }

    /// 让缓冲区装上文件的第 `block` 块
    fn load(&mut self, block: u32, disk: &Disk, fs: &mut FreeSpaceMap) -> Result<()> {
        if self.buffered == Some(block) {
            return Ok(());
        }
        self.commit(disk, fs)?;

        self.buffered = None;
        if block < self.blocks_for(self.size) {
            let (lba, _) = self.locate(block)?;
            disk.read(lba, &mut self.buf)?;
        } else {
            self.buf.fill(0);
        }
        self.buffered = Some(block);
        Ok(())
    }

    pub fn write(&mut self, data: &[u8], disk: &Disk, fs: &mut FreeSpaceMap) -> Result<usize> {
        if !self.writable() {
            return Err(Error::PermissionMismatch);
        }
        if (self.offset as usize).saturating_add(data.len()) > u32::MAX as usize {
            return Err(Error::InvalidArgument);
        }

        let block_size = self.block_size();
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            written += if self.offset as usize % block_size == 0 && rest.len() >= block_size {
                self.write_direct(rest, disk, fs)?
            } else {
                self.write_buffered(rest, disk, fs)?
            };
        }
        Ok(written)
    }

    /// 不满一块的部分经过缓冲区
    fn write_buffered(&mut self, data: &[u8], disk: &Disk, fs: &mut FreeSpaceMap) -> Result<usize> {
        let block_size = self.block_size();
        let block = self.offset / block_size as u32;
        let within = self.offset as usize % block_size;
        let len = (block_size - within).min(data.len());

        self.load(block, disk, fs)?;
        let full = within + len == block_size;
        if full {
            // 先确保空间，空间不足时缓冲区保持原样
            self.grow(block + 1, fs)?;
        }

        self.buf[within..within + len].copy_from_slice(&data[..len]);
        self.dirty = true;
        self.offset += len as u32;
        self.size = self.size.max(self.offset);

        if full {
            self.commit(disk, fs)?;
        }
        Ok(len)
    }

    /// 整块的部分绕过缓冲区直接写盘，可能跨越多个区段
    fn write_direct(&mut self, data: &[u8], disk: &Disk, fs: &mut FreeSpaceMap) -> Result<usize> {
        self.commit(disk, fs)?;

        let block_size = self.block_size();
        let first = self.offset / block_size as u32;
        let count = (data.len() / block_size) as u32;
        self.grow(first + count, fs)?;

        if let Some(block) = self.buffered
            && (first..first + count).contains(&block)
        {
            self.buffered = None;
        }

        let mut done = 0;
        while done < count {
            let (lba, run) = self.locate(first + done)?;
            let n = run.min(count - done);
            let bytes = &data[disk.bytes_of(done)..disk.bytes_of(done + n)];
            disk.write(lba, bytes)?;

            done += n;
            self.offset += bytes.len() as u32;
            self.size = self.size.max(self.offset);
            self.record_size()?;
        }
        Ok(disk.bytes_of(count))
    }

    /// 读到文件末尾为止，磁盘出错前已读到的字节照常返回
    pub fn read(&mut self, out: &mut [u8], disk: &Disk, fs: &mut FreeSpaceMap) -> Result<usize> {
        if !self.readable() {
            return Err(Error::PermissionMismatch);
        }
        self.commit(disk, fs)?;

        let len = out.len().min((self.size - self.offset) as usize);
        let mut done = 0;
        while done < len {
            match self.read_step(&mut out[done..len], disk, fs) {
                Ok(n) => done += n,
                Err(err) if done > 0 => {
                    log::warn!("read of entry {} stopped after {done} bytes: {err}", self.index);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    fn read_step(&mut self, out: &mut [u8], disk: &Disk, fs: &mut FreeSpaceMap) -> Result<usize> {
        let block_size = self.block_size();
        let block = self.offset / block_size as u32;
        let within = self.offset as usize % block_size;

        if within == 0 && out.len() >= block_size {
            let (lba, run) = self.locate(block)?;
            let n = run.min((out.len() / block_size) as u32);
            let len = disk.bytes_of(n);
            disk.read(lba, &mut out[..len])?;
            self.offset += len as u32;
            return Ok(len);
        }

        self.load(block, disk, fs)?;
        let len = (block_size - within).min(out.len());
        out[..len].copy_from_slice(&self.buf[within..within + len]);
        self.offset += len as u32;
        Ok(len)
    }

    pub fn seek(
        &mut self,
        offset: i64,
        whence: Whence,
        disk: &Disk,
        fs: &mut FreeSpaceMap,
    ) -> Result<u32> {
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => self.offset as i64,
            Whence::End => self.size as i64,
        };
        let target = base
            .checked_add(offset)
            .filter(|target| (0..=self.size as i64).contains(target))
            .ok_or(Error::InvalidArgument)? as u32;

        let block = target / self.block_size() as u32;
        if self.buffered != Some(block) {
            if self.writable() {
                self.commit(disk, fs)?;
            } else if target < self.size {
                self.load(block, disk, fs)?;
            }
        }

        self.offset = target;
        Ok(target)
    }

    /// 释放超出文件大小的尾部块
    pub fn trim(&mut self, fs: &mut FreeSpaceMap) -> Result<()> {
        let needed = self.blocks_for(self.size);
        let released = self.map_entry(|entry| trim_extents(entry, needed))?;
        if released.is_empty() {
            return Ok(());
        }

        log::debug!("entry {} trimmed to {needed} blocks, releasing {released:?}", self.index);
        fs.release_all(&released)
    }
}

/// 只保留前 `needed` 块，返回多出来的区段
fn trim_extents(entry: &mut DirEntry, needed: u32) -> Vec<Extent> {
    let mut released = Vec::new();
    if entry.total_blocks() <= needed {
        return released;
    }

    let mut kept = 0;
    let mut len = 0;
    for extent in entry.extents_mut() {
        if kept >= needed {
            released.push(*extent);
            continue;
        }
        len += 1;
        let keep = (needed - kept).min(extent.count);
        if keep < extent.count {
            released.push(Extent::new(extent.start + keep, extent.count - keep));
            extent.count = keep;
        }
        kept += keep;
    }
    entry.truncate_extents(len);
    released
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(extents: &[Extent]) -> DirEntry {
        let mut entry = DirEntry::default();
        entry.set_extents(extents).unwrap();
        entry
    }

    #[test]
    fn trim_splits_first_excess_extent() {
        let mut entry = entry_with(&[Extent::new(100, 4), Extent::new(200, 4), Extent::new(300, 2)]);
        let released = trim_extents(&mut entry, 6);
        assert_eq!(entry.extents(), &[Extent::new(100, 4), Extent::new(200, 2)]);
        assert_eq!(released, [Extent::new(202, 2), Extent::new(300, 2)]);
    }

    #[test]
    fn trim_on_extent_boundary() {
        let mut entry = entry_with(&[Extent::new(100, 4), Extent::new(200, 4)]);
        let released = trim_extents(&mut entry, 4);
        assert_eq!(entry.extents(), &[Extent::new(100, 4)]);
        assert_eq!(released, [Extent::new(200, 4)]);
    }

    #[test]
    fn trim_to_nothing() {
        let mut entry = entry_with(&[Extent::new(100, 4)]);
        let released = trim_extents(&mut entry, 0);
        assert!(entry.extents().is_empty());
        assert_eq!(released, [Extent::new(100, 4)]);
    }

    #[test]
    fn trim_noop_when_exact() {
        let mut entry = entry_with(&[Extent::new(100, 4)]);
        assert!(trim_extents(&mut entry, 4).is_empty());
        assert_eq!(entry.total_blocks(), 4);
    }

    #[test]
    fn open_modes() {
        let rd: BitFlags<OpenFlag> = BitFlags::from_bits_truncate(OpenFlag::RDONLY);
        assert!(rd.is_empty());
        let wr: BitFlags<OpenFlag> = OpenFlag::WRONLY.into();
        let rw: BitFlags<OpenFlag> = OpenFlag::RDWR | OpenFlag::CREATE;
        assert!(!wr.contains(OpenFlag::RDWR));
        assert!(rw.intersects(OpenFlag::WRONLY | OpenFlag::RDWR));
    }
}
