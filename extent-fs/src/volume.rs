//! # 卷层
//!
//! [`Volume`] 是一次挂载的全部状态：卷控制块、驻留的空闲区段表页、
//! 目录缓存和打开文件表。所有操作都通过它进行，没有全局变量。
//!
//! 目录缓存以目录起始块为键：根目录和当前目录是强引用，
//! 其它目录只留弱引用，没有句柄在用时自然释放。

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::{mem, slice};

use block_dev::BlockDevice;
use enumflags2::BitFlags;
use spin::Mutex;

use crate::directory::{DirHandle, Directory};
use crate::disk::Disk;
use crate::file::{FileControlBlock, FileDescriptor, OpenFlag, Whence};
use crate::free_space::FreeSpaceMap;
use crate::layout::{DirEntry, Extent, VolumeControlBlock, as_bytes, as_bytes_mut};
use crate::{Config, Error, FREE_SPACE_START, Result};

pub struct Volume {
    disk: Disk,
    config: Config,
    vcb: VolumeControlBlock,
    free_space: FreeSpaceMap,
    root: DirHandle,
    /// 当前目录，为空时就是根目录
    cwd: Option<(u32, DirHandle)>,
    dir_cache: BTreeMap<u32, Weak<Mutex<Directory>>>,
    files: Vec<Option<FileControlBlock>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// 字节数
    pub size: u32,
    pub block_size: u32,
    /// 已分配的块数
    pub blocks: u32,
    pub accessed: i64,
    pub modified: i64,
    pub created: i64,
    pub is_dir: bool,
}

impl Volume {
    /// 挂载设备上的卷，签名或几何参数不符时重新格式化
    pub fn mount(device: Arc<dyn BlockDevice>, config: Config) -> Result<Self> {
        let disk = Disk::new(device);
        let total_blocks = disk.num_blocks().min(u32::MAX as usize) as u32;
        let block_size = disk.block_size() as u32;
        if (block_size as usize) < mem::size_of::<VolumeControlBlock>().max(DirEntry::SIZE) {
            return Err(Error::InvalidArgument);
        }

        let mut block = vec![0u8; disk.block_size()];
        disk.read(0, &mut block)?;
        let mut vcb = VolumeControlBlock::default();
        let raw = as_bytes_mut(slice::from_mut(&mut vcb));
        let len = raw.len();
        raw.copy_from_slice(&block[..len]);

        let files = (0..config.max_open_files).map(|_| None).collect();

        if vcb.is_valid() && vcb.block_size == block_size && vcb.total_blocks == total_blocks {
            let free_space = FreeSpaceMap::load(disk.clone(), total_blocks, vcb.free_space)?;
            let root = Directory::read(&disk, vcb.root_location)?;
            log::info!(
                "mounted volume {:?}: {total_blocks} blocks, {} free",
                vcb.volume_name(),
                free_space.free_blocks()
            );

            return Ok(Self {
                disk,
                config,
                vcb,
                free_space,
                root: Arc::new(Mutex::new(root)),
                cwd: None,
                dir_cache: BTreeMap::new(),
                files,
            });
        }

        log::info!("no volume found on device, formatting {total_blocks} blocks");
        let mut free_space =
            FreeSpaceMap::format(disk.clone(), total_blocks, config.free_space_percent)?;
        let root = Directory::create(
            config.directory_entries,
            None,
            &mut free_space,
            &disk,
            (config.clock)(),
        )?;

        let mut vcb = VolumeControlBlock::new(&config.volume_name, total_blocks, block_size);
        vcb.root_location = root.location();
        vcb.free_space_location = FREE_SPACE_START;

        let mut volume = Self {
            disk,
            config,
            vcb,
            free_space,
            root: Arc::new(Mutex::new(root)),
            cwd: None,
            dir_cache: BTreeMap::new(),
            files,
        };
        volume.sync()?;
        Ok(volume)
    }

    /// 写回驻留的区段表页和卷控制块
    pub fn sync(&mut self) -> Result<()> {
        self.free_space.flush()?;
        self.vcb.free_space = self.free_space.info();

        let mut block = vec![0u8; self.disk.block_size()];
        let raw = as_bytes(slice::from_ref(&self.vcb));
        block[..raw.len()].copy_from_slice(raw);
        self.disk.write(0, &block)
    }

    /// 关闭所有打开的文件并写回卷，每一步都会执行，返回第一个错误
    pub fn unmount(mut self) -> Result<()> {
        let mut result = Ok(());
        for fd in 0..self.files.len() {
            if self.files[fd].is_some() {
                result = result.and(self.close(fd.into()));
            }
        }
        result = result.and(self.root.lock().write(&self.disk));
        result = result.and(self.sync());

        log::info!("unmounted volume {:?}", self.vcb.volume_name());
        result
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            name: String::from(self.vcb.volume_name()),
            block_size: self.vcb.block_size,
            total_blocks: self.vcb.total_blocks,
            free_blocks: self.free_space.free_blocks(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn free_blocks(&self) -> u32 {
        self.free_space.free_blocks()
    }

    /// 空闲区段表中的全部空闲段
    pub fn free_extents(&mut self) -> Result<Vec<Extent>> {
        self.free_space.free_extents()
    }

    #[inline]
    fn now(&self) -> i64 {
        (self.config.clock)()
    }

    /* 目录 */

    #[inline]
    pub fn root(&self) -> DirHandle {
        self.root.clone()
    }

    pub fn current_dir(&self) -> DirHandle {
        match &self.cwd {
            Some((_, dir)) => dir.clone(),
            None => self.root.clone(),
        }
    }

    pub fn set_current_dir(&mut self, dir: &DirHandle) {
        let location = dir.lock().location();
        self.cwd = (location != self.vcb.root_location).then(|| (location, dir.clone()));
    }

    /// 读入目录项指向的目录，已在内存中的直接共享
    pub fn load_dir(&mut self, entry: &DirEntry) -> Result<DirHandle> {
        if !entry.is_dir() {
            return Err(Error::PermissionMismatch);
        }
        let location = entry.first_block().ok_or(Error::InvalidArgument)?;

        if location == self.vcb.root_location {
            return Ok(self.root.clone());
        }
        if let Some((cwd, dir)) = &self.cwd
            && *cwd == location
        {
            return Ok(dir.clone());
        }
        if let Some(dir) = self.dir_cache.get(&location).and_then(Weak::upgrade) {
            return Ok(dir);
        }

        let dir = Arc::new(Mutex::new(Directory::read(&self.disk, location)?));
        self.cache_dir(location, &dir);
        Ok(dir)
    }

    fn cache_dir(&mut self, location: u32, dir: &DirHandle) {
        self.dir_cache.retain(|_, dir| dir.strong_count() > 0);
        self.dir_cache.insert(location, Arc::downgrade(dir));
    }

    /// `parent` 下名为 `name` 的子目录
    pub fn open_dir(&mut self, parent: &DirHandle, name: &str) -> Result<DirHandle> {
        let entry = lookup(parent, name)?.1;
        self.load_dir(&entry)
    }

    pub fn mkdir(&mut self, parent: &DirHandle, name: &str) -> Result<DirHandle> {
        check_name(name)?;
        let now = self.now();
        let mut dir = parent.lock();
        if dir.find(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        if dir.entries().count() >= dir.len() {
            return Err(Error::DirectoryFull);
        }

        let parent_this = *dir.this();
        let child = Directory::create(
            self.config.directory_entries,
            Some(&parent_this),
            &mut self.free_space,
            &self.disk,
            now,
        )?;

        let mut entry = *child.this();
        let index = match entry.set_name(name).and_then(|()| dir.create_entry(&entry)) {
            Ok(index) => index,
            Err(err) => {
                self.free_space.release_all(child.extents())?;
                return Err(err);
            }
        };
        if let Err(err) = dir.write(&self.disk) {
            // 同时归还子目录的块
            dir.remove_entry(index, false, &mut self.free_space)?;
            return Err(err);
        }
        drop(dir);

        let location = child.location();
        let child = Arc::new(Mutex::new(child));
        self.cache_dir(location, &child);
        log::debug!("mkdir {name:?} at {location}");
        Ok(child)
    }

    pub fn remove_file(&mut self, parent: &DirHandle, name: &str) -> Result<()> {
        let (index, entry) = lookup(parent, name)?;
        if entry.is_dir() {
            return Err(Error::PermissionMismatch);
        }
        if self.is_open(parent, index) {
            log::warn!("{name:?} is still open");
            return Err(Error::PermissionMismatch);
        }
        self.remove(parent, index)
    }

    pub fn remove_dir(&mut self, parent: &DirHandle, name: &str) -> Result<()> {
        check_name(name)?;
        let (index, entry) = lookup(parent, name)?;
        if !entry.is_dir() {
            return Err(Error::PermissionMismatch);
        }
        let location = entry.first_block().ok_or(Error::InvalidArgument)?;
        if location == self.vcb.root_location
            || self.cwd.as_ref().is_some_and(|(cwd, _)| *cwd == location)
        {
            return Err(Error::PermissionMismatch);
        }

        let child = self.load_dir(&entry)?;
        if !child.lock().is_empty() {
            return Err(Error::DirectoryNotEmpty);
        }
        // 释放后的块会分给别人，不能还有句柄指向它
        if Arc::strong_count(&child) > 1 {
            log::warn!("{name:?} is still referenced by another handle");
            return Err(Error::Busy);
        }
        drop(child);

        self.remove(parent, index)?;
        self.dir_cache.remove(&location);
        Ok(())
    }

    fn remove(&mut self, parent: &DirHandle, index: usize) -> Result<()> {
        let mut dir = parent.lock();
        let released = dir.remove_entry(index, false, &mut self.free_space);
        // 目录项已清空，释放失败也要写回
        dir.write(&self.disk)?;
        released
    }

    /// 打开着的文件以打开文件表中的字节数为准，缓冲区里的写入也算
    pub fn stat(&self, parent: &DirHandle, name: &str) -> Result<Stat> {
        let (index, entry) = lookup(parent, name)?;
        let size = self
            .open_file(parent, index)
            .map_or(entry.size, FileControlBlock::size);
        Ok(Stat {
            size,
            block_size: self.vcb.block_size,
            blocks: entry.total_blocks(),
            accessed: entry.accessed,
            modified: entry.modified,
            created: entry.created,
            is_dir: entry.is_dir(),
        })
    }

    /* 文件 */

    pub fn open(
        &mut self,
        parent: &DirHandle,
        name: &str,
        flags: BitFlags<OpenFlag>,
    ) -> Result<FileDescriptor> {
        check_name(name)?;
        let slot = self
            .files
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyOpenFiles)?;
        let writable = flags.intersects(OpenFlag::WRONLY | OpenFlag::RDWR);
        let now = self.now();

        let index = {
            let mut dir = parent.lock();
            let index = match dir.find(name) {
                Some(index) => {
                    if dir.entry(index).is_some_and(DirEntry::is_dir) {
                        return Err(Error::PermissionMismatch);
                    }
                    if writable && flags.contains(OpenFlag::TRUNC) {
                        dir.remove_entry(index, true, &mut self.free_space)?;
                        if let Some(entry) = dir.entry_mut(index) {
                            entry.modified = now;
                        }
                    }
                    index
                }
                None if flags.contains(OpenFlag::CREATE) => {
                    dir.create_entry(&DirEntry::new(name, false, now)?)?
                }
                None => return Err(Error::NotFound),
            };
            if let Some(entry) = dir.entry_mut(index) {
                entry.accessed = now;
            }
            dir.write(&self.disk)?;
            index
        };

        let fcb = FileControlBlock::new(
            parent.clone(),
            index,
            flags,
            self.disk.block_size(),
            self.config.initial_grant,
            self.config.clock,
        )?;
        log::debug!("open {name:?} as fd {slot}: {fcb:?}");
        self.files[slot] = Some(fcb);
        Ok(slot.into())
    }

    pub fn read(&mut self, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize> {
        let fcb = file(&mut self.files, fd)?;
        fcb.read(buf, &self.disk, &mut self.free_space)
    }

    pub fn write(&mut self, fd: FileDescriptor, buf: &[u8]) -> Result<usize> {
        let fcb = file(&mut self.files, fd)?;
        fcb.write(buf, &self.disk, &mut self.free_space)
    }

    pub fn seek(&mut self, fd: FileDescriptor, offset: i64, whence: Whence) -> Result<u32> {
        let fcb = file(&mut self.files, fd)?;
        fcb.seek(offset, whence, &self.disk, &mut self.free_space)
    }

    /// 当前偏移
    pub fn tell(&mut self, fd: FileDescriptor) -> Result<u32> {
        file(&mut self.files, fd).map(|fcb| fcb.offset())
    }

    /// 把缓冲区落盘并释放多余的尾部块，只对可写的文件有意义
    pub fn trim(&mut self, fd: FileDescriptor) -> Result<()> {
        let fcb = file(&mut self.files, fd)?;
        if !fcb.writable() {
            return Err(Error::PermissionMismatch);
        }
        fcb.commit(&self.disk, &mut self.free_space)?;
        fcb.trim(&mut self.free_space)
    }

    /// 关闭文件：落盘、释放多余的块、写回目录
    ///
    /// 无论哪一步失败，描述符都会被释放，返回第一个错误。
    pub fn close(&mut self, fd: FileDescriptor) -> Result<()> {
        let mut fcb = self
            .files
            .get_mut(usize::from(fd))
            .and_then(Option::take)
            .ok_or(Error::BadDescriptor)?;

        let mut result = Ok(());
        if fcb.writable() {
            result = fcb.commit(&self.disk, &mut self.free_space);
            result = result.and(fcb.trim(&mut self.free_space));
        }
        result = result.and(fcb.dir().lock().write(&self.disk));

        log::debug!("close fd {}: {fcb:?}", usize::from(fd));
        result
    }

    fn open_file(&self, dir: &DirHandle, index: usize) -> Option<&FileControlBlock> {
        self.files
            .iter()
            .flatten()
            .find(|fcb| fcb.index() == index && Arc::ptr_eq(fcb.dir(), dir))
    }

    fn is_open(&self, dir: &DirHandle, index: usize) -> bool {
        self.open_file(dir, index).is_some()
    }
}

fn file(files: &mut [Option<FileControlBlock>], fd: FileDescriptor) -> Result<&mut FileControlBlock> {
    files
        .get_mut(usize::from(fd))
        .and_then(Option::as_mut)
        .ok_or(Error::BadDescriptor)
}

/// 名字必须能放进目录项，且不是 "." 或 ".."
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::InvalidArgument);
    }
    DirEntry::default().set_name(name)
}

fn lookup(dir: &DirHandle, name: &str) -> Result<(usize, DirEntry)> {
    let dir = dir.lock();
    let index = dir.find(name).ok_or(Error::NotFound)?;
    let entry = dir.entry(index).copied().ok_or(Error::NotFound)?;
    Ok((index, entry))
}
