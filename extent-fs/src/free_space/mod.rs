//! # 空闲空间管理层
//!
//! 空闲空间用区段表描述，逻辑上是一个数组，物理上分页存放：
//! - 主表：固定在 1 号块起，占 `reserved_blocks` 块，挂载期间始终可以换回；
//! - 次级表：主表写满后按需向分配器申请，大小与主表相同；
//! - 三级表：一整块的块号数组，登记每张次级表的位置，第一次创建次级表时才创建。
//!
//! 内存中同一时刻只驻留一页，换页前必须先把驻留页写回，
//! 这也是分配器唯一的串行化手段。
//!
//! 取走整段的表项只标记为空位，不压缩整张表；
//! 释放时优先与相邻空闲段合并，其次复用第一个空位，最后才追加。

mod table;

use alloc::vec;
use alloc::vec::Vec;

use crate::disk::Disk;
use crate::layout::{Extent, FreeSpaceInfo, Slot, as_bytes};
use crate::{Error, FREE_SPACE_START, Result};

const EXTENT_SIZE: usize = core::mem::size_of::<Extent>();

#[derive(Debug)]
pub struct FreeSpaceMap {
    disk: Disk,
    total_blocks: u32,
    info: FreeSpaceInfo,
    /// 驻留页，页号为 `info.current_table`
    page: Vec<Extent>,
    /// 三级表，首次用到时才读入
    tertiary: Option<Vec<u32>>,
}

impl FreeSpaceMap {
    /// 在 1 号块起建立一张只有一个空闲段的主表
    pub fn format(disk: Disk, total_blocks: u32, percent: usize) -> Result<Self> {
        let block_size = disk.block_size();
        let budget = total_blocks as usize * percent * EXTENT_SIZE;
        let reserved = budget.div_ceil(100 * block_size).max(1) as u32;
        let data_start = FREE_SPACE_START + reserved;
        if data_start >= total_blocks {
            log::error!("volume of {total_blocks} blocks cannot hold a {reserved}-block table");
            return Err(Error::InvalidArgument);
        }

        let capacity = reserved as usize * block_size / EXTENT_SIZE;
        let info = FreeSpaceInfo::new(total_blocks - data_start, reserved, capacity as u32);

        let mut page = vec![Extent::VACANT; capacity];
        page[0] = Extent::new(data_start, total_blocks - data_start);

        let map = Self {
            disk,
            total_blocks,
            info,
            page,
            tertiary: None,
        };
        map.flush()?;

        log::info!(
            "free space formatted: {} blocks free, {reserved} table blocks, {capacity} extents per table",
            info.total_free
        );
        Ok(map)
    }

    /// 按卷控制块中的簿记信息读回主表
    pub fn load(disk: Disk, total_blocks: u32, mut info: FreeSpaceInfo) -> Result<Self> {
        let expected = info.reserved_blocks as usize * disk.block_size() / EXTENT_SIZE;
        if info.reserved_blocks == 0 || info.table_capacity as usize != expected {
            log::error!("inconsistent free space bookkeeping: {info:?}");
            return Err(Error::InvalidArgument);
        }

        info.current_table = 0;
        let mut map = Self {
            disk,
            total_blocks,
            info,
            page: vec![Extent::VACANT; expected],
            tertiary: None,
        };
        map.read_page(FREE_SPACE_START)?;
        Ok(map)
    }

    #[inline]
    pub fn info(&self) -> FreeSpaceInfo {
        self.info
    }

    #[inline]
    pub fn free_blocks(&self) -> u32 {
        self.info.total_free
    }

    /// 第一个可分配的块：主表之后
    #[inline]
    pub fn data_start(&self) -> u32 {
        FREE_SPACE_START + self.info.reserved_blocks
    }

    /// 申请 `n` 块，只使用长度不小于 `min_contig` 的空闲段
    ///
    /// 从表尾向表头扫描，整段取走的表项标记为空位，部分取用的表项从头部截取。
    /// 空间不足时表保持原样。
    pub fn allocate(&mut self, n: u32, min_contig: u32) -> Result<Vec<Extent>> {
        let min_contig = min_contig.max(1);
        if n == 0 {
            return Err(Error::InvalidArgument);
        }
        if n < min_contig || n > self.info.total_free {
            log::warn!(
                "cannot allocate {n} blocks (min run {min_contig}), {} free",
                self.info.total_free
            );
            return Err(Error::OutOfSpace);
        }

        // 先确认可用的空闲段足够，失败时不改动任何表项
        let mut available = 0;
        for i in (0..self.info.extent_length as usize).rev() {
            if let Slot::Free(extent) = self.slot(i)?
                && extent.count >= min_contig
            {
                available += extent.count;
                if available >= n {
                    break;
                }
            }
        }
        if available < n {
            log::warn!("cannot allocate {n} blocks with runs of at least {min_contig}");
            return Err(Error::OutOfSpace);
        }

        let mut granted = Vec::new();
        let mut need = n;
        for i in (0..self.info.extent_length as usize).rev() {
            let Slot::Free(mut extent) = self.slot(i)? else {
                continue;
            };
            if extent.count < min_contig {
                continue;
            }

            if extent.count <= need {
                need -= extent.count;
                granted.push(extent);
                self.set_slot(i, Slot::Vacant)?;
            } else {
                granted.push(Extent::new(extent.start, need));
                extent.start += need;
                extent.count -= need;
                need = 0;
                self.set_slot(i, Slot::Free(extent))?;
            }
            if need == 0 {
                break;
            }
        }

        self.info.total_free -= n;
        self.shrink_tail()?;
        self.flush()?;

        log::debug!("allocated {n} blocks as {granted:?}");
        Ok(granted)
    }

    /// 把 `[start, start + count)` 归还给空闲区段表
    pub fn release(&mut self, start: u32, count: u32) -> Result<()> {
        let Some(end) = start.checked_add(count) else {
            return Err(Error::InvalidArgument);
        };
        if count == 0 || start < self.data_start() || end > self.total_blocks {
            log::error!("release of [{start}, {end}) is outside the data area");
            return Err(Error::InvalidArgument);
        }
        let released = Extent::new(start, count);

        let mut before = None;
        let mut after = None;
        let mut vacant = None;
        for i in 0..self.info.extent_length as usize {
            match self.slot(i)? {
                Slot::Free(extent) if extent.overlaps(&released) => {
                    log::error!("release of {released:?} overlaps free extent {extent:?}");
                    return Err(Error::Overlap);
                }
                Slot::Free(extent) if extent.end() == start => before = Some((i, extent)),
                Slot::Free(extent) if extent.start == end => after = Some((i, extent)),
                Slot::Free(_) => {}
                Slot::Vacant => {
                    vacant.get_or_insert(i);
                }
            }
        }

        match (before, after) {
            (Some((i, mut prev)), Some((j, next))) => {
                prev.count += count + next.count;
                self.set_slot(i, Slot::Free(prev))?;
                self.set_slot(j, Slot::Vacant)?;
            }
            (Some((i, mut prev)), None) => {
                prev.count += count;
                self.set_slot(i, Slot::Free(prev))?;
            }
            (None, Some((j, mut next))) => {
                next.start = start;
                next.count += count;
                self.set_slot(j, Slot::Free(next))?;
            }
            (None, None) => {
                let index = match vacant {
                    Some(i) => i,
                    None => self.push_slot()?,
                };
                self.set_slot(index, Slot::Free(released))?;
            }
        }

        self.info.total_free += count;
        self.shrink_tail()?;
        self.flush()?;

        log::debug!("released {released:?}, {} blocks free", self.info.total_free);
        Ok(())
    }

    /// 依次归还多个区段，遇到错误仍继续，返回第一个错误
    pub fn release_all(&mut self, extents: &[Extent]) -> Result<()> {
        let mut result = Ok(());
        for extent in extents {
            if let Err(err) = self.release(extent.start, extent.count) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// 全部空闲段，按表项顺序
    pub fn free_extents(&mut self) -> Result<Vec<Extent>> {
        let mut extents = Vec::new();
        for i in 0..self.info.extent_length as usize {
            if let Slot::Free(extent) = self.slot(i)? {
                extents.push(extent);
            }
        }
        Ok(extents)
    }

    /// 表尾的空位不再计入表长
    fn shrink_tail(&mut self) -> Result<()> {
        while self.info.extent_length > 1 {
            let last = self.info.extent_length as usize - 1;
            if self.slot(last)? != Slot::Vacant {
                break;
            }
            self.info.extent_length -= 1;
        }
        Ok(())
    }

    /// 在表尾追加一个空位，必要时创建新的次级表；返回可写入的下标
    fn push_slot(&mut self) -> Result<usize> {
        let index = self.info.extent_length as usize;
        let page = index / self.capacity();
        if page > self.info.tertiary_length as usize {
            self.create_secondary()?;
            // 建表本身会占用空闲段，可能腾出空位
            if let Some(i) = self.find_vacant()? {
                return Ok(i);
            }
        }
        self.info.extent_length += 1;
        Ok(self.info.extent_length as usize - 1)
    }

    fn find_vacant(&mut self) -> Result<Option<usize>> {
        for i in 0..self.info.extent_length as usize {
            if self.slot(i)? == Slot::Vacant {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// 把驻留页写回
    pub fn flush(&self) -> Result<()> {
        let location = self.resident_location()?;
        self.disk.write(location, as_bytes(&self.page))
    }
}
