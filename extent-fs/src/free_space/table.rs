//! 区段表的分页：逻辑下标 `i` 位于第 `i / capacity` 页的第 `i % capacity` 格，
//! 第 0 页是主表，第 k 页是三级表中登记的第 k-1 张次级表。

use alloc::vec;
use alloc::vec::Vec;

use super::FreeSpaceMap;
use crate::layout::{Extent, Slot, as_bytes, as_bytes_mut};
use crate::{Error, FREE_SPACE_START, Result};

impl FreeSpaceMap {
    #[inline]
    pub(super) fn capacity(&self) -> usize {
        self.info.table_capacity as usize
    }

    /// 共有多少张表（主表加次级表）
    #[inline]
    pub fn table_count(&self) -> u32 {
        1 + self.info.tertiary_length
    }

    pub(super) fn slot(&mut self, index: usize) -> Result<Slot> {
        let capacity = self.capacity();
        self.switch_page(index / capacity)?;
        Ok(self.page[index % capacity].into())
    }

    pub(super) fn set_slot(&mut self, index: usize, slot: Slot) -> Result<()> {
        let capacity = self.capacity();
        self.switch_page(index / capacity)?;
        self.page[index % capacity] = slot.into();
        Ok(())
    }

    /// 写回驻留页，再读入第 `page` 页
    fn switch_page(&mut self, page: usize) -> Result<()> {
        if page == self.info.current_table as usize {
            return Ok(());
        }
        log::trace!("free space page {} -> {page}", self.info.current_table);

        self.flush()?;
        let location = self.page_location(page)?;
        self.read_page(location)?;
        self.info.current_table = page as u32;
        Ok(())
    }

    pub(super) fn read_page(&mut self, location: u32) -> Result<()> {
        self.disk.read(location, as_bytes_mut(&mut self.page))
    }

    fn page_location(&mut self, page: usize) -> Result<u32> {
        if page == 0 {
            return Ok(FREE_SPACE_START);
        }
        if page > self.info.tertiary_length as usize {
            log::error!(
                "free space page {page} was never created ({} secondary tables)",
                self.info.tertiary_length
            );
            return Err(Error::InvalidArgument);
        }
        Ok(self.load_tertiary()?[page - 1])
    }

    /// 驻留页的位置，不触发读盘
    pub(super) fn resident_location(&self) -> Result<u32> {
        match self.info.current_table as usize {
            0 => Ok(FREE_SPACE_START),
            page => self
                .tertiary
                .as_ref()
                .and_then(|tertiary| tertiary.get(page - 1).copied())
                .ok_or(Error::InvalidArgument),
        }
    }

    fn load_tertiary(&mut self) -> Result<&mut [u32]> {
        if self.tertiary.is_none() {
            if !self.info.has_tertiary() {
                return Err(Error::InvalidArgument);
            }
            let mut tertiary = vec![0u32; self.tertiary_capacity()];
            self.disk
                .read(self.info.tertiary_location, as_bytes_mut(&mut tertiary))?;
            self.tertiary = Some(tertiary);
        }
        self.tertiary.as_deref_mut().ok_or(Error::InvalidArgument)
    }

    #[inline]
    fn tertiary_capacity(&self) -> usize {
        self.disk.block_size() / core::mem::size_of::<u32>()
    }

    fn write_tertiary(&self) -> Result<()> {
        match &self.tertiary {
            Some(tertiary) => self
                .disk
                .write(self.info.tertiary_location, as_bytes(tertiary)),
            None => Ok(()),
        }
    }

    /// 向分配器自身申请一张次级表，并登记到三级表
    pub(super) fn create_secondary(&mut self) -> Result<()> {
        if !self.info.has_tertiary() {
            let location = first_block(&self.allocate(1, 1)?)?;
            self.info.tertiary_location = location;
            self.info.tertiary_length = 0;
            self.tertiary = Some(vec![0; self.tertiary_capacity()]);
            self.write_tertiary()?;
            log::info!("tertiary free space table created at {location}");
        }

        let registered = self.info.tertiary_length as usize;
        if registered >= self.load_tertiary()?.len() {
            log::warn!("tertiary free space table is full");
            return Err(Error::OutOfSpace);
        }

        let reserved = self.info.reserved_blocks;
        let location = first_block(&self.allocate(reserved, reserved)?)?;

        // 新表先整页写成空位，换页时再读入
        let blank = vec![Extent::VACANT; self.capacity()];
        self.disk.write(location, as_bytes(&blank))?;

        self.load_tertiary()?[registered] = location;
        self.info.tertiary_length += 1;
        self.write_tertiary()?;

        log::info!(
            "secondary free space table {} created at {location}",
            registered + 1
        );
        Ok(())
    }

    /// 三级表登记的次级表位置
    pub fn secondary_locations(&mut self) -> Result<Vec<u32>> {
        if !self.info.has_tertiary() {
            return Ok(Vec::new());
        }
        let len = self.info.tertiary_length as usize;
        Ok(self.load_tertiary()?[..len].to_vec())
    }

    #[inline]
    pub fn tertiary_location(&self) -> Option<u32> {
        self.info
            .has_tertiary()
            .then_some(self.info.tertiary_location)
    }
}

/// 要求连续的申请只会得到一个区段
#[inline]
fn first_block(extents: &[Extent]) -> Result<u32> {
    extents.first().map(|e| e.start).ok_or(Error::OutOfSpace)
}
