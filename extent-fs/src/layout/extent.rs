use super::Pod;

/// 一段连续的块：`[start, start + count)`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Extent {
    pub start: u32,
    pub count: u32,
}

unsafe impl Pod for Extent {}

/// 空闲区段表中的一格
///
/// 分配时整段取走的表项不做压缩，只标记为 [`Slot::Vacant`]，
/// 磁盘上以 `{u32::MAX, 0}` 表示。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Free(Extent),
    Vacant,
}

impl Extent {
    pub const VACANT: Self = Self {
        start: u32::MAX,
        count: 0,
    };

    #[inline]
    pub const fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// 尾后块号
    #[inline]
    pub const fn end(&self) -> u32 {
        self.start + self.count
    }

    #[inline]
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    #[inline]
    pub fn contains(&self, lba: u32) -> bool {
        (self.start..self.end()).contains(&lba)
    }
}

impl From<Extent> for Slot {
    fn from(raw: Extent) -> Self {
        if raw == Extent::VACANT {
            Slot::Vacant
        } else {
            Slot::Free(raw)
        }
    }
}

impl From<Slot> for Extent {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::Free(extent) => extent,
            Slot::Vacant => Extent::VACANT,
        }
    }
}
