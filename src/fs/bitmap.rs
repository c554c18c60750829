//! 空闲扇区位图
//!
//! 位图由若干个扇区组成, 每个扇区大小为 512 bytes, 即 4096 bits.
//! 每个 bit 都代表设备上一个扇区的分配状态, 0 意味着未分配, 而 1 则意味着已经分配出去.
//!
//! 位图所要做的事情是通过基于 bit 为单位的分配(寻找一个为 0 的 bit 位并设置为 1)
//! 和回收(将bit位清零)来进行扇区的分配和回收. 位图扇区本身也经过块缓存读写.

use std::sync::Arc;

use super::{BlockCache, SECTOR_BITS};

/// 空闲扇区分配器. 缓存与索引层只通过这个接口申请和归还扇区
pub trait SectorAllocator: Send + Sync {
    /// 分配一个扇区, 空间耗尽时返回 None
    fn allocate_sector(&self) -> Option<usize>;

    /// 归还一个扇区. 归还未分配的扇区是程序错误
    fn release_sector(&self, sector: usize);
}

/// BitmapBlock 将位图区域中的一个扇区解释为长度为 64 的一个 u64 数组,
/// 每个 u64 打包了一组 64 bits, 于是整个数组包含 64 * 64 = 4096 bits, 且可以以组为单位进行操作
type BitmapBlock = [u64; 64];

pub struct FreeMap {
    cache: Arc<BlockCache>,
    /// 位图区域的起始扇区编号
    start_sector: usize,
    /// 位图占用的扇区数
    sectors: usize,
    /// 位图管理的扇区总数, 超出部分的 bit 恒为 1
    total: usize,
}

impl FreeMap {
    pub fn new(cache: Arc<BlockCache>, start_sector: usize, total: usize) -> Self {
        Self {
            cache,
            start_sector,
            sectors: Self::sectors_needed(total),
            total,
        }
    }

    /// 管理 total 个扇区需要的位图扇区数
    pub fn sectors_needed(total: usize) -> usize {
        (total + SECTOR_BITS - 1) / SECTOR_BITS
    }

    pub fn sectors(&self) -> usize {
        self.sectors
    }

    /// 清空位图, 然后将 [0, reserved) 以及超出 total 的 bit 标记为已分配
    pub fn format(&self, reserved: usize) {
        assert!(reserved <= self.total);
        for block in 0..self.sectors {
            let mut guard = self.cache.write_zeroed(self.start_sector + block);
            guard.modify(0, |bitmap_block: &mut BitmapBlock| {
                for bit in 0..SECTOR_BITS {
                    let pos = block * SECTOR_BITS + bit;
                    if pos < reserved || pos >= self.total {
                        bitmap_block[bit / 64] |= 1u64 << (bit % 64);
                    }
                }
            });
        }
    }

    /// 尚未分配的扇区数
    pub fn free_count(&self) -> usize {
        (0..self.sectors)
            .map(|block| {
                self.cache
                    .read(self.start_sector + block)
                    .read(0, |bitmap_block: &BitmapBlock| {
                        bitmap_block
                            .iter()
                            .map(|bits64| bits64.count_zeros() as usize)
                            .sum::<usize>()
                    })
            })
            .sum()
    }

    pub fn is_allocated(&self, sector: usize) -> bool {
        let (block, bits64_pos, inner_pos) = decomposition(sector);
        self.cache
            .read(self.start_sector + block)
            .read(0, |bitmap_block: &BitmapBlock| {
                bitmap_block[bits64_pos] & (1u64 << inner_pos) != 0
            })
    }
}

impl SectorAllocator for FreeMap {
    /// 遍历区域中的每个扇区, 再在每个扇区中以 bit 组(每组 64 bits)为单位进行遍历,
    /// 找到一个尚未被全部分配出去的组, 最后在里面分配一个 bit.
    fn allocate_sector(&self) -> Option<usize> {
        for block in 0..self.sectors {
            // 先以只读方式检查, 已经分配满的位图扇区不会被标记为脏
            let has_free = self
                .cache
                .read(self.start_sector + block)
                .read(0, |bitmap_block: &BitmapBlock| {
                    bitmap_block.iter().any(|bits64| *bits64 != u64::MAX)
                });
            if !has_free {
                continue;
            }
            let pos = self.cache.write(self.start_sector + block).modify(
                0,
                |bitmap_block: &mut BitmapBlock| -> Option<usize> {
                    if let Some((bits64_pos, inner_pos)) = bitmap_block
                        .iter()
                        .enumerate()
                        .find(|(_, bits64)| **bits64 != u64::MAX)
                        .map(|(bits64_pos, bits64)| (bits64_pos, bits64.trailing_ones() as usize))
                    {
                        bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                        Some(block * SECTOR_BITS + bits64_pos * 64 + inner_pos)
                    } else {
                        None
                    }
                },
            );
            if pos.is_some() {
                return pos;
            }
        }
        None
    }

    fn release_sector(&self, sector: usize) {
        assert!(sector < self.total, "release of sector {} out of range", sector);
        let (block, bits64_pos, inner_pos) = decomposition(sector);
        self.cache
            .write(self.start_sector + block)
            .modify(0, |bitmap_block: &mut BitmapBlock| {
                assert!(
                    bitmap_block[bits64_pos] & (1u64 << inner_pos) != 0,
                    "double free of sector {}",
                    sector
                );
                bitmap_block[bits64_pos] &= !(1u64 << inner_pos);
            });
    }
}

/// 将bit编号 bit 分解为区域中的扇区编号, 扇区内的组编号 bits64_pos 以及组内编号 inner_pos 的三元组
fn decomposition(mut bit: usize) -> (usize, usize, usize) {
    let block = bit / SECTOR_BITS;
    bit %= SECTOR_BITS;
    (block, bit / 64, bit % 64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn free_map(total: usize, reserved: usize) -> FreeMap {
        let cache = Arc::new(BlockCache::new(Arc::new(MemDevice::new(total)), 8));
        let map = FreeMap::new(cache, 1, total);
        map.format(reserved);
        map
    }

    #[test]
    fn allocates_after_reserved_area() {
        let map = free_map(100, 2);
        assert_eq!(map.free_count(), 98);
        assert_eq!(map.allocate_sector(), Some(2));
        assert_eq!(map.allocate_sector(), Some(3));
        assert!(map.is_allocated(3));
        map.release_sector(2);
        assert!(!map.is_allocated(2));
        assert_eq!(map.allocate_sector(), Some(2));
    }

    #[test]
    fn never_hands_out_sectors_past_the_device() {
        let map = free_map(10, 2);
        let got: Vec<usize> = std::iter::from_fn(|| map.allocate_sector()).collect();
        assert_eq!(got, (2..10).collect::<Vec<_>>());
        assert_eq!(map.free_count(), 0);
    }

    #[test]
    fn spans_multiple_bitmap_sectors() {
        let total = SECTOR_BITS + 100;
        let map = free_map(total, SECTOR_BITS - 1);
        assert_eq!(map.sectors(), 2);
        assert_eq!(map.allocate_sector(), Some(SECTOR_BITS - 1));
        assert_eq!(map.allocate_sector(), Some(SECTOR_BITS));
        assert_eq!(map.free_count(), 99);
    }

    #[test]
    fn full_bitmap_sectors_stay_clean() {
        let total = SECTOR_BITS + 100;
        let device = Arc::new(MemDevice::new(total));
        let cache = Arc::new(BlockCache::new(device.clone(), 8));
        let map = FreeMap::new(cache.clone(), 1, total);
        map.format(SECTOR_BITS);
        cache.flush();
        let writes = device.writes();

        assert_eq!(map.allocate_sector(), Some(SECTOR_BITS));
        cache.flush();
        // 只有第二个位图扇区被写回
        assert_eq!(device.writes(), writes + 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let map = free_map(100, 2);
        let sector = map.allocate_sector().unwrap();
        map.release_sector(sector);
        map.release_sector(sector);
    }
}
