//! 磁盘数据结构层的代码在 layout.rs 和 bitmap.rs 中
//!
//! 两个数据结构 [`SuperBlock`], [`DiskInode`]
//!
//! 设备按照扇区编号从小到大顺序地分成 3 个区域:
//!
//! - 扇区 0 存放超级块 ([`SuperBlock`]), 以魔数的形式提供合法性检查, 同时记录空闲位图的位置.
//!   扇区指针为 0 表示 "未分配", 因此扇区 0 永远不会被分配给文件
//!
//! - 之后的若干个扇区是空闲扇区位图, 每个 bit 对应设备上的一个扇区
//!
//! - 剩下的扇区由位图统一分配, 既可以是索引节点记录, 也可以是索引块或数据块

use std::fmt::{Debug, Formatter, Result};

use super::{
    DIRECT_COUNT, ENTRIES_PER_SECTOR, INODE_MAGIC, SECTOR_SIZE, SINGLE_INDIRECT_COUNT,
    VOLUME_MAGIC,
};

#[repr(C)]
pub struct SuperBlock {
    magic: u32, // 用于文件系统合法性验证的魔数
    pub total_sectors: u32,
    pub free_map_start: u32,
    pub free_map_sectors: u32,
}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("magic", &self.magic)
            .field("total_sectors", &self.total_sectors)
            .field("free_map_start", &self.free_map_start)
            .field("free_map_sectors", &self.free_map_sectors)
            .finish()
    }
}

impl SuperBlock {
    pub fn initialize(&mut self, total_sectors: u32, free_map_start: u32, free_map_sectors: u32) {
        *self = Self {
            magic: VOLUME_MAGIC,
            total_sectors,
            free_map_start,
            free_map_sectors,
        };
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// is_valid 可以通过魔数判断超级块所在的文件系统是否合法
    pub fn is_valid(&self) -> bool {
        self.magic == VOLUME_MAGIC
    }
}

/// 索引块 IndirectBlock 实质上是一个 u32 数组, 每个都指向一个下一级索引块或者数据块
pub type IndirectBlock = [u32; ENTRIES_PER_SECTOR]; // size = 512B / 4B(u32) = 128

/// 记录中除指针和 length/magic 之外剩余的 u32 个数
const UNUSED_COUNT: usize = ENTRIES_PER_SECTOR - DIRECT_COUNT - SINGLE_INDIRECT_COUNT - 1 - 2;

/// 每个文件在磁盘上均以一个 DiskInode 记录的形式存储, 一条记录恰好占据一个扇区.
///
/// 这个布局决定了磁盘格式, 字段的顺序和大小都不能改变:
/// 60 个直接索引 + 40 个一级间接索引 + 1 个二级间接索引 + length + magic, 余下部分补零.
///
/// 可寻址的扇区数为 60 + 40 * 128 + 128 * 128 = 21564, 约 10.5 MiB
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    /// 直接索引
    pub direct: [u32; DIRECT_COUNT],
    /// 一级间接索引: 每个指向一个索引块, 索引块中的每个 u32 指向一个数据块
    pub single_indirect: [u32; SINGLE_INDIRECT_COUNT],
    /// 二级间接索引: 指向的索引块中的每个 u32 指向一个一级索引块
    pub double_indirect: u32,
    /// 文件内容的字节数
    pub length: u32,
    pub magic: u32,
    unused: [u32; UNUSED_COUNT],
}

const _: () = assert!(std::mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl Debug for DiskInode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("DiskInode")
            .field("length", &self.length)
            .field("magic", &self.magic)
            .field("direct", &&self.direct[..])
            .field("single_indirect", &&self.single_indirect[..])
            .field("double_indirect", &self.double_indirect)
            .finish()
    }
}

impl DiskInode {
    pub fn initialize(&mut self, length: u32) {
        *self = Self::empty();
        self.length = length;
        self.magic = INODE_MAGIC;
    }

    pub fn empty() -> Self {
        Self {
            direct: [0; DIRECT_COUNT],
            single_indirect: [0; SINGLE_INDIRECT_COUNT],
            double_indirect: 0,
            length: 0,
            magic: 0,
            unused: [0; UNUSED_COUNT],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn records_fill_exactly_one_sector() {
        assert_eq!(size_of::<DiskInode>(), SECTOR_SIZE);
        assert_eq!(size_of::<IndirectBlock>(), SECTOR_SIZE);
        assert!(size_of::<SuperBlock>() <= SECTOR_SIZE);
        assert!(align_of::<DiskInode>() <= 8);
    }

    #[test]
    fn initialize_clears_pointers() {
        let mut inode = DiskInode::empty();
        inode.direct[3] = 77;
        inode.double_indirect = 5;
        inode.initialize(1000);
        assert!(inode.is_valid());
        assert_eq!(inode.length, 1000);
        assert!(inode.direct.iter().all(|p| *p == 0));
        assert_eq!(inode.double_indirect, 0);
    }
}
