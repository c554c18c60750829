mod bitmap;
mod block_cache;
mod block_dev;
mod cache_daemon;
mod extent;
mod layout;
mod slot_lock;
mod vfs;
mod volume;

extern crate log;

/// Use a sector size of 512 bytes
pub const SECTOR_SIZE: usize = 512;
/// 扇区内可以存放的扇区指针 (u32) 数量
pub const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / 4;
/// 块缓存槽位的默认数量
pub const CACHE_SLOTS: usize = 64;
/// Magic number for inode record sanity check
pub const INODE_MAGIC: u32 = 0x494e_4f44;
/// Magic number for the super block
pub const VOLUME_MAGIC: u32 = 0x3b80_0002;
/// The number of direct pointers in an inode record
pub const DIRECT_COUNT: usize = 60;
/// The number of single-indirect pointers in an inode record
pub const SINGLE_INDIRECT_COUNT: usize = 40;
/// The upper bound of direct sector index
pub const DIRECT_BOUND: usize = DIRECT_COUNT;
/// The upper bound of single-indirect sector index
pub const SINGLE_INDIRECT_BOUND: usize = DIRECT_BOUND + SINGLE_INDIRECT_COUNT * ENTRIES_PER_SECTOR;
/// The upper bound of double-indirect sector index, 即单个文件最多可寻址的扇区数
pub const DOUBLE_INDIRECT_BOUND: usize =
    SINGLE_INDIRECT_BOUND + ENTRIES_PER_SECTOR * ENTRIES_PER_SECTOR;
/// 扇区的 bit 数量
pub const SECTOR_BITS: usize = SECTOR_SIZE * 8;

pub use bitmap::{FreeMap, SectorAllocator};
pub use block_cache::{BlockCache, CacheStats, SectorReadGuard, SectorWriteGuard};
pub use block_dev::BlockDevice;
pub use cache_daemon::CacheDaemon;
pub use extent::{byte_to_sector, create, extend, footprint, free, sectors_for};
pub use layout::*;
pub use slot_lock::{LockState, SlotLock};
pub use vfs::{Inode, InodeTable};
pub use volume::Volume;
