//! 卷: 把块设备, 块缓存, 后台线程, 空闲位图和 inode 表组合在一起.
//!
//! 设备布局: 超级块 (扇区 0) -> 空闲位图 (扇区 1 开始) -> 其余扇区由位图分配.
//!
//! 从这一层开始, 所有的数据结构都放在内存上, 并通过 `Arc<BlockCache>` 显式地共享同一个缓存.

use std::sync::Arc;

use log::info;

use super::{
    BlockCache, BlockDevice, CacheDaemon, CacheStats, FreeMap, InodeTable, SectorAllocator,
    SuperBlock,
};
use crate::config::CacheConfig;
use crate::error::{Result, VolumeError};

/// 空闲位图的起始扇区
const FREE_MAP_START: usize = 1;

pub struct Volume {
    cache: Arc<BlockCache>,
    daemon: Option<CacheDaemon>,
    free_map: Arc<FreeMap>,
    inodes: InodeTable,
    total_sectors: usize,
}

impl Volume {
    /// 在块设备上创建并初始化一个卷: 写入超级块, 清空位图并保留超级块和位图本身所在的扇区
    pub fn format(device: Arc<dyn BlockDevice>, config: &CacheConfig) -> Result<Self> {
        let total = device.sector_count();
        let map_sectors = FreeMap::sectors_needed(total);
        // 至少要留下一个可分配的扇区
        if total <= FREE_MAP_START + map_sectors {
            return Err(VolumeError::Geometry(format!(
                "{} sectors cannot hold a super block and {} bitmap sector(s)",
                total, map_sectors
            )));
        }
        if total > u32::MAX as usize {
            return Err(VolumeError::Geometry(format!(
                "{} sectors cannot be addressed by 32-bit pointers",
                total
            )));
        }

        let cache = Arc::new(BlockCache::new(device, config.slots));
        cache
            .write_zeroed(0)
            .modify(0, |super_block: &mut SuperBlock| {
                super_block.initialize(total as u32, FREE_MAP_START as u32, map_sectors as u32)
            });
        let free_map = Arc::new(FreeMap::new(cache.clone(), FREE_MAP_START, total));
        free_map.format(FREE_MAP_START + map_sectors);
        cache.flush();

        info!(
            "formatted volume: {} sectors, {} bitmap sector(s)",
            total, map_sectors
        );
        Ok(Self::assemble(cache, free_map, total, config))
    }

    /// 从一个已经格式化过的块设备上打开卷
    pub fn mount(device: Arc<dyn BlockDevice>, config: &CacheConfig) -> Result<Self> {
        let device_sectors = device.sector_count();
        if device_sectors == 0 {
            return Err(VolumeError::Geometry("empty device".to_string()));
        }
        let cache = Arc::new(BlockCache::new(device, config.slots));
        let (valid, magic, total, start, map_sectors) =
            cache.read(0).read(0, |super_block: &SuperBlock| {
                (
                    super_block.is_valid(),
                    super_block.magic(),
                    super_block.total_sectors as usize,
                    super_block.free_map_start as usize,
                    super_block.free_map_sectors as usize,
                )
            });
        if !valid {
            return Err(VolumeError::BadMagic(magic));
        }
        if total != device_sectors {
            return Err(VolumeError::Geometry(format!(
                "super block records {} sectors but the device has {}",
                total, device_sectors
            )));
        }
        if start != FREE_MAP_START || map_sectors != FreeMap::sectors_needed(total) {
            return Err(VolumeError::Geometry(format!(
                "unexpected bitmap at sector {} spanning {} sector(s)",
                start, map_sectors
            )));
        }

        let free_map = Arc::new(FreeMap::new(cache.clone(), start, total));
        info!(
            "mounted volume: {} sectors, {} free",
            total,
            free_map.free_count()
        );
        Ok(Self::assemble(cache, free_map, total, config))
    }

    fn assemble(
        cache: Arc<BlockCache>,
        free_map: Arc<FreeMap>,
        total_sectors: usize,
        config: &CacheConfig,
    ) -> Self {
        let daemon = config
            .has_daemons()
            .then(|| CacheDaemon::spawn(&cache, config));
        let allocator: Arc<dyn SectorAllocator> = free_map.clone();
        let inodes = InodeTable::new(cache.clone(), allocator);
        Self {
            cache,
            daemon,
            free_map,
            inodes,
            total_sectors,
        }
    }

    /// 分配一个记录扇区并在上面创建长度为 length 的文件, 返回 inode 编号
    pub fn create_file(&self, length: usize) -> Option<usize> {
        let sector = self.free_map.allocate_sector()?;
        if self.inodes.create(sector, length) {
            Some(sector)
        } else {
            self.free_map.release_sector(sector);
            None
        }
    }

    /// 删除文件: 若还有其他打开者, 扇区要等到最后一个关闭时才回收
    pub fn remove_file(&self, inumber: usize) {
        let inode = self.inodes.open(inumber);
        inode.remove();
        self.inodes.close(inode);
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn total_sectors(&self) -> usize {
        self.total_sectors
    }

    pub fn free_sectors(&self) -> usize {
        self.free_map.free_count()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// 停止后台线程, 同步写回所有脏槽位
    pub fn shutdown(mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown();
        }
        self.cache.flush();
        info!("volume shut down, cache stats: {:?}", self.cache.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn format_then_mount() {
        let device = Arc::new(MemDevice::new(5000));
        let volume = Volume::format(device.clone(), &CacheConfig::manual(8)).unwrap();
        // 超级块 + 2 个位图扇区
        assert_eq!(volume.free_sectors(), 5000 - 3);
        let inumber = volume.create_file(1000).unwrap();
        volume.shutdown();

        let volume = Volume::mount(device, &CacheConfig::manual(8)).unwrap();
        assert_eq!(volume.total_sectors(), 5000);
        assert_eq!(volume.free_sectors(), 5000 - 3 - 3);
        assert_eq!(volume.inodes().open(inumber).length(), 1000);
    }

    #[test]
    fn mount_rejects_unformatted_device() {
        let device = Arc::new(MemDevice::new(64));
        assert!(matches!(
            Volume::mount(device, &CacheConfig::manual(4)),
            Err(VolumeError::BadMagic(0))
        ));
    }

    #[test]
    fn format_rejects_tiny_device() {
        let device = Arc::new(MemDevice::new(2));
        assert!(matches!(
            Volume::format(device, &CacheConfig::manual(4)),
            Err(VolumeError::Geometry(_))
        ));
    }

    #[test]
    fn remove_file_restores_free_count() {
        let device = Arc::new(MemDevice::new(1024));
        let volume = Volume::format(device, &CacheConfig::manual(8)).unwrap();
        let before = volume.free_sectors();
        let inumber = volume.create_file(100 * 512).unwrap();
        assert!(volume.free_sectors() < before);
        volume.remove_file(inumber);
        assert_eq!(volume.free_sectors(), before);
        volume.shutdown();
    }

    #[test]
    fn create_file_fails_cleanly_when_full() {
        let device = Arc::new(MemDevice::new(64));
        let volume = Volume::format(device, &CacheConfig::manual(8)).unwrap();
        let before = volume.free_sectors();
        assert_eq!(volume.create_file(200 * 512), None);
        assert_eq!(volume.free_sectors(), before);
    }
}
