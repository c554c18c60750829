//! 块缓存层: 在内存中缓存磁盘扇区的数据, 避免频繁读写磁盘
//!
//! 缓存由固定数量的槽位 [`CacheSlot`] 组成, 在启动时一次性分配, 之后只会替换槽位中的内容.
//! 每个槽位都有自己的读写锁 [`SlotLock`], 因此不同扇区上的读写可以完全并行,
//! 同一扇区上的多个读者也可以并行, 写者则独占整个槽位.
//!
//! 对外暴露的不是槽位的引用, 而是 [`SectorReadGuard`] / [`SectorWriteGuard`]:
//! guard 中只保存槽位下标, drop 时释放对应的锁 (即 end-read / end-write).
//!
//! 查找与认领槽位的过程由一把全局的表锁 `table` 保护, 保证同一扇区最多只会出现在一个槽位中.
//! 持有表锁时只会尝试性地 (try) 获取槽位锁, 阻塞等待槽位锁时一定已经释放了表锁.
//!
//! 槽位满时使用一种近似 LRU 的替换算法: 每个槽位有一个 64 位的 recency 计数,
//! 由后台的最近访问时钟定期老化 (见 [`BlockCache::age_slots`]), 驱逐时选择计数最小的空闲槽位.

use std::{
    cell::UnsafeCell,
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use log::trace;
use spin::Mutex;

use super::{BlockDevice, SlotLock, SECTOR_SIZE};

/// 空槽位的扇区标签
const EMPTY: usize = usize::MAX;
/// recency 的最高位, 表示最近一个周期内被访问过
const RECENT_BIT: u64 = 1 << 63;

/// 扇区缓冲区, 按 8 字节对齐以便将其解释为磁盘上的数据结构
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SIZE]);

/// Cached sector inside memory
pub struct CacheSlot {
    lock: SlotLock,
    /// 当前缓存的扇区编号, 空槽位为 EMPTY. 只有在持有表锁和槽位独占锁时才会修改
    sector: AtomicUsize,
    /// 槽位中的数据是否可信
    valid: AtomicBool,
    /// 数据与磁盘上的副本不一致
    dirty: AtomicBool,
    /// 自上次时钟扫描以来是否被访问过
    accessed: AtomicBool,
    recency: AtomicU64,
    data: UnsafeCell<SectorBuf>,
}

// data 只会在持有 lock 的情况下被访问: 共享锁只读, 独占锁可写
unsafe impl Sync for CacheSlot {}

impl CacheSlot {
    fn new() -> Self {
        Self {
            lock: SlotLock::new(),
            sector: AtomicUsize::new(EMPTY),
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            accessed: AtomicBool::new(false),
            recency: AtomicU64::new(0),
            data: UnsafeCell::new(SectorBuf([0; SECTOR_SIZE])),
        }
    }

    fn holds(&self, sector: usize) -> bool {
        self.sector.load(Ordering::Acquire) == sector && self.valid.load(Ordering::Acquire)
    }

    /// 每次访问都置位 accessed, 并强制置位 recency 的最高位, 避免刚刚访问过的槽位被当作冷数据驱逐
    fn touch(&self) {
        self.accessed.store(true, Ordering::Release);
        self.recency.fetch_or(RECENT_BIT, Ordering::AcqRel);
    }

    fn release(&self, access: Access) {
        match access {
            Access::Shared => self.lock.release_shared(),
            Access::Exclusive => self.lock.release_exclusive(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Shared,
    Exclusive,
}

/// 未命中时如何填充新槽位
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fill {
    /// 从设备读入
    Load,
    /// 在设备上清零, 缓冲区直接置零
    Zero,
}

/// 缓存统计信息的快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// 驱逐扫描中尝试过的槽位数
    pub scanned: u64,
    pub write_backs: u64,
    pub prefetches: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    scanned: AtomicU64,
    write_backs: AtomicU64,
    prefetches: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// 块缓存: 固定容量的槽位表
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    sector_count: usize,
    slots: Box<[CacheSlot]>,
    /// 保护槽位标签的查找与认领
    table: Mutex<()>,
    /// 等待预读的扇区, 每次 read/write 都会把它设为 sector + 1
    read_ahead: Mutex<Option<usize>>,
    counters: Counters,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, slots: usize) -> Self {
        assert!(slots > 0, "block cache needs at least one slot");
        let sector_count = device.sector_count();
        Self {
            device,
            sector_count,
            slots: (0..slots).map(|_| CacheSlot::new()).collect(),
            table: Mutex::new(()),
            read_ahead: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 以共享方式获取扇区, 未缓存时会从磁盘读入, 可能发生缓存替换
    pub fn read(&self, sector: usize) -> SectorReadGuard<'_> {
        let slot = self.lookup(sector, Access::Shared, Fill::Load);
        self.hint_read_ahead(sector);
        SectorReadGuard { cache: self, slot }
    }

    /// 以独占方式获取扇区, guard drop 时槽位被标记为脏
    pub fn write(&self, sector: usize) -> SectorWriteGuard<'_> {
        let slot = self.lookup(sector, Access::Exclusive, Fill::Load);
        self.hint_read_ahead(sector);
        SectorWriteGuard { cache: self, slot }
    }

    /// 获取一个内容全为 0 的扇区, 用于新分配的扇区.
    ///
    /// 未缓存时不会从磁盘读入旧内容, 而是直接在设备上清零;
    /// 已缓存时 (可能还是脏的) 清空缓存中的副本.
    pub fn write_zeroed(&self, sector: usize) -> SectorWriteGuard<'_> {
        let slot = self.lookup(sector, Access::Exclusive, Fill::Zero);
        let mut guard = SectorWriteGuard { cache: self, slot };
        guard.data_mut().fill(0);
        guard
    }

    /// 查找或载入 sector 所在的槽位, 返回时已按 access 持有槽位锁
    fn lookup(&self, sector: usize, access: Access, fill: Fill) -> usize {
        match self.try_lookup(sector, access, fill, true) {
            Some(slot) => slot,
            None => unreachable!("fatal lookup returned without a slot"),
        }
    }

    /// fatal 为 false 时, 所有槽位都忙碌则返回 None 而不是 panic
    fn try_lookup(&self, sector: usize, access: Access, fill: Fill, fatal: bool) -> Option<usize> {
        assert!(
            sector < self.sector_count,
            "sector {} out of device range {}",
            sector,
            self.sector_count
        );
        loop {
            let mut table = self.table.lock();
            if let Some(index) = self.find(sector) {
                drop(table);
                let slot = &self.slots[index];
                match access {
                    Access::Shared => slot.lock.acquire_shared(),
                    Access::Exclusive => slot.lock.acquire_exclusive(),
                }
                // 标签只会在独占持有时改变, 等待期间槽位可能已被替换, 需要重新确认
                if slot.holds(sector) {
                    slot.touch();
                    bump(&self.counters.hits);
                    return Some(index);
                }
                slot.release(access);
                continue;
            }

            let index = match self.claim() {
                Some(index) => index,
                None if fatal => panic!("Run out of BlockCache: every slot is busy"),
                None => return None,
            };
            let slot = &self.slots[index];
            if slot.valid.load(Ordering::Acquire) && slot.dirty.load(Ordering::Acquire) {
                // 脏数据必须在换上新标签之前写回, 否则其他线程可能从磁盘读到旧内容.
                // 写回期间牺牲者仍然挂着旧标签并被独占持有: 请求旧扇区的线程在槽位锁上等待,
                // 其他扇区的查找不受影响
                drop(table);
                self.write_back(index);
                table = self.table.lock();
                // 放开表锁期间其他线程可能已经载入了 sector, 此时槽位仍是旧扇区的干净副本
                if self.find(sector).is_some() {
                    slot.lock.release_exclusive();
                    continue;
                }
            }
            if slot.valid.load(Ordering::Acquire) {
                let victim = slot.sector.load(Ordering::Acquire);
                bump(&self.counters.evictions);
                trace!("evict sector {} from slot {}", victim, index);
            }
            slot.valid.store(false, Ordering::Release);
            slot.sector.store(sector, Ordering::Release);
            drop(table);

            // 设备 I/O 在表锁之外完成, 此时独占持有该槽位, 其他请求者会在槽位锁上等待
            let buf = self.bytes_mut(index);
            match fill {
                Fill::Load => self.device.read_sector(sector, buf),
                Fill::Zero => {
                    self.device.zero_sector(sector);
                    buf.fill(0);
                }
            }
            slot.dirty.store(false, Ordering::Release);
            slot.recency.store(0, Ordering::Release);
            slot.valid.store(true, Ordering::Release);
            slot.touch();
            bump(&self.counters.misses);
            trace!("load sector {} into slot {}", sector, index);

            // 载入者最终只持有共享锁, 与命中时一致
            if access == Access::Shared {
                slot.lock.downgrade();
            }
            return Some(index);
        }
    }

    /// 必须持有表锁
    fn find(&self, sector: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.sector.load(Ordering::Acquire) == sector)
    }

    /// 认领一个槽位并独占持有它: 优先使用空槽位, 否则驱逐. 必须持有表锁
    fn claim(&self) -> Option<usize> {
        if let Some(index) = self.slots.iter().position(|slot| {
            slot.sector.load(Ordering::Acquire) == EMPTY && slot.lock.try_acquire_exclusive()
        }) {
            return Some(index);
        }
        self.evict()
    }

    /// 选择一个牺牲者槽位, 返回时独占持有它.
    ///
    /// 依次尝试独占每个槽位, 正在被读写的槽位直接跳过.
    /// 在所有拿到的候选者中保留 recency 最小的那个, 被取代的候选者立即释放;
    /// recency 相同时保留先扫描到的. recency 为 0 的候选者不可能更旧, 直接结束扫描.
    fn evict(&self) -> Option<usize> {
        let mut victim: Option<(usize, u64)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            bump(&self.counters.scanned);
            if !slot.lock.try_acquire_exclusive() {
                continue;
            }
            let recency = slot.recency.load(Ordering::Acquire);
            match victim {
                Some((_, oldest)) if recency >= oldest => slot.lock.release_exclusive(),
                Some((previous, _)) => {
                    self.slots[previous].lock.release_exclusive();
                    victim = Some((index, recency));
                }
                None => victim = Some((index, recency)),
            }
            if matches!(victim, Some((_, 0))) {
                break;
            }
        }
        victim.map(|(index, _)| index)
    }

    fn hint_read_ahead(&self, sector: usize) {
        let next = sector + 1;
        if next < self.sector_count {
            *self.read_ahead.lock() = Some(next);
        }
    }

    /// 处理一次等待中的预读请求, 返回是否有请求被处理.
    ///
    /// 预读只是提示: 请求可能在处理前被覆盖, 所有槽位都忙碌时也会被直接丢弃.
    pub fn prefetch(&self) -> bool {
        let Some(sector) = self.read_ahead.lock().take() else {
            return false;
        };
        if let Some(index) = self.try_lookup(sector, Access::Shared, Fill::Load, false) {
            self.slots[index].lock.release_shared();
            bump(&self.counters.prefetches);
        }
        true
    }

    /// 最近访问时钟的一次扫描.
    ///
    /// 对每个能以共享方式拿到的有效槽位, 将 recency 右移一位, 并把 accessed 放入最高位.
    /// 只有在扫描者是唯一持有者时才清除 accessed, 以免抹掉一次仍在进行中的访问.
    /// 于是最近一个周期访问过的槽位拥有最大的计数, 64 个周期未被访问的槽位计数衰减为 0.
    pub fn age_slots(&self) {
        for slot in self.slots.iter() {
            if !slot.valid.load(Ordering::Acquire) || !slot.lock.try_acquire_shared() {
                continue;
            }
            if slot.valid.load(Ordering::Acquire) {
                // 取出与清除必须是同一个原子操作, 否则两者之间的一次 touch 会被抹掉
                let accessed = if slot.lock.shared_count() == 1 {
                    slot.accessed.swap(false, Ordering::AcqRel)
                } else {
                    slot.accessed.load(Ordering::Acquire)
                };
                let top = if accessed { RECENT_BIT } else { 0 };
                let _ = slot
                    .recency
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |recency| {
                        Some((recency >> 1) | top)
                    });
            }
            slot.lock.release_shared();
        }
    }

    /// 尽力而为地写回脏槽位: 正在被写的槽位留到下一次, 返回写回的数量
    pub fn flush_dirty(&self) -> usize {
        let mut written = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.dirty.load(Ordering::Acquire) || !slot.lock.try_acquire_shared() {
                continue;
            }
            written += self.write_back(index) as usize;
            slot.lock.release_shared();
        }
        written
    }

    /// 同步写回所有脏槽位, 会等待正在进行的写操作结束
    pub fn flush(&self) {
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.dirty.load(Ordering::Acquire) {
                continue;
            }
            slot.lock.acquire_shared();
            self.write_back(index);
            slot.lock.release_shared();
        }
    }

    /// 必须至少以共享方式持有槽位: 写者需要独占锁, 因此写回期间内容不会改变
    fn write_back(&self, index: usize) -> bool {
        let slot = &self.slots[index];
        if !slot.valid.load(Ordering::Acquire) || !slot.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }
        let sector = slot.sector.load(Ordering::Acquire);
        self.device.write_sector(sector, self.bytes(index));
        bump(&self.counters.write_backs);
        trace!("write back sector {} from slot {}", sector, index);
        true
    }

    /// sector 当前是否驻留在缓存中
    pub fn contains(&self, sector: usize) -> bool {
        let _table = self.table.lock();
        self.slots.iter().any(|slot| slot.holds(sector))
    }

    /// sector 所在槽位的 recency 计数
    pub fn recency_of(&self, sector: usize) -> Option<u64> {
        let _table = self.table.lock();
        self.slots
            .iter()
            .find(|slot| slot.holds(sector))
            .map(|slot| slot.recency.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            scanned: c.scanned.load(Ordering::Relaxed),
            write_backs: c.write_backs.load(Ordering::Relaxed),
            prefetches: c.prefetches.load(Ordering::Relaxed),
        }
    }

    fn bytes(&self, index: usize) -> &[u8; SECTOR_SIZE] {
        unsafe { &(*self.slots[index].data.get()).0 }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self, index: usize) -> &mut [u8; SECTOR_SIZE] {
        unsafe { &mut (*self.slots[index].data.get()).0 }
    }

    fn raw(&self, index: usize) -> *mut u8 {
        self.slots[index].data.get().cast()
    }
}

impl Drop for BlockCache {
    /// 与 RAII 思想一致: 缓存被回收时, 脏槽位写回磁盘
    fn drop(&mut self) {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.valid.load(Ordering::Acquire) && slot.dirty.load(Ordering::Acquire) {
                let sector = slot.sector.load(Ordering::Acquire);
                self.device.write_sector(sector, self.bytes(index));
            }
        }
    }
}

/// 获取缓冲区中偏移量 offset 处的一个类型为 T 的磁盘上数据结构的裸指针.
/// T 必须被整个包含在扇区之内, 且 offset 满足 T 的对齐要求.
fn offset_ptr<T>(base: *mut u8, offset: usize) -> *mut T {
    assert!(offset + std::mem::size_of::<T>() <= SECTOR_SIZE);
    let ptr = base.wrapping_add(offset);
    assert_eq!(
        ptr as usize % std::mem::align_of::<T>(),
        0,
        "misaligned on-disk access"
    );
    ptr.cast()
}

/// 共享持有一个扇区, drop 时即 end-read
pub struct SectorReadGuard<'a> {
    cache: &'a BlockCache,
    slot: usize,
}

impl<'a> SectorReadGuard<'a> {
    pub fn sector(&self) -> usize {
        self.cache.slots[self.slot].sector.load(Ordering::Acquire)
    }

    /// 槽位下标
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn data(&self) -> &[u8; SECTOR_SIZE] {
        self.cache.bytes(self.slot)
    }

    pub fn get_ref<T>(&self, offset: usize) -> &T {
        unsafe { &*offset_ptr::<T>(self.cache.raw(self.slot), offset) }
    }

    /// 在偏移量 offset 处将数据解释为 T, 并让闭包 f 在其上执行
    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    /// 升级为独占持有. 若还有其他读者则阻塞等待它们释放
    pub fn upgrade(self) -> SectorWriteGuard<'a> {
        let this = ManuallyDrop::new(self);
        this.cache.slots[this.slot].lock.upgrade();
        SectorWriteGuard {
            cache: this.cache,
            slot: this.slot,
        }
    }
}

impl Drop for SectorReadGuard<'_> {
    fn drop(&mut self) {
        self.cache.slots[self.slot].lock.release_shared();
    }
}

/// 独占持有一个扇区, drop 时即 end-write: 标记为脏并释放
pub struct SectorWriteGuard<'a> {
    cache: &'a BlockCache,
    slot: usize,
}

impl<'a> SectorWriteGuard<'a> {
    pub fn sector(&self) -> usize {
        self.cache.slots[self.slot].sector.load(Ordering::Acquire)
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn data(&self) -> &[u8; SECTOR_SIZE] {
        self.cache.bytes(self.slot)
    }

    pub fn data_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        self.cache.bytes_mut(self.slot)
    }

    pub fn get_ref<T>(&self, offset: usize) -> &T {
        unsafe { &*offset_ptr::<T>(self.cache.raw(self.slot), offset) }
    }

    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T {
        unsafe { &mut *offset_ptr::<T>(self.cache.raw(self.slot), offset) }
    }

    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    /// 结束写入 (标记为脏), 但继续以共享方式持有
    pub fn downgrade(self) -> SectorReadGuard<'a> {
        let this = ManuallyDrop::new(self);
        let slot = &this.cache.slots[this.slot];
        slot.dirty.store(true, Ordering::Release);
        slot.lock.downgrade();
        SectorReadGuard {
            cache: this.cache,
            slot: this.slot,
        }
    }
}

impl Drop for SectorWriteGuard<'_> {
    fn drop(&mut self) {
        let slot = &self.cache.slots[self.slot];
        slot.dirty.store(true, Ordering::Release);
        slot.lock.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache(slots: usize, sectors: usize) -> (Arc<MemDevice>, BlockCache) {
        let device = Arc::new(MemDevice::new(sectors));
        let cache = BlockCache::new(device.clone(), slots);
        (device, cache)
    }

    #[test]
    fn second_read_hits() {
        let (device, cache) = cache(4, 16);
        drop(cache.read(3));
        drop(cache.read(3));
        assert_eq!(device.reads(), 1);
        assert_eq!(device.writes(), 0);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn write_survives_eviction() {
        let (device, cache) = cache(2, 16);
        cache.write(5).data_mut()[..4].copy_from_slice(b"abcd");
        drop(cache.read(6));
        drop(cache.read(7));
        assert!(!cache.contains(5));
        assert_eq!(&device.snapshot(5)[..4], b"abcd");
        assert_eq!(&cache.read(5).data()[..4], b"abcd");
    }

    #[test]
    fn write_zeroed_discards_cached_content() {
        let (device, cache) = cache(4, 16);
        cache.write(2).data_mut().fill(0xaa);
        assert!(cache.write_zeroed(2).data().iter().all(|b| *b == 0));
        cache.flush();
        assert!(device.snapshot(2).iter().all(|b| *b == 0));
    }

    #[test]
    fn write_zeroed_miss_skips_device_read() {
        let (device, cache) = cache(4, 16);
        drop(cache.write_zeroed(9));
        assert_eq!(device.reads(), 0);
        assert_eq!(device.writes(), 1);
        assert!(cache.read(9).data().iter().all(|b| *b == 0));
    }

    #[test]
    fn concurrent_requests_share_one_slot() {
        let (device, cache) = cache(8, 64);
        let slots: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| cache.read(42).slot()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(slots.iter().all(|slot| *slot == slots[0]));
        assert_eq!(device.reads(), 1);
    }

    #[test]
    fn busy_slots_are_never_evicted() {
        let (_, cache) = cache(2, 16);
        let pinned = cache.read(1);
        cache.age_slots();
        cache.age_slots();
        drop(cache.read(2));
        drop(cache.read(3));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        drop(pinned);
    }

    #[test]
    #[should_panic(expected = "Run out of BlockCache")]
    fn total_lockup_is_fatal() {
        let (_, cache) = cache(1, 16);
        let _pinned = cache.read(1);
        let _ = cache.read(2);
    }

    #[test]
    #[should_panic(expected = "out of device range")]
    fn out_of_range_is_fatal() {
        let (_, cache) = cache(1, 16);
        let _ = cache.read(16);
    }

    #[test]
    fn aging_decays_untouched_slots() {
        let (_, cache) = cache(4, 16);
        drop(cache.read(1));
        assert_eq!(cache.recency_of(1), Some(RECENT_BIT));
        cache.age_slots();
        assert_eq!(cache.recency_of(1), Some(RECENT_BIT | RECENT_BIT >> 1));
        for _ in 0..64 {
            cache.age_slots();
        }
        assert_eq!(cache.recency_of(1), Some(0));
    }

    #[test]
    fn aging_keeps_access_of_concurrent_reader() {
        let (_, cache) = cache(4, 16);
        let guard = cache.read(1);
        // 扫描者不是唯一持有者, accessed 保留, 每次扫描都重新置位最高位
        cache.age_slots();
        cache.age_slots();
        assert_eq!(
            cache.recency_of(1),
            Some(RECENT_BIT | RECENT_BIT >> 1 | RECENT_BIT >> 2)
        );
        drop(guard);
        // 唯一持有者: 本次扫描消费 accessed, 下一次扫描不再置位最高位
        cache.age_slots();
        assert!(cache.recency_of(1).unwrap() & RECENT_BIT != 0);
        cache.age_slots();
        assert_eq!(cache.recency_of(1).unwrap() & RECENT_BIT, 0);
    }

    #[test]
    fn zero_recency_stops_the_scan() {
        let (_, cache) = cache(4, 16);
        for sector in 1..=4 {
            drop(cache.read(sector));
        }
        for _ in 0..70 {
            cache.age_slots();
        }
        assert!((1..=4).all(|sector| cache.recency_of(sector) == Some(0)));
        drop(cache.read(5));
        assert_eq!(cache.stats().scanned, 1);
        assert!(!cache.contains(1));
        assert!((2..=5).all(|sector| cache.contains(sector)));
    }

    /// 对某个扇区的写操作会阻塞, 直到 open 被置位
    struct GatedDevice {
        inner: MemDevice,
        gated: usize,
        entered: AtomicBool,
        open: AtomicBool,
    }

    impl BlockDevice for GatedDevice {
        fn read_sector(&self, sector: usize, buf: &mut [u8]) {
            self.inner.read_sector(sector, buf);
        }

        fn write_sector(&self, sector: usize, buf: &[u8]) {
            if sector == self.gated {
                self.entered.store(true, Ordering::Release);
                while !self.open.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
            self.inner.write_sector(sector, buf);
        }

        fn sector_count(&self) -> usize {
            self.inner.sector_count()
        }
    }

    #[test]
    fn victim_write_back_does_not_block_other_lookups() {
        use std::time::{Duration, Instant};

        let device = Arc::new(GatedDevice {
            inner: MemDevice::new(16),
            gated: 1,
            entered: AtomicBool::new(false),
            open: AtomicBool::new(false),
        });
        let cache = BlockCache::new(device.clone(), 2);
        cache.write(1).data_mut()[0] = 0x11;
        drop(cache.read(2));

        std::thread::scope(|s| {
            // 两个槽位 recency 相同, 先扫描到的脏扇区 1 被驱逐, 写回卡在设备上
            s.spawn(|| drop(cache.read(3)));
            while !device.entered.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            let hit = s.spawn(|| drop(cache.read(2)));
            let deadline = Instant::now() + Duration::from_secs(5);
            while !hit.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            let finished = hit.is_finished();
            device.open.store(true, Ordering::Release);
            assert!(finished, "lookup of a resident sector waited for a write-back");
        });

        assert!(cache.contains(3));
        assert!(!cache.contains(1));
        assert_eq!(device.inner.snapshot(1)[0], 0x11);
    }

    #[test]
    fn upgrade_and_downgrade() {
        let (device, cache) = cache(4, 16);
        let mut guard = cache.read(4).upgrade();
        guard.data_mut()[0] = 7;
        let guard = guard.downgrade();
        assert_eq!(guard.data()[0], 7);
        drop(guard);
        assert_eq!(cache.flush_dirty(), 1);
        assert_eq!(device.snapshot(4)[0], 7);
    }

    #[test]
    fn prefetch_loads_next_sector() {
        let (_, cache) = cache(4, 16);
        drop(cache.read(5));
        assert!(!cache.contains(6));
        assert!(cache.prefetch());
        assert!(cache.contains(6));
        assert!(!cache.prefetch());
        assert_eq!(cache.stats().prefetches, 1);
    }

    #[test]
    fn last_sector_records_no_hint() {
        let (_, cache) = cache(4, 16);
        drop(cache.read(15));
        assert!(!cache.prefetch());
    }

    #[test]
    fn readers_never_see_torn_sectors() {
        let (_, cache) = cache(4, 16);
        std::thread::scope(|s| {
            s.spawn(|| {
                for round in 0..500u32 {
                    cache.write(3).data_mut().fill(round as u8);
                }
            });
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let guard = cache.read(3);
                        let first = guard.data()[0];
                        assert!(guard.data().iter().all(|b| *b == first));
                    }
                });
            }
        });
    }

    #[test]
    fn drop_flushes_dirty_slots() {
        let (device, cache) = cache(4, 16);
        cache.write(8).data_mut()[10] = 0x5a;
        drop(cache);
        assert_eq!(device.snapshot(8)[10], 0x5a);
    }
}
