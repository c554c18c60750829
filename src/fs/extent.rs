//! 索引树: 由 [`DiskInode`] 记录中的直接索引, 一级间接索引和二级间接索引组成,
//! 负责把文件内的字节偏移映射到设备扇区, 并支持创建, 增长和回收.
//!
//! 所有对索引块的访问都经过块缓存, 每一层读到需要的指针后立即释放.
//! 本模块不会修改记录中的 length, 那是索引节点层的职责.

use log::{debug, warn};

use super::{
    BlockCache, DiskInode, IndirectBlock, SectorAllocator, DIRECT_BOUND, DIRECT_COUNT,
    DOUBLE_INDIRECT_BOUND, ENTRIES_PER_SECTOR, SECTOR_SIZE, SINGLE_INDIRECT_BOUND,
    SINGLE_INDIRECT_COUNT,
};

/// 文件内第 index 个扇区在索引树中的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Direct(usize),
    /// single_indirect[slot] 所指索引块中的第 entry 项
    Single { slot: usize, entry: usize },
    /// 二级索引块第 outer 项所指一级索引块中的第 entry 项
    Double { outer: usize, entry: usize },
}

fn route(index: usize) -> Route {
    if index < DIRECT_COUNT {
        return Route::Direct(index);
    }
    let rest = index - DIRECT_COUNT;
    let single = rest / ENTRIES_PER_SECTOR;
    let entry = rest % ENTRIES_PER_SECTOR;
    if single < SINGLE_INDIRECT_COUNT {
        return Route::Single {
            slot: single,
            entry,
        };
    }
    // 只有一个二级索引, 剩下的一定在它的范围之内
    let outer = single - SINGLE_INDIRECT_COUNT;
    assert!(
        outer < ENTRIES_PER_SECTOR,
        "sector index {} beyond the double-indirect range",
        index
    );
    Route::Double { outer, entry }
}

/// 容纳 length 字节需要多少个数据扇区 (向上取整)
pub fn sectors_for(length: usize) -> usize {
    (length + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// 容纳 length 字节总共占用的扇区数: 不仅包含数据扇区, 还包括各级索引块
pub fn footprint(length: usize) -> usize {
    let data = sectors_for(length);
    let mut total = data;
    if data > DIRECT_BOUND {
        // 一级索引块
        total += ((data.min(SINGLE_INDIRECT_BOUND) - DIRECT_BOUND) + ENTRIES_PER_SECTOR - 1)
            / ENTRIES_PER_SECTOR;
    }
    if data > SINGLE_INDIRECT_BOUND {
        // 二级索引块及其下的一级子索引块
        total += 1 + (data - SINGLE_INDIRECT_BOUND + ENTRIES_PER_SECTOR - 1) / ENTRIES_PER_SECTOR;
    }
    total
}

fn entry_of(cache: &BlockCache, container: u32, entry: usize) -> u32 {
    assert_ne!(container, 0, "walked into an unallocated index sector");
    cache
        .read(container as usize)
        .read(0, |indirect: &IndirectBlock| indirect[entry])
}

fn set_entry(cache: &BlockCache, container: u32, entry: usize, value: u32) {
    assert_ne!(container, 0, "walked into an unallocated index sector");
    cache
        .write(container as usize)
        .modify(0, |indirect: &mut IndirectBlock| indirect[entry] = value);
}

/// 读出记录的副本, 并检查魔数
fn load_record(cache: &BlockCache, record: usize) -> DiskInode {
    let disk_inode = *cache.read(record).get_ref::<DiskInode>(0);
    assert!(
        disk_inode.is_valid(),
        "corrupt inode record at sector {}",
        record
    );
    disk_inode
}

/// 分配一个扇区并清零, 空间耗尽时返回 None
fn allocate_zeroed(cache: &BlockCache, allocator: &dyn SectorAllocator) -> Option<u32> {
    let sector = allocator.allocate_sector()?;
    drop(cache.write_zeroed(sector));
    Some(sector as u32)
}

/// 找到文件内字节偏移 offset 所在的设备扇区. offset 必须小于文件长度
pub fn byte_to_sector(cache: &BlockCache, record: usize, offset: usize) -> usize {
    let route = route(offset / SECTOR_SIZE);
    let top = cache.read(record).read(0, |disk_inode: &DiskInode| {
        assert!(
            disk_inode.is_valid(),
            "corrupt inode record at sector {}",
            record
        );
        assert!(
            offset < disk_inode.length as usize,
            "offset {} past the end of inode {} (length {})",
            offset,
            record,
            disk_inode.length
        );
        match route {
            Route::Direct(index) => disk_inode.direct[index],
            Route::Single { slot, .. } => disk_inode.single_indirect[slot],
            Route::Double { .. } => disk_inode.double_indirect,
        }
    });
    let sector = match route {
        Route::Direct(_) => top,
        Route::Single { entry, .. } => entry_of(cache, top, entry),
        Route::Double { outer, entry } => entry_of(cache, entry_of(cache, top, outer), entry),
    };
    sector as usize
}

fn allocate_direct(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    slot: &mut u32,
    remaining: &mut usize,
) -> bool {
    match allocate_zeroed(cache, allocator) {
        Some(sector) => {
            *slot = sector;
            *remaining -= 1;
            true
        }
        None => false,
    }
}

/// 分配一个一级索引块以及其下至多 128 个数据扇区.
/// 失败时若索引块下已经挂了数据扇区, 则保留它们 (由调用者回收), 否则连索引块一起归还
fn allocate_indirect(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    slot: &mut u32,
    remaining: &mut usize,
) -> bool {
    let Some(container) = allocator.allocate_sector() else {
        return false;
    };
    let mut entries: IndirectBlock = [0; ENTRIES_PER_SECTOR];
    let mut ok = true;
    for entry in entries.iter_mut() {
        if *remaining == 0 {
            break;
        }
        if !allocate_direct(cache, allocator, entry, remaining) {
            ok = false;
            break;
        }
    }
    if entries[0] == 0 {
        allocator.release_sector(container);
        return false;
    }
    *cache.write_zeroed(container).get_mut::<IndirectBlock>(0) = entries;
    *slot = container as u32;
    ok
}

fn allocate_double_indirect(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    slot: &mut u32,
    remaining: &mut usize,
) -> bool {
    let Some(container) = allocator.allocate_sector() else {
        return false;
    };
    let mut entries: IndirectBlock = [0; ENTRIES_PER_SECTOR];
    let mut ok = true;
    for entry in entries.iter_mut() {
        if *remaining == 0 {
            break;
        }
        if !allocate_indirect(cache, allocator, entry, remaining) {
            ok = false;
            break;
        }
    }
    if entries[0] == 0 {
        allocator.release_sector(container);
        return false;
    }
    *cache.write_zeroed(container).get_mut::<IndirectBlock>(0) = entries;
    *slot = container as u32;
    ok
}

/// 在扇区 record 上创建一个长度为 length 的文件记录.
///
/// 依次分配直接索引, 一级间接索引 (及其数据扇区), 最后是二级间接索引. 新分配的扇区都会被清零.
/// 空间不足时归还本次分配的所有扇区并返回 false, record 扇区不会被写入.
pub fn create(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    record: usize,
    length: usize,
) -> bool {
    let sectors = sectors_for(length);
    if sectors > DOUBLE_INDIRECT_BOUND || length > u32::MAX as usize {
        warn!("inode {}: length {} exceeds the index capacity", record, length);
        return false;
    }
    let mut disk_inode = DiskInode::empty();
    disk_inode.initialize(length as u32);

    let mut remaining = sectors;
    let mut ok = true;
    for slot in disk_inode.direct.iter_mut() {
        if remaining == 0 || !ok {
            break;
        }
        ok = allocate_direct(cache, allocator, slot, &mut remaining);
    }
    for slot in disk_inode.single_indirect.iter_mut() {
        if remaining == 0 || !ok {
            break;
        }
        ok = allocate_indirect(cache, allocator, slot, &mut remaining);
    }
    if remaining > 0 && ok {
        ok = allocate_double_indirect(
            cache,
            allocator,
            &mut disk_inode.double_indirect,
            &mut remaining,
        );
    }

    if !ok {
        warn!(
            "inode {}: out of space after {} of {} sectors, rolling back",
            record,
            sectors - remaining,
            sectors
        );
        free_tree(cache, allocator, &disk_inode, sectors - remaining);
        return false;
    }
    *cache.write_zeroed(record).get_mut::<DiskInode>(0) = disk_inode;
    debug!("inode {}: created with {} bytes", record, length);
    true
}

/// 在文件末尾追加 count 个扇区, 返回实际追加的扇区数.
///
/// 每个新扇区按其逻辑下标找到在索引树中的位置, 所在的索引块只有在写入它的第一个子项时才分配.
/// 分配失败时立即停止: 已追加的扇区保留, 本次为失败的扇区分配的索引块会被归还.
/// 返回值小于 count 即表示只完成了部分增长, 调用者必须据此更新长度.
pub fn extend(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    record: usize,
    count: usize,
) -> usize {
    let mut disk_inode = load_record(cache, record);
    let start = sectors_for(disk_inode.length as usize);
    let end = (start + count).min(DOUBLE_INDIRECT_BOUND);

    let mut added = 0;
    for index in start..end {
        if !extend_one(cache, allocator, &mut disk_inode, index) {
            break;
        }
        added += 1;
    }
    if added > 0 {
        cache
            .write(record)
            .modify(0, |on_disk: &mut DiskInode| {
                on_disk.direct = disk_inode.direct;
                on_disk.single_indirect = disk_inode.single_indirect;
                on_disk.double_indirect = disk_inode.double_indirect;
            });
    }
    if added < count {
        warn!("inode {}: grew by {} of {} sectors", record, added, count);
    }
    added
}

/// 为逻辑下标 index 分配数据扇区并挂到索引树上
fn extend_one(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    disk_inode: &mut DiskInode,
    index: usize,
) -> bool {
    let Some(data) = allocate_zeroed(cache, allocator) else {
        return false;
    };
    match route(index) {
        Route::Direct(slot) => disk_inode.direct[slot] = data,
        Route::Single { slot, entry } => {
            if entry == 0 {
                let Some(container) = allocate_zeroed(cache, allocator) else {
                    allocator.release_sector(data as usize);
                    return false;
                };
                disk_inode.single_indirect[slot] = container;
            }
            set_entry(cache, disk_inode.single_indirect[slot], entry, data);
        }
        Route::Double { outer, entry } => {
            let fresh_double = outer == 0 && entry == 0;
            if fresh_double {
                let Some(container) = allocate_zeroed(cache, allocator) else {
                    allocator.release_sector(data as usize);
                    return false;
                };
                disk_inode.double_indirect = container;
            }
            if entry == 0 {
                let Some(container) = allocate_zeroed(cache, allocator) else {
                    allocator.release_sector(data as usize);
                    if fresh_double {
                        allocator.release_sector(disk_inode.double_indirect as usize);
                        disk_inode.double_indirect = 0;
                    }
                    return false;
                };
                set_entry(cache, disk_inode.double_indirect, outer, container);
            }
            let indirect = entry_of(cache, disk_inode.double_indirect, outer);
            set_entry(cache, indirect, entry, data);
        }
    }
    true
}

/// 回收文件占用的全部数据扇区和索引块 (不包括 record 扇区本身), 数量由记录中的 length 决定
pub fn free(cache: &BlockCache, allocator: &dyn SectorAllocator, record: usize) {
    let disk_inode = load_record(cache, record);
    let sectors = sectors_for(disk_inode.length as usize);
    free_tree(cache, allocator, &disk_inode, sectors);
    debug!("inode {}: released {} data sectors", record, sectors);
}

/// 按照分配的顺序回收前 live 个数据扇区, 索引块在其下所有存活的子项回收之后再回收
fn free_tree(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    disk_inode: &DiskInode,
    mut live: usize,
) {
    for &sector in disk_inode.direct.iter() {
        if live == 0 {
            return;
        }
        allocator.release_sector(sector as usize);
        live -= 1;
    }
    for &container in disk_inode.single_indirect.iter() {
        if live == 0 {
            return;
        }
        free_indirect(cache, allocator, container, &mut live);
    }
    if live > 0 {
        let entries = *cache
            .read(disk_inode.double_indirect as usize)
            .get_ref::<IndirectBlock>(0);
        for &container in entries.iter() {
            if live == 0 {
                break;
            }
            free_indirect(cache, allocator, container, &mut live);
        }
        allocator.release_sector(disk_inode.double_indirect as usize);
    }
}

fn free_indirect(
    cache: &BlockCache,
    allocator: &dyn SectorAllocator,
    container: u32,
    live: &mut usize,
) {
    let entries = *cache.read(container as usize).get_ref::<IndirectBlock>(0);
    for &sector in entries.iter() {
        if *live == 0 {
            break;
        }
        allocator.release_sector(sector as usize);
        *live -= 1;
    }
    allocator.release_sector(container as usize);
}
