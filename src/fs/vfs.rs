//! 索引节点层.
//!
//! [`DiskInode`] 放在磁盘上各自独占的扇区中, 而 [`Inode`] 是内存中代表一个打开的文件的数据结构.
//! 同一个扇区无论被打开多少次, 都只对应一个 `Arc<Inode>`, 由 [`InodeTable`] 维护打开计数.
//! 对使用者而言, 只需要关心按字节偏移读写, 而不必关心扇区是如何组织成索引树的.

use std::sync::Arc;

use log::{debug, warn};
use spin::Mutex;

use super::{
    extent, sectors_for, BlockCache, DiskInode, SectorAllocator, SECTOR_SIZE,
};

/// 打开计数, 删除标记和禁止写计数, 三者总是一起修改
#[derive(Debug, Default)]
struct OpenState {
    open_count: usize,
    removed: bool,
    deny_write_count: usize,
}

pub struct Inode {
    /// 记录所在的扇区, 同时也是 inode 编号
    sector: usize,
    cache: Arc<BlockCache>,
    allocator: Arc<dyn SectorAllocator>,
    state: Mutex<OpenState>,
    /// 文件增长时持有: 保证同一时刻只有一个写者在扩展索引树
    grow_lock: Mutex<()>,
}

impl Inode {
    fn new(sector: usize, cache: Arc<BlockCache>, allocator: Arc<dyn SectorAllocator>) -> Self {
        Self {
            sector,
            cache,
            allocator,
            state: Mutex::new(OpenState {
                open_count: 1,
                ..OpenState::default()
            }),
            grow_lock: Mutex::new(()),
        }
    }

    // 仿照 SectorReadGuard::read / SectorWriteGuard::modify,
    // 对 DiskInode 的访问都经过下面两个方法

    fn read_disk_inode<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        self.cache.read(self.sector).read(0, f)
    }

    fn modify_disk_inode<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        self.cache.write(self.sector).modify(0, f)
    }

    pub fn inumber(&self) -> usize {
        self.sector
    }

    /// 文件内容的字节数
    pub fn length(&self) -> usize {
        self.read_disk_inode(|disk_inode| disk_inode.length as usize)
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// 从 offset 开始读出至多 buf.len() 个字节, 返回实际读出的字节数.
    /// 到达文件末尾时返回的字节数会小于 buf.len()
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let length = self.length();
        let mut done = 0;
        while done < buf.len() && offset + done < length {
            let pos = offset + done;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(length - pos)
                .min(SECTOR_SIZE - sector_ofs);
            let sector = extent::byte_to_sector(&self.cache, self.sector, pos);
            let guard = self.cache.read(sector);
            buf[done..done + chunk].copy_from_slice(&guard.data()[sector_ofs..sector_ofs + chunk]);
            done += chunk;
        }
        done
    }

    /// 把 buf 写到 offset 处, 返回实际写入的字节数.
    ///
    /// 写到文件末尾之后时先扩展文件: 新扇区都是零, 所以 offset 之前的空洞读出来是零.
    /// 空间不足时只写入能够容纳的部分. 文件处于禁止写状态时什么都不做, 返回 0
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        if self.state.lock().deny_write_count > 0 {
            warn!("inode {}: write refused, writes are denied", self.sector);
            return 0;
        }
        if buf.is_empty() {
            return 0;
        }
        let end = offset + buf.len();
        let mut length = self.length();
        if end > length {
            length = self.grow(end);
        }

        let mut done = 0;
        while done < buf.len() && offset + done < length {
            let pos = offset + done;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(length - pos)
                .min(SECTOR_SIZE - sector_ofs);
            let sector = extent::byte_to_sector(&self.cache, self.sector, pos);
            self.cache.write(sector).data_mut()[sector_ofs..sector_ofs + chunk]
                .copy_from_slice(&buf[done..done + chunk]);
            done += chunk;
        }
        done
    }

    /// 把文件扩展到至少 end 字节, 返回扩展后的长度 (空间不足时可能小于 end)
    fn grow(&self, end: usize) -> usize {
        let _grow = self.grow_lock.lock();
        // 在等锁期间其他写者可能已经扩展过了
        let length = self.length();
        if end <= length {
            return length;
        }
        let have = sectors_for(length);
        let want = sectors_for(end);
        let added = if want > have {
            extent::extend(&self.cache, self.allocator.as_ref(), self.sector, want - have)
        } else {
            0
        };
        let new_length = end.min((have + added) * SECTOR_SIZE).max(length);
        self.modify_disk_inode(|disk_inode| disk_inode.length = new_length as u32);
        debug!("inode {}: length {} -> {}", self.sector, length, new_length);
        new_length
    }

    /// 标记为已删除: 最后一个打开者关闭时回收其占用的所有扇区
    pub fn remove(&self) {
        self.state.lock().removed = true;
    }

    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_count += 1;
        assert!(state.deny_write_count <= state.open_count);
    }

    /// 每个调用过 deny_write 的打开者在关闭前都要调用一次
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_count > 0, "allow_write without deny_write");
        assert!(state.deny_write_count <= state.open_count);
        state.deny_write_count -= 1;
    }
}

/// 打开的 inode 列表
pub struct InodeTable {
    cache: Arc<BlockCache>,
    allocator: Arc<dyn SectorAllocator>,
    open_inodes: Mutex<Vec<Arc<Inode>>>,
}

impl InodeTable {
    pub fn new(cache: Arc<BlockCache>, allocator: Arc<dyn SectorAllocator>) -> Self {
        Self {
            cache,
            allocator,
            open_inodes: Mutex::new(Vec::new()),
        }
    }

    /// 在扇区 sector 上创建一个长度为 length 的文件. 空间不足时返回 false
    pub fn create(&self, sector: usize, length: usize) -> bool {
        extent::create(&self.cache, self.allocator.as_ref(), sector, length)
    }

    /// 打开扇区 sector 上的文件. 已经打开过的话返回同一个 inode 并增加打开计数
    pub fn open(&self, sector: usize) -> Arc<Inode> {
        let mut open_inodes = self.open_inodes.lock();
        if let Some(inode) = open_inodes.iter().find(|inode| inode.sector == sector) {
            inode.state.lock().open_count += 1;
            return inode.clone();
        }
        let inode = Arc::new(Inode::new(
            sector,
            self.cache.clone(),
            self.allocator.clone(),
        ));
        open_inodes.push(inode.clone());
        inode
    }

    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.state.lock().open_count += 1;
        inode.clone()
    }

    /// 关闭一次. 最后一个打开者关闭时, 若文件已被删除, 回收它的所有扇区 (包括记录扇区)
    pub fn close(&self, inode: Arc<Inode>) {
        let removed = {
            let mut open_inodes = self.open_inodes.lock();
            let mut state = inode.state.lock();
            assert!(state.open_count > 0, "close of inode {} that is not open", inode.sector);
            state.open_count -= 1;
            if state.open_count > 0 {
                return;
            }
            open_inodes.retain(|other| !Arc::ptr_eq(other, &inode));
            state.removed
        };
        if removed {
            extent::free(&self.cache, self.allocator.as_ref(), inode.sector);
            self.allocator.release_sector(inode.sector);
            debug!("inode {}: removed", inode.sector);
        }
    }

    /// 当前打开的不同 inode 的数量
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }
}
