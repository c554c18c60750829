//! 块设备的两个实现: 以宿主机上的镜像文件模拟的磁盘 [`BlockFile`], 以及纯内存的 [`MemDevice`].

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use spin::Mutex;

use crate::error::Result;
use crate::fs::{BlockDevice, SECTOR_SIZE};

// std::fs::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 使用 FileExt 的定位读写 (pread/pwrite), 不需要先 seek, 因此也不需要互斥锁。
pub struct BlockFile {
    file: File,
    sectors: usize,
}

impl BlockFile {
    /// 创建 (或截断) 一个容量为 sectors 个扇区的镜像文件
    pub fn create(path: impl AsRef<Path>, sectors: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len((sectors * SECTOR_SIZE) as u64)?;
        Ok(Self { file, sectors })
    }

    /// 打开已有的镜像文件, 扇区数由文件大小决定
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let sectors = file.metadata()?.len() as usize / SECTOR_SIZE;
        Ok(Self { file, sectors })
    }
}

impl BlockDevice for BlockFile {
    /// 从文件读取一个扇区
    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "Not a complete sector");
        self.file
            .read_exact_at(buf, (sector * SECTOR_SIZE) as u64)
            .expect("Error when reading sector!");
    }

    /// 写一个扇区到文件
    fn write_sector(&self, sector: usize, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "Not a complete sector");
        self.file
            .write_all_at(buf, (sector * SECTOR_SIZE) as u64)
            .expect("Error when writing sector!");
    }

    fn sector_count(&self) -> usize {
        self.sectors
    }
}

/// 内存中的块设备, 记录读写次数以便观察缓存行为
pub struct MemDevice {
    bytes: Mutex<Vec<u8>>,
    sectors: usize,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDevice {
    pub fn new(sectors: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; sectors * SECTOR_SIZE]),
            sectors,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接查看设备上的扇区内容
    pub fn snapshot(&self, sector: usize) -> [u8; SECTOR_SIZE] {
        let mut buf = [0; SECTOR_SIZE];
        let start = sector * SECTOR_SIZE;
        buf.copy_from_slice(&self.bytes.lock()[start..start + SECTOR_SIZE]);
        buf
    }
}

impl BlockDevice for MemDevice {
    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        assert!(sector < self.sectors, "sector {} out of range", sector);
        let start = sector * SECTOR_SIZE;
        buf.copy_from_slice(&self.bytes.lock()[start..start + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: usize, buf: &[u8]) {
        assert!(sector < self.sectors, "sector {} out of range", sector);
        let start = sector * SECTOR_SIZE;
        self.bytes.lock()[start..start + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn sector_count(&self) -> usize {
        self.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_file_round_trips() -> Result<()> {
        let path = std::env::temp_dir().join(format!("extent-fs-{}.img", std::process::id()));
        let device = BlockFile::create(&path, 8)?;
        assert_eq!(device.sector_count(), 8);
        let sector = [0x42u8; SECTOR_SIZE];
        device.write_sector(3, &sector);
        device.zero_sector(4);
        drop(device);

        let device = BlockFile::open(&path)?;
        let mut buf = [0u8; SECTOR_SIZE];
        device.read_sector(3, &mut buf);
        assert_eq!(buf, sector);
        device.read_sector(4, &mut buf);
        assert!(buf.iter().all(|b| *b == 0));
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
