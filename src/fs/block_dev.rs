//! 块设备仅支持以扇区为单位进行随机读写, 需要由具体的块设备驱动来实现这些方法.
//! 块缓存层会调用这些方法, 进行块缓存的管理.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的块设备驱动程序.
//!
//! 块缓存层从不对设备请求进行重排或合并, 每次调用都是同步完成的.
//! 设备读写失败被视为致命错误, 实现者应当直接 panic.

use std::any::Any;

use super::SECTOR_SIZE;

pub trait BlockDevice: Send + Sync + Any {
    /// 将编号为 sector 的扇区从磁盘读入内存中的缓冲区 buf
    fn read_sector(&self, sector: usize, buf: &mut [u8]);

    /// 将内存中的缓冲区 buf 中的数据写入磁盘编号为 sector 的扇区
    fn write_sector(&self, sector: usize, buf: &[u8]);

    /// 设备上的扇区总数
    fn sector_count(&self) -> usize;

    /// 将编号为 sector 的扇区清零
    fn zero_sector(&self, sector: usize) {
        self.write_sector(sector, &[0u8; SECTOR_SIZE]);
    }
}
