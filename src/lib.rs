//! 带并发块缓存的扇区文件系统内核: 块缓存 (含后台老化, 写回和预读线程) + 基于直接/间接索引的 inode 层

pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod logging;
