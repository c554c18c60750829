//! 可恢复的错误只出现在卷 (格式化 / 挂载) 与命令行这一层.
//!
//! 缓存与索引层内部的不变量被破坏 (越界扇区, 重复释放, 魔数错误) 属于程序错误, 直接 panic;
//! 空间耗尽则以 `Option` / `bool` / 字节数的形式返回给调用者.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 超级块中的魔数不匹配, 设备上不是本文件系统
    #[error("bad super block magic {0:#x}")]
    BadMagic(u32),

    /// 设备容量与超级块记录的几何信息不一致, 或设备太小
    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("no space left on device")]
    NoSpace,
}

pub type Result<T> = core::result::Result<T, VolumeError>;
