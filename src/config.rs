//! 块缓存运行时参数
//!
//! 扇区大小, 索引数量等磁盘布局相关的常量位于 [`crate::fs`], 因为它们决定了磁盘格式, 不能在运行时修改.

use std::time::Duration;

use crate::fs::CACHE_SLOTS;

/// Every 1 ms the recency clock ages all slots
const RECENCY_INTERVAL_MS: u64 = 1;
/// Every 100 ms dirty slots are written back
const FLUSH_INTERVAL_MS: u64 = 100;
/// 预读线程没有任务时的休眠时间
const READ_AHEAD_IDLE_US: u64 = 200;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// 缓存槽位数量, 至少为 1
    pub slots: usize,
    /// 最近访问时钟的周期, `None` 表示不启动该后台线程
    pub recency_interval: Option<Duration>,
    /// 脏块写回的周期, `None` 表示只在驱逐和关闭时写回
    pub flush_interval: Option<Duration>,
    /// 是否启动预读线程
    pub read_ahead: bool,
    pub read_ahead_idle: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slots: CACHE_SLOTS,
            recency_interval: Some(Duration::from_millis(RECENCY_INTERVAL_MS)),
            flush_interval: Some(Duration::from_millis(FLUSH_INTERVAL_MS)),
            read_ahead: true,
            read_ahead_idle: Duration::from_micros(READ_AHEAD_IDLE_US),
        }
    }
}

impl CacheConfig {
    /// 不启动任何后台线程, 老化和写回都需要手动触发 (测试用)
    pub fn manual(slots: usize) -> Self {
        Self {
            slots,
            recency_interval: None,
            flush_interval: None,
            read_ahead: false,
            ..Self::default()
        }
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_read_ahead(mut self, read_ahead: bool) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    /// 是否需要启动任何后台线程
    pub fn has_daemons(&self) -> bool {
        self.recency_interval.is_some() || self.flush_interval.is_some() || self.read_ahead
    }
}
