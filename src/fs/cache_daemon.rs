//! 块缓存的后台线程:
//!
//! - `cache_accesses`: 最近访问时钟, 周期性地调用 [`BlockCache::age_slots`]
//! - `cache_refresh`: 周期性地写回脏槽位
//! - `read_ahead`: 不断检查是否有等待中的预读请求
//!
//! 它们与前台请求走同一套槽位锁协议, 没有任何特殊处理.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::info;

use super::BlockCache;
use crate::config::CacheConfig;

pub struct CacheDaemon {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl CacheDaemon {
    /// 按照 config 启动后台线程, config 中未启用的线程不会被创建
    pub fn spawn(cache: &Arc<BlockCache>, config: &CacheConfig) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        if let Some(interval) = config.recency_interval {
            handles.push(periodic("cache_accesses", cache, &stop, interval, |cache| {
                cache.age_slots()
            }));
        }
        if let Some(interval) = config.flush_interval {
            handles.push(periodic("cache_refresh", cache, &stop, interval, |cache| {
                cache.flush_dirty();
            }));
        }
        if config.read_ahead {
            let idle = config.read_ahead_idle;
            handles.push(spawn_named("read_ahead", cache, &stop, move |cache, stop| {
                while !stop.load(Ordering::Acquire) {
                    if !cache.prefetch() {
                        thread::park_timeout(idle);
                    }
                }
            }));
        }

        info!("cache daemon started with {} thread(s)", handles.len());
        Self { stop, handles }
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// 通知所有后台线程退出并等待它们结束
    pub fn shutdown(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("cache daemon thread panicked");
            }
        }
        info!("cache daemon stopped");
    }
}

impl Drop for CacheDaemon {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn periodic(
    name: &str,
    cache: &Arc<BlockCache>,
    stop: &Arc<AtomicBool>,
    interval: Duration,
    tick: impl Fn(&BlockCache) + Send + 'static,
) -> JoinHandle<()> {
    spawn_named(name, cache, stop, move |cache, stop| {
        while !stop.load(Ordering::Acquire) {
            tick(cache);
            thread::park_timeout(interval);
        }
    })
}

fn spawn_named(
    name: &str,
    cache: &Arc<BlockCache>,
    stop: &Arc<AtomicBool>,
    body: impl FnOnce(&BlockCache, &AtomicBool) + Send + 'static,
) -> JoinHandle<()> {
    let cache = Arc::clone(cache);
    let stop = Arc::clone(stop);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&cache, &stop))
        .expect("failed to spawn cache daemon thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use std::time::Instant;

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn read_ahead_thread_prefetches() {
        let cache = Arc::new(BlockCache::new(Arc::new(MemDevice::new(32)), 8));
        let daemon = CacheDaemon::spawn(&cache, &CacheConfig::manual(8).with_read_ahead(true));
        assert_eq!(daemon.threads(), 1);
        drop(cache.read(10));
        assert!(wait_for(|| cache.contains(11)));
        daemon.shutdown();
    }

    #[test]
    fn refresh_thread_writes_back() {
        let device = Arc::new(MemDevice::new(32));
        let cache = Arc::new(BlockCache::new(device.clone(), 8));
        let config = CacheConfig {
            flush_interval: Some(Duration::from_millis(1)),
            ..CacheConfig::manual(8)
        };
        let daemon = CacheDaemon::spawn(&cache, &config);
        cache.write(3).data_mut()[0] = 9;
        assert!(wait_for(|| device.snapshot(3)[0] == 9));
        daemon.shutdown();
    }

    #[test]
    fn clock_thread_ages_slots() {
        let cache = Arc::new(BlockCache::new(Arc::new(MemDevice::new(32)), 8));
        drop(cache.read(1));
        let config = CacheConfig {
            recency_interval: Some(Duration::from_millis(1)),
            ..CacheConfig::manual(8)
        };
        let daemon = CacheDaemon::spawn(&cache, &config);
        assert!(wait_for(|| cache.recency_of(1) == Some(0)));
        daemon.shutdown();
    }
}
