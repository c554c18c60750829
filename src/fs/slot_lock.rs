//! 缓存槽位的读写锁, 支持共享 / 独占两种持有方式以及两者之间的升级与降级.
//!
//! 锁本身是一个显式的状态机 `Free | Shared(n) | Exclusive`, 由唯一的一把内部自旋锁保护.
//! 阻塞的获取操作在内部自旋, 超过一定次数后让出 CPU.
//!
//! 注意: [`SlotLock::upgrade`] 只在持有者是唯一的共享持有者 (`Shared(1)`) 时才能完成,
//! 否则会一直等待其他共享持有者释放. 两个共享持有者同时升级会互相等待而死锁,
//! 调用者需要自己避免这种情况.

use spin::Mutex;

/// 阻塞等待时先忙等的次数, 之后改为 yield
const SPIN_LIMIT: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Free,
    Shared(usize),
    Exclusive,
}

pub struct SlotLock {
    state: Mutex<LockState>,
}

impl Default for SlotLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotLock {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(LockState::Free),
        }
    }

    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    /// 当前共享持有者的数量, 独占或空闲时为 0
    pub fn shared_count(&self) -> usize {
        match *self.state.lock() {
            LockState::Shared(n) => n,
            _ => 0,
        }
    }

    pub fn acquire_shared(&self) {
        self.spin_until(share);
    }

    pub fn try_acquire_shared(&self) -> bool {
        share(&mut self.state.lock())
    }

    pub fn release_shared(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            LockState::Shared(1) => LockState::Free,
            LockState::Shared(n) => LockState::Shared(n - 1),
            other => panic!("release_shared on a lock in state {:?}", other),
        };
    }

    pub fn acquire_exclusive(&self) {
        self.spin_until(exclude);
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        exclude(&mut self.state.lock())
    }

    pub fn release_exclusive(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            *state,
            LockState::Exclusive,
            "release_exclusive without exclusive hold"
        );
        *state = LockState::Free;
    }

    /// 共享 -> 独占
    ///
    /// 调用者必须持有一份共享锁. 若还有其他共享持有者, 则阻塞直到它们全部释放.
    pub fn upgrade(&self) {
        self.spin_until(|state| match *state {
            LockState::Shared(1) => {
                *state = LockState::Exclusive;
                true
            }
            LockState::Shared(_) => false,
            other => panic!("upgrade on a lock in state {:?}", other),
        });
    }

    /// 非阻塞的升级, 只有在调用者是唯一的共享持有者时成功
    pub fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            LockState::Shared(1) => {
                *state = LockState::Exclusive;
                true
            }
            LockState::Shared(_) => false,
            other => panic!("try_upgrade on a lock in state {:?}", other),
        }
    }

    /// 独占 -> 共享, 不会阻塞
    pub fn downgrade(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            *state,
            LockState::Exclusive,
            "downgrade without exclusive hold"
        );
        *state = LockState::Shared(1);
    }

    fn spin_until(&self, mut transition: impl FnMut(&mut LockState) -> bool) {
        let mut spins = 0;
        loop {
            if transition(&mut self.state.lock()) {
                return;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

fn share(state: &mut LockState) -> bool {
    match *state {
        LockState::Free => {
            *state = LockState::Shared(1);
            true
        }
        LockState::Shared(n) => {
            *state = LockState::Shared(n + 1);
            true
        }
        LockState::Exclusive => false,
    }
}

fn exclude(state: &mut LockState) -> bool {
    if *state == LockState::Free {
        *state = LockState::Exclusive;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn shared_holders_coexist() {
        let lock = SlotLock::new();
        lock.acquire_shared();
        assert!(lock.try_acquire_shared());
        assert_eq!(lock.shared_count(), 2);
        assert!(!lock.try_acquire_exclusive());
        lock.release_shared();
        lock.release_shared();
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    fn exclusive_blocks_everyone() {
        let lock = SlotLock::new();
        lock.acquire_exclusive();
        assert!(!lock.try_acquire_shared());
        assert!(!lock.try_acquire_exclusive());
        lock.release_exclusive();
        assert!(lock.try_acquire_exclusive());
        lock.release_exclusive();
    }

    #[test]
    fn downgrade_then_share() {
        let lock = SlotLock::new();
        lock.acquire_exclusive();
        lock.downgrade();
        assert_eq!(lock.state(), LockState::Shared(1));
        assert!(lock.try_acquire_shared());
        lock.release_shared();
        lock.release_shared();
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    fn sole_reader_upgrades() {
        let lock = SlotLock::new();
        lock.acquire_shared();
        assert!(lock.try_upgrade());
        assert_eq!(lock.state(), LockState::Exclusive);
        lock.release_exclusive();
    }

    #[test]
    fn upgrade_waits_for_other_readers() {
        let lock = SlotLock::new();
        let upgraded = AtomicBool::new(false);
        lock.acquire_shared();
        lock.acquire_shared();
        assert!(!lock.try_upgrade());
        std::thread::scope(|s| {
            s.spawn(|| {
                lock.upgrade();
                upgraded.store(true, Ordering::SeqCst);
                lock.release_exclusive();
            });
            std::thread::sleep(Duration::from_millis(20));
            assert!(!upgraded.load(Ordering::SeqCst));
            lock.release_shared();
        });
        assert!(upgraded.load(Ordering::SeqCst));
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    fn writers_exclude_each_other() {
        let lock = SlotLock::new();
        let inside = AtomicBool::new(false);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        lock.acquire_exclusive();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        inside.store(false, Ordering::SeqCst);
                        lock.release_exclusive();
                    }
                });
            }
        });
        assert_eq!(lock.state(), LockState::Free);
    }

    #[test]
    #[should_panic]
    fn release_unheld_shared_panics() {
        SlotLock::new().release_shared();
    }
}
