use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::wait::{futex_wait, futex_wake_n};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Futex mutex over a word in shared memory.
///
/// Critical sections guarded by a shard lock must not sleep or wait on other
/// agents; a process that dies inside one would otherwise wedge the shard.
#[derive(Clone, Copy)]
pub struct ShardLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> ShardLock<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    pub fn lock(&self) -> ShardGuard<'a> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
                let _ = futex_wait(self.word, CONTENDED, None);
            }
        }
        ShardGuard { word: self.word }
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }
}

pub struct ShardGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for ShardGuard<'_> {
    fn drop(&mut self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let _ = futex_wake_n(self.word, 1);
        }
    }
}
