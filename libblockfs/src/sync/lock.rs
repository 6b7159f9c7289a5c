//! Leveled locks. Every folder lock has a fixed level and an operation
//! may only take locks in strictly increasing level order. The held
//! levels of one operation live in its `LockState`; taking a lock at or
//! below the highest held level panics.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    MdWriter = 1,
    Head = 2,
    Block = 3,
}

/// Lock levels held by one logical operation.
#[derive(Clone, Debug, Default)]
pub struct LockState {
    held: Arc<StdMutex<Vec<LockLevel>>>,
}

impl LockState {
    pub fn new() -> Self {
        Self::default()
    }

    fn levels(&self) -> std::sync::MutexGuard<'_, Vec<LockLevel>> {
        // A panic while holding this means a lock-order panic already
        // happened; keep the stack usable for the unwinding guards.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, level: LockLevel) {
        if let Some(top) = self.levels().last() {
            assert!(
                level > *top,
                "lock order violation: taking {level:?} while holding {top:?}"
            );
        }
    }

    fn push(&self, level: LockLevel) {
        self.levels().push(level);
    }

    fn pop(&self, level: LockLevel) {
        let mut levels = self.levels();
        if let Some(pos) = levels.iter().rposition(|l| *l == level) {
            levels.remove(pos);
        }
    }

    pub fn held(&self) -> Vec<LockLevel> {
        self.levels().clone()
    }
}

/// A guard that releases its level on drop.
pub struct LeveledGuard<G> {
    guard: G,
    level: LockLevel,
    state: LockState,
}

impl<G> Drop for LeveledGuard<G> {
    fn drop(&mut self) {
        self.state.pop(self.level);
    }
}

impl<G: Deref> Deref for LeveledGuard<G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for LeveledGuard<G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

pub struct LeveledMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> LeveledMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub async fn lock(&self, ls: &LockState) -> LeveledGuard<MutexGuard<'_, T>> {
        ls.check(self.level);
        let guard = self.inner.lock().await;
        ls.push(self.level);
        LeveledGuard {
            guard,
            level: self.level,
            state: ls.clone(),
        }
    }
}

pub struct LeveledRwLock<T> {
    level: LockLevel,
    inner: RwLock<T>,
}

impl<T> LeveledRwLock<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: RwLock::new(value),
        }
    }

    pub async fn read(&self, ls: &LockState) -> LeveledGuard<RwLockReadGuard<'_, T>> {
        ls.check(self.level);
        let guard = self.inner.read().await;
        ls.push(self.level);
        LeveledGuard {
            guard,
            level: self.level,
            state: ls.clone(),
        }
    }

    pub async fn write(&self, ls: &LockState) -> LeveledGuard<RwLockWriteGuard<'_, T>> {
        ls.check(self.level);
        let guard = self.inner.write().await;
        ls.push(self.level);
        LeveledGuard {
            guard,
            level: self.level,
            state: ls.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increasing_levels_ok() {
        let writer = LeveledMutex::new(LockLevel::MdWriter, ());
        let head = LeveledRwLock::new(LockLevel::Head, 1u64);
        let blocks = LeveledRwLock::new(LockLevel::Block, vec![0u8]);

        let ls = LockState::new();
        let _w = writer.lock(&ls).await;
        let h = head.read(&ls).await;
        assert_eq!(*h, 1);
        {
            let mut b = blocks.write(&ls).await;
            b.push(1);
            assert_eq!(ls.held(), vec![LockLevel::MdWriter, LockLevel::Head, LockLevel::Block]);
        }
        drop(h);
        assert_eq!(ls.held(), vec![LockLevel::MdWriter]);

        // Released levels may be taken again.
        let b = blocks.read(&ls).await;
        assert_eq!(b.len(), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "lock order violation")]
    async fn test_out_of_order_panics() {
        let head = LeveledRwLock::new(LockLevel::Head, ());
        let blocks = LeveledRwLock::new(LockLevel::Block, ());
        let ls = LockState::new();
        let _b = blocks.read(&ls).await;
        let _h = head.write(&ls).await;
    }

    #[tokio::test]
    #[should_panic(expected = "lock order violation")]
    async fn test_same_level_twice_panics() {
        let a = LeveledMutex::new(LockLevel::Block, ());
        let b = LeveledMutex::new(LockLevel::Block, ());
        let ls = LockState::new();
        let _a = a.lock(&ls).await;
        let _b = b.lock(&ls).await;
    }
}
