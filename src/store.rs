//! Credential store backend and its bounded handle pool.
//!
//! The server consults the store for exactly two POST routes (login check and
//! registration check). Workers acquire a pooled handle for the scope of one
//! request and release it unconditionally when processing returns.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Name -> password map with insert-if-absent semantics.
pub struct UserDb {
    users: Mutex<HashMap<String, String>>,
}

impl UserDb {
    pub fn new() -> UserDb {
        UserDb { users: Mutex::new(HashMap::new()) }
    }

    /// Preload credentials, the way the original loads the user table at
    /// startup.
    pub fn seed<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut users = self.users.lock();
        for (name, pass) in entries {
            users.insert(name.into(), pass.into());
        }
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.users.lock().get(name).cloned()
    }

    /// Insert a fresh credential pair. Returns false without overwriting if
    /// the name is already taken.
    pub fn insert_if_absent(&self, name: &str, password: &str) -> bool {
        let mut users = self.users.lock();
        if users.contains_key(name) {
            return false;
        }
        users.insert(name.to_string(), password.to_string());
        true
    }
}

impl Default for UserDb {
    fn default() -> Self {
        UserDb::new()
    }
}

/// One pooled backend handle.
pub struct StoreHandle {
    db: Arc<UserDb>,
}

/// Fixed-size pool of store handles. `acquire` blocks while the pool is
/// empty; dropping the guard returns the handle and wakes one waiter.
pub struct StorePool {
    idle: Mutex<Vec<StoreHandle>>,
    available: Condvar,
}

impl StorePool {
    pub fn new(db: Arc<UserDb>, size: usize) -> Arc<StorePool> {
        let idle = (0..size).map(|_| StoreHandle { db: db.clone() }).collect();
        Arc::new(StorePool { idle: Mutex::new(idle), available: Condvar::new() })
    }

    pub fn acquire(self: &Arc<StorePool>) -> StoreGuard {
        let mut idle = self.idle.lock();
        while idle.is_empty() {
            self.available.wait(&mut idle);
        }
        let handle = idle.pop().expect("woken on a non-empty pool");
        StoreGuard { pool: self.clone(), handle: Some(handle) }
    }

    pub fn idle_handles(&self) -> usize {
        self.idle.lock().len()
    }
}

/// RAII scope of one acquired handle.
pub struct StoreGuard {
    pool: Arc<StorePool>,
    handle: Option<StoreHandle>,
}

impl Deref for StoreGuard {
    type Target = UserDb;

    fn deref(&self) -> &UserDb {
        &self.handle.as_ref().expect("guard outlived its handle").db
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.idle.lock().push(handle);
            self.pool.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn insert_if_absent_refuses_duplicates() {
        let db = UserDb::new();
        assert!(db.insert_if_absent("alice", "one"));
        assert!(!db.insert_if_absent("alice", "two"));
        assert_eq!(db.lookup("alice").as_deref(), Some("one"));
        assert_eq!(db.lookup("bob"), None);
    }

    #[test]
    fn seeded_entries_are_visible() {
        let db = UserDb::new();
        db.seed([("admin", "secret")]);
        assert_eq!(db.lookup("admin").as_deref(), Some("secret"));
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = StorePool::new(Arc::new(UserDb::new()), 1);
        let guard = pool.acquire();
        assert_eq!(pool.idle_handles(), 0);

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let _guard = pool.acquire();
            })
        };
        // The waiter cannot finish while the handle is held.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.join().expect("waiter should acquire after release");
        assert_eq!(pool.idle_handles(), 1);
    }
}
