// Jetporch
// Copyright (C) 2023 - Michael DeHaan <michael@michaeldehaan.net> + contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// long with this program.  If not, see <http://www.gnu.org/licenses/>.

//! One connection per host class (§4.4), not per host instance: several
//! `Host` values that share a `HostClassId` share one transport, created
//! lazily under a mutex and replaced whenever it reports itself dead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::host::HostClassId;

/// Anything cacheable by class must be able to report whether it's still
/// usable, so the cache knows to reconnect instead of handing back a dead
/// transport.
pub trait Liveness {
    fn is_alive(&self) -> bool;
}

pub struct ConnectionCache<T: Liveness> {
    entries: Mutex<HashMap<HostClassId, Arc<T>>>,
}

impl<T: Liveness> Default for ConnectionCache<T> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

impl<T: Liveness> ConnectionCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the cached connection for `class`, reconnecting via `connect`
    /// if there is none yet or the cached one reports itself dead.
    pub fn get_or_connect<F>(&self, class: &HostClassId, connect: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(class) {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
        }
        let fresh = Arc::new(connect()?);
        entries.insert(class.clone(), Arc::clone(&fresh));
        Ok(fresh)
    }

    pub fn invalidate(&self, class: &HostClassId) {
        self.entries.lock().unwrap().remove(class);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConn {
        alive: bool,
        id: usize,
    }
    impl Liveness for FakeConn {
        fn is_alive(&self) -> bool {
            self.alive
        }
    }

    #[test]
    fn test_connects_once_per_class() {
        let cache: ConnectionCache<FakeConn> = ConnectionCache::new();
        let calls = AtomicUsize::new(0);
        let class = HostClassId::new("web");
        for _ in 0..3 {
            cache
                .get_or_connect(&class, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(FakeConn { alive: true, id: 1 })
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reconnects_when_dead() {
        let cache: ConnectionCache<FakeConn> = ConnectionCache::new();
        let class = HostClassId::new("web");
        cache.get_or_connect(&class, || Ok(FakeConn { alive: false, id: 1 })).unwrap();
        let second = cache.get_or_connect(&class, || Ok(FakeConn { alive: true, id: 2 })).unwrap();
        assert_eq!(second.id, 2);
    }

    #[test]
    fn test_invalidate_forces_reconnect() {
        let cache: ConnectionCache<FakeConn> = ConnectionCache::new();
        let class = HostClassId::new("db");
        cache.get_or_connect(&class, || Ok(FakeConn { alive: true, id: 1 })).unwrap();
        cache.invalidate(&class);
        assert!(cache.is_empty());
        let second = cache.get_or_connect(&class, || Ok(FakeConn { alive: true, id: 2 })).unwrap();
        assert_eq!(second.id, 2);
    }

    #[test]
    fn test_distinct_classes_get_distinct_entries() {
        let cache: ConnectionCache<FakeConn> = ConnectionCache::new();
        cache.get_or_connect(&HostClassId::new("web"), || Ok(FakeConn { alive: true, id: 1 })).unwrap();
        cache.get_or_connect(&HostClassId::new("db"), || Ok(FakeConn { alive: true, id: 2 })).unwrap();
        assert_eq!(cache.len(), 2);
    }
}
