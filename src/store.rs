use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Stored payload. The variant of a live entry never changes in place;
/// type transitions go through remove + insert.
pub(crate) enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
}

impl Value {
    pub(crate) fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::Str(b) => Some(b),
            _ => None,
        }
    }

    pub(crate) fn as_list(&self) -> Option<&VecDeque<Vec<u8>>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub(crate) fn as_list_mut(&mut self) -> Option<&mut VecDeque<Vec<u8>>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub(crate) fn as_set(&self) -> Option<&HashSet<Vec<u8>>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_set_mut(&mut self) -> Option<&mut HashSet<Vec<u8>>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }
}

pub(crate) struct Entry {
    pub(crate) value: Value,
    /// Absolute deadline. `None` means the entry never expires.
    pub(crate) expiry: Option<Instant>,
}

impl Entry {
    pub(crate) fn string(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Str(value),
            expiry: ttl.map(|d| Instant::now() + d),
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|e| Instant::now() >= e)
    }

    /// Whole seconds until expiry: `-1` for no expiry, `0` once elapsed.
    pub(crate) fn ttl_secs(&self) -> i64 {
        match self.expiry {
            None => -1,
            Some(e) => {
                let now = Instant::now();
                if e <= now {
                    0
                } else {
                    (e - now).as_secs() as i64
                }
            }
        }
    }
}

pub(crate) struct Db {
    pub(crate) entries: HashMap<Vec<u8>, Entry>,
}

impl Db {
    pub(crate) fn new() -> Self {
        metrics::gauge!("respd_keys_total").set(0.0);
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up a key, deleting it first if its expiry has elapsed. Every
    /// command goes through this (or the `_mut` variant), which is what
    /// makes lazy expiration an invariant of the read path.
    pub(crate) fn get_live(&mut self, key: &[u8]) -> Option<&Entry> {
        self.expire_if_due(key);
        self.entries.get(key)
    }

    pub(crate) fn get_live_mut(&mut self, key: &[u8]) -> Option<&mut Entry> {
        self.expire_if_due(key);
        self.entries.get_mut(key)
    }

    fn expire_if_due(&mut self, key: &[u8]) {
        if self.entries.get(key).is_some_and(|e| e.is_expired()) {
            self.remove(key);
        }
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, entry: Entry) {
        self.entries.insert(key, entry);
        metrics::gauge!("respd_keys_total").set(self.entries.len() as f64);
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> Option<Entry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            metrics::gauge!("respd_keys_total").set(self.entries.len() as f64);
        }
        removed
    }

    /// Remove `key` when its collection payload is empty, so that an empty
    /// list or set is never observable. Call after any shrinking mutation.
    pub(crate) fn drop_if_empty(&mut self, key: &[u8]) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::Set(s)) => s.is_empty(),
            _ => false,
        };
        if empty {
            self.remove(key);
        }
    }
}

pub(crate) type Store = Arc<RwLock<Db>>;

pub(crate) fn new_store() -> Store {
    Arc::new(RwLock::new(Db::new()))
}
