//! Stream id to local connection mapping

use std::collections::HashMap;
use tracing::warn;

/// Pairs tunnel stream ids with local connections
///
/// Keys are unique and every entry leaves the table exactly once, through
/// `remove` or `drain`.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    entries: HashMap<u32, T>,
    removed: u64,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            removed: 0,
        }
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; a duplicate id is refused and handed back
    pub fn insert(&mut self, stream_id: u32, entry: T) -> Option<T> {
        if self.entries.contains_key(&stream_id) {
            warn!("Stream {} already has a local connection", stream_id);
            return Some(entry);
        }
        self.entries.insert(stream_id, entry);
        None
    }

    pub fn get_mut(&mut self, stream_id: u32) -> Option<&mut T> {
        self.entries.get_mut(&stream_id)
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.entries.contains_key(&stream_id)
    }

    /// Take an entry out; `None` if it was already removed
    pub fn remove(&mut self, stream_id: u32) -> Option<T> {
        let entry = self.entries.remove(&stream_id)?;
        self.removed += 1;
        Some(entry)
    }

    /// Take every entry out
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let drained: Vec<(u32, T)> = self.entries.drain().collect();
        self.removed += drained.len() as u64;
        drained
    }

    /// Snapshot of the ids currently present
    pub fn ids(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.entries.iter_mut().map(|(id, entry)| (*id, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that have left the table
    pub fn removed(&self) -> u64 {
        self.removed
    }
}
