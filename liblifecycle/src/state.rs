//! Reference count tables owned by one tracker.
//!
//! Every mutating operation validates the whole batch first and only then
//! touches a count, so a rejected batch leaves the tables unchanged.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use common::{ChunkKey, TileableKey};
use tracing::debug;

use crate::error::LifecycleError;

#[derive(Debug, Default)]
pub struct TrackerState {
    tileable_chunks: HashMap<TileableKey, Vec<ChunkKey>>,
    tileable_counts: HashMap<TileableKey, u64>,
    chunk_counts: HashMap<ChunkKey, u64>,
}

impl TrackerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the chunk list of `tileable_key`. The first registration wins.
    pub fn track(&mut self, tileable_key: TileableKey, chunk_keys: Vec<ChunkKey>) {
        match self.tileable_chunks.entry(tileable_key) {
            Entry::Occupied(e) => {
                if e.get() != &chunk_keys {
                    debug!("Tileable {} is already tracked, keeping its chunks", e.key());
                }
            }
            Entry::Vacant(e) => {
                e.insert(chunk_keys);
            }
        }
    }

    pub fn is_tracked(&self, tileable_key: &TileableKey) -> bool {
        self.tileable_chunks.contains_key(tileable_key)
    }

    pub fn incref_chunks(&mut self, chunk_keys: &[ChunkKey]) {
        for key in chunk_keys {
            *self.chunk_counts.entry(key.clone()).or_insert(0) += 1;
        }
    }

    /// Returns the chunks whose count reached zero, in first-seen order.
    pub fn decref_chunks(
        &mut self,
        chunk_keys: &[ChunkKey],
    ) -> Result<Vec<ChunkKey>, LifecycleError> {
        self.check_chunk_decrements(chunk_keys.iter())?;
        Ok(self.apply_chunk_decrements(chunk_keys.iter()))
    }

    pub fn incref_tileables(
        &mut self,
        tileable_keys: &[TileableKey],
    ) -> Result<(), LifecycleError> {
        self.check_tracked(tileable_keys)?;
        for key in tileable_keys {
            *self.tileable_counts.entry(key.clone()).or_insert(0) += 1;
            let chunks = self.chunks_of(key);
            self.incref_chunks(&chunks);
        }
        Ok(())
    }

    pub fn decref_tileables(
        &mut self,
        tileable_keys: &[TileableKey],
    ) -> Result<Vec<ChunkKey>, LifecycleError> {
        self.check_tracked(tileable_keys)?;

        let mut tileable_decrements: HashMap<&TileableKey, u64> = HashMap::new();
        for key in tileable_keys {
            *tileable_decrements.entry(key).or_insert(0) += 1;
        }
        for (key, requested) in &tileable_decrements {
            let current = self.tileable_counts.get(*key).copied().unwrap_or(0);
            if current < *requested {
                return Err(LifecycleError::RefCountUnderflow {
                    key: key.to_string(),
                    current,
                    requested: *requested,
                });
            }
        }
        let cascaded: Vec<ChunkKey> = tileable_keys
            .iter()
            .flat_map(|key| self.chunks_of(key))
            .collect();
        self.check_chunk_decrements(cascaded.iter())?;

        for key in tileable_keys {
            if let Some(count) = self.tileable_counts.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.tileable_counts.remove(key);
                }
            }
        }
        Ok(self.apply_chunk_decrements(cascaded.iter()))
    }

    pub fn get_chunk_ref_counts(&self, chunk_keys: &[ChunkKey]) -> Vec<u64> {
        chunk_keys
            .iter()
            .map(|key| self.chunk_counts.get(key).copied().unwrap_or(0))
            .collect()
    }

    pub fn get_tileable_ref_counts(&self, tileable_keys: &[TileableKey]) -> Vec<u64> {
        tileable_keys
            .iter()
            .map(|key| self.tileable_counts.get(key).copied().unwrap_or(0))
            .collect()
    }

    /// Only positive counts are reported.
    pub fn get_all_chunk_ref_counts(&self) -> HashMap<ChunkKey, u64> {
        self.chunk_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }

    /// Clears every table and returns the chunks that still had a positive count.
    pub fn drain_live_chunks(&mut self) -> Vec<ChunkKey> {
        let mut live: Vec<ChunkKey> = self
            .chunk_counts
            .drain()
            .filter(|(_, count)| *count > 0)
            .map(|(key, _)| key)
            .collect();
        live.sort();
        self.tileable_counts.clear();
        self.tileable_chunks.clear();
        live
    }

    fn chunks_of(&self, tileable_key: &TileableKey) -> Vec<ChunkKey> {
        self.tileable_chunks
            .get(tileable_key)
            .cloned()
            .unwrap_or_default()
    }

    fn check_tracked(&self, tileable_keys: &[TileableKey]) -> Result<(), LifecycleError> {
        match tileable_keys.iter().find(|key| !self.is_tracked(key)) {
            Some(key) => Err(LifecycleError::NotTracked(key.clone())),
            None => Ok(()),
        }
    }

    fn check_chunk_decrements<'a>(
        &self,
        chunk_keys: impl Iterator<Item = &'a ChunkKey>,
    ) -> Result<(), LifecycleError> {
        let mut requested: HashMap<&ChunkKey, u64> = HashMap::new();
        for key in chunk_keys {
            *requested.entry(key).or_insert(0) += 1;
        }
        for (key, requested) in requested {
            let current = self.chunk_counts.get(key).copied().unwrap_or(0);
            if current < requested {
                return Err(LifecycleError::RefCountUnderflow {
                    key: key.to_string(),
                    current,
                    requested,
                });
            }
        }
        Ok(())
    }

    fn apply_chunk_decrements<'a>(
        &mut self,
        chunk_keys: impl Iterator<Item = &'a ChunkKey>,
    ) -> Vec<ChunkKey> {
        let mut released = Vec::new();
        for key in chunk_keys {
            if let Some(count) = self.chunk_counts.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.chunk_counts.remove(key);
                    released.push(key.clone());
                }
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(keys: &[&str]) -> Vec<ChunkKey> {
        keys.iter().map(|k| ChunkKey::from(*k)).collect()
    }

    #[test]
    fn test_tileable_cascade() {
        let mut state = TrackerState::new();
        let t = TileableKey::from("t");
        state.track(t.clone(), chunks(&["c1", "c2"]));
        state.incref_tileables(&[t.clone()]).unwrap();
        state.incref_tileables(&[t.clone()]).unwrap();
        assert_eq!(state.get_chunk_ref_counts(&chunks(&["c1", "c2"])), vec![2, 2]);
        assert_eq!(state.get_tileable_ref_counts(&[t.clone()]), vec![2]);

        assert!(state.decref_tileables(&[t.clone()]).unwrap().is_empty());
        assert_eq!(state.get_chunk_ref_counts(&chunks(&["c1", "c2"])), vec![1, 1]);

        let released = state.decref_tileables(&[t.clone()]).unwrap();
        assert_eq!(released, chunks(&["c1", "c2"]));
        assert_eq!(state.get_chunk_ref_counts(&chunks(&["c1", "c2"])), vec![0, 0]);
        assert!(state.get_all_chunk_ref_counts().is_empty());
    }

    #[test]
    fn test_unknown_tileable_leaves_counts_unchanged() {
        let mut state = TrackerState::new();
        let t = TileableKey::from("t");
        state.track(t.clone(), chunks(&["c1"]));
        state.incref_tileables(&[t.clone()]).unwrap();

        let err = state
            .incref_tileables(&[t.clone(), TileableKey::from("unknown")])
            .unwrap_err();
        assert_eq!(err, LifecycleError::NotTracked(TileableKey::from("unknown")));
        assert_eq!(state.get_tileable_ref_counts(&[t.clone()]), vec![1]);

        let err = state
            .decref_tileables(&[t.clone(), TileableKey::from("unknown")])
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotTracked(_)));
        assert_eq!(state.get_chunk_ref_counts(&chunks(&["c1"])), vec![1]);
    }

    #[test]
    fn test_extra_decref_is_detected() {
        let mut state = TrackerState::new();
        let t = TileableKey::from("t");
        state.track(t.clone(), chunks(&["c1"]));
        state.incref_tileables(&[t.clone()]).unwrap();

        let err = state.decref_tileables(&[t.clone(), t.clone()]).unwrap_err();
        assert!(matches!(err, LifecycleError::RefCountUnderflow { requested: 2, .. }));
        assert_eq!(state.get_chunk_ref_counts(&chunks(&["c1"])), vec![1]);

        let err = state.decref_chunks(&chunks(&["never"])).unwrap_err();
        assert!(matches!(err, LifecycleError::RefCountUnderflow { current: 0, .. }));
    }

    #[test]
    fn test_shared_chunks_survive_partial_release() {
        let mut state = TrackerState::new();
        let a = TileableKey::from("a");
        let b = TileableKey::from("b");
        state.track(a.clone(), chunks(&["shared", "a1"]));
        state.track(b.clone(), chunks(&["shared"]));
        state.incref_tileables(&[a.clone(), b.clone()]).unwrap();

        assert_eq!(state.decref_tileables(&[a]).unwrap(), chunks(&["a1"]));
        assert_eq!(state.get_all_chunk_ref_counts().get(&ChunkKey::from("shared")), Some(&1));
        assert_eq!(state.decref_tileables(&[b]).unwrap(), chunks(&["shared"]));
    }

    #[test]
    fn test_first_track_wins_and_drain() {
        let mut state = TrackerState::new();
        let t = TileableKey::from("t");
        state.track(t.clone(), chunks(&["c1"]));
        state.track(t.clone(), chunks(&["other"]));
        state.incref_tileables(&[t]).unwrap();
        state.incref_chunks(&chunks(&["loose"]));
        assert_eq!(state.drain_live_chunks(), chunks(&["c1", "loose"]));
        assert!(state.drain_live_chunks().is_empty());
        assert!(!state.is_tracked(&TileableKey::from("t")));
    }
}
