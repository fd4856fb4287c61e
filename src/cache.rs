//! Byte-budgeted registry of decoded images and streaming volumes.
//!
//! Entries are evicted least recently used first when an insert would exceed
//! the budget. Pinned entries are never evicted; if the unpinned ones cannot
//! free enough room the insert fails and the cache is left as it was.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_MAX_CACHE_SIZE, StreamingConfig};
use crate::loader::DecodedImage;
use crate::volume::StreamingImageVolume;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache size exceeded: {requested} bytes requested, {available} bytes can be made available")]
    CacheSizeExceeded { requested: usize, available: usize },

    #[error("Not cached: {0}")]
    NotCached(String),
}

#[derive(Debug, Clone)]
pub enum CachePayload {
    Image(Arc<DecodedImage>),
    Volume(Arc<StreamingImageVolume>),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: String,
    pub size_in_bytes: usize,
    pub payload: CachePayload,
}

impl CacheEntry {
    pub fn new(id: impl Into<String>, size_in_bytes: usize, payload: CachePayload) -> Self {
        Self {
            id: id.into(),
            size_in_bytes,
            payload,
        }
    }

    /// Entry for a decoded image, keyed by its image id.
    pub fn image(image: Arc<DecodedImage>) -> Self {
        Self::new(
            image.image_id.clone(),
            image.size_in_bytes(),
            CachePayload::Image(image),
        )
    }

    /// Entry for a volume, keyed by its volume id and sized by its arena.
    pub fn volume(volume: Arc<StreamingImageVolume>) -> Self {
        Self::new(
            volume.volume_id().to_owned(),
            volume.size_in_bytes(),
            CachePayload::Volume(volume),
        )
    }

    fn released(&self) {
        if let CachePayload::Volume(volume) = &self.payload {
            volume.cancel_load();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub size_in_bytes: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    entry: CacheEntry,
    last_used: u64,
    pins: usize,
}

/// Cache shared between tasks.
pub type SharedCache = Arc<Mutex<Cache>>;

pub struct Cache {
    slots: HashMap<String, Slot>,
    /// Access tick to id, oldest first.
    lru: BTreeMap<u64, String>,
    tick: u64,
    size_in_bytes: usize,
    max_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHE_SIZE)
    }
}

impl Cache {
    pub fn new(max_size: usize) -> Self {
        Self {
            slots: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            size_in_bytes: 0,
            max_size,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn shared(max_size: usize) -> SharedCache {
        Arc::new(Mutex::new(Self::new(max_size)))
    }

    /// Shared cache with the budget of `config`.
    pub fn from_config(config: &StreamingConfig) -> SharedCache {
        Self::shared(config.max_cache_size)
    }

    /// Process-wide cache with the default budget.
    pub fn global() -> &'static SharedCache {
        static GLOBAL: OnceLock<SharedCache> = OnceLock::new();
        GLOBAL.get_or_init(|| Cache::shared(DEFAULT_MAX_CACHE_SIZE))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, id: &str) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(id) {
            self.lru.remove(&slot.last_used);
            slot.last_used = tick;
            self.lru.insert(tick, id.to_owned());
        }
    }

    /// Ids to evict so that `incoming` bytes fit, replacing `replacing` if set.
    fn plan_eviction(&self, incoming: usize, replacing: Option<&str>) -> Result<Vec<String>, CacheError> {
        let replaced = replacing
            .and_then(|id| self.slots.get(id))
            .map_or(0, |slot| slot.entry.size_in_bytes);
        let mut used = self.size_in_bytes - replaced;
        let mut victims = Vec::new();
        let fits = |used: usize| used.checked_add(incoming).is_some_and(|total| total <= self.max_size);

        for id in self.lru.values() {
            if fits(used) {
                break;
            }
            if Some(id.as_str()) == replacing {
                continue;
            }
            let Some(slot) = self.slots.get(id) else {
                continue;
            };
            if slot.pins > 0 {
                continue;
            }
            used -= slot.entry.size_in_bytes;
            victims.push(id.clone());
        }

        if !fits(used) {
            return Err(CacheError::CacheSizeExceeded {
                requested: incoming,
                available: self.max_size.saturating_sub(used),
            });
        }
        Ok(victims)
    }

    fn remove_slot(&mut self, id: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(id)?;
        self.lru.remove(&slot.last_used);
        self.size_in_bytes -= slot.entry.size_in_bytes;
        slot.entry.released();
        Some(slot.entry)
    }

    fn evict(&mut self, victims: Vec<String>) -> Vec<CacheEntry> {
        victims
            .into_iter()
            .filter_map(|id| {
                let entry = self.remove_slot(&id)?;
                self.evictions += 1;
                debug!(id = %entry.id, size = entry.size_in_bytes, "Evicted cache entry");
                Some(entry)
            })
            .collect()
    }

    /// Insert `entry`, evicting unpinned entries as needed. Returns what was
    /// evicted.
    ///
    /// Replacing an existing id keeps its pin count and charges only the size
    /// difference. On `CacheSizeExceeded` nothing is changed.
    pub fn put(&mut self, entry: CacheEntry) -> Result<Vec<CacheEntry>, CacheError> {
        let existing = self.slots.contains_key(&entry.id);
        let victims = self.plan_eviction(
            entry.size_in_bytes,
            existing.then_some(entry.id.as_str()),
        )?;
        let evicted = self.evict(victims);

        let tick = self.next_tick();
        let pins = match self.slots.remove(&entry.id) {
            Some(old) => {
                self.lru.remove(&old.last_used);
                self.size_in_bytes -= old.entry.size_in_bytes;
                old.pins
            }
            None => 0,
        };
        trace!(id = %entry.id, size = entry.size_in_bytes, replaced = existing, "Cached entry");
        self.size_in_bytes += entry.size_in_bytes;
        self.lru.insert(tick, entry.id.clone());
        self.slots.insert(
            entry.id.clone(),
            Slot {
                entry,
                last_used: tick,
                pins,
            },
        );
        Ok(evicted)
    }

    /// Look up `id` and mark it most recently used.
    pub fn get(&mut self, id: &str) -> Option<CacheEntry> {
        if !self.slots.contains_key(id) {
            self.misses += 1;
            return None;
        }
        self.hits += 1;
        self.touch(id);
        self.slots.get(id).map(|slot| slot.entry.clone())
    }

    pub fn get_image(&mut self, id: &str) -> Option<Arc<DecodedImage>> {
        match self.get(id)?.payload {
            CachePayload::Image(image) => Some(image),
            CachePayload::Volume(_) => None,
        }
    }

    pub fn get_volume(&mut self, id: &str) -> Option<Arc<StreamingImageVolume>> {
        match self.get(id)?.payload {
            CachePayload::Volume(volume) => Some(volume),
            CachePayload::Image(_) => None,
        }
    }

    /// Look up `id` without touching the LRU order or the stats.
    pub fn peek(&self, id: &str) -> Option<&CacheEntry> {
        self.slots.get(id).map(|slot| &slot.entry)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Protect `id` from eviction. Pins nest.
    pub fn pin(&mut self, id: &str) -> Result<usize, CacheError> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| CacheError::NotCached(id.to_owned()))?;
        slot.pins += 1;
        Ok(slot.pins)
    }

    /// Release one pin of `id`. Returns the remaining pin count.
    pub fn unpin(&mut self, id: &str) -> Result<usize, CacheError> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| CacheError::NotCached(id.to_owned()))?;
        slot.pins = slot.pins.saturating_sub(1);
        Ok(slot.pins)
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.slots.get(id).is_some_and(|slot| slot.pins > 0)
    }

    /// Remove `id` regardless of pins, cancelling a volume's running load.
    /// The arena is freed once the returned entry and its other holders drop.
    pub fn decache(&mut self, id: &str) -> Option<CacheEntry> {
        let entry = self.remove_slot(id)?;
        debug!(id, size = entry.size_in_bytes, "Decached entry");
        Some(entry)
    }

    /// Remove every unpinned entry.
    pub fn purge(&mut self) -> usize {
        let ids: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.pins == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let count = ids
            .iter()
            .filter(|id| self.remove_slot(id).is_some())
            .count();
        debug!(count, remaining = self.slots.len(), "Purged cache");
        count
    }

    /// Change the budget, evicting unpinned entries until the cache fits.
    /// Pinned entries may keep the cache above a lowered budget.
    pub fn set_max_size(&mut self, max_size: usize) -> Vec<CacheEntry> {
        self.max_size = max_size;
        let victims: Vec<String> = {
            let mut used = self.size_in_bytes;
            self.lru
                .values()
                .filter(|id| self.slots.get(*id).is_some_and(|slot| slot.pins == 0))
                .take_while(|id| {
                    if used <= max_size {
                        return false;
                    }
                    used -= self.slots.get(*id).map_or(0, |slot| slot.entry.size_in_bytes);
                    true
                })
                .cloned()
                .collect()
        };
        let evicted = self.evict(victims);
        if self.size_in_bytes > self.max_size {
            warn!(
                size = self.size_in_bytes,
                max_size, "Pinned entries keep cache above its budget"
            );
        }
        evicted
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots.len(),
            size_in_bytes: self.size_in_bytes,
            max_size: self.max_size,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}
