//! Fragment cache
//!
//! Process-wide store of recently downloaded media fragments, consulted before
//! re-requesting data when content resumes after an ad break.
//!
//! Keyed by (track type, level, sequence). One instance is constructed by the
//! host and injected into every session; only the active session mutates it.
//!
//! Eviction on every append walks the appended track newest to oldest and drops
//! everything from the first entry that pushes the running duration past the
//! ceiling, or the count past the entry limit.

use crate::{config::FragmentCacheConfig, types::TrackType};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;
use url::Url;

/// Position of a fragment within its level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FragmentSn {
    /// Initialization segment (container header)
    Init,
    /// Media segment with its sequence number
    Media(u64),
}

/// Metadata of the fragment a payload was downloaded as
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentMeta {
    pub track: TrackType,
    pub level: usize,
    pub sn: FragmentSn,
    /// Start on the content timeline, in seconds
    pub start: f64,
    /// Duration in seconds (0 for init segments)
    pub duration: f64,
    pub url: Option<Url>,
}

impl FragmentMeta {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn is_init(&self) -> bool {
        self.sn == FragmentSn::Init
    }
}

/// Cached payload with its originating fragment
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub meta: FragmentMeta,
    pub payload: Bytes,
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub media_entries: usize,
    pub init_entries: usize,
    pub duration_by_track: BTreeMap<TrackType, f64>,
    pub bytes: usize,
}

#[derive(Default)]
struct CacheState {
    /// Media entries per track in append order, oldest first
    media: BTreeMap<TrackType, VecDeque<CacheEntry>>,
    /// At most one init segment per track
    init: HashMap<TrackType, CacheEntry>,
}

/// Shared fragment store
pub struct FragmentCache {
    config: FragmentCacheConfig,
    state: Mutex<CacheState>,
}

impl FragmentCache {
    pub fn new(config: FragmentCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &FragmentCacheConfig {
        &self.config
    }

    /// Store a fragment, replacing any entry with the same key
    pub fn append(&self, entry: CacheEntry) {
        let mut state = self.state.lock();
        let track = entry.meta.track;
        let level = entry.meta.level;

        if entry.meta.is_init() {
            let stale = state
                .init
                .get(&track)
                .map(|existing| existing.meta.level != level)
                .unwrap_or(false);
            if stale {
                Self::purge_level_mismatch(&mut state, track, level);
            }
            state.init.insert(track, entry);
            return;
        }

        let sn = entry.meta.sn;
        let queue = state.media.entry(track).or_default();
        queue.retain(|e| !(e.meta.level == level && e.meta.sn == sn));
        queue.push_back(entry);

        self.trim(queue, track);
    }

    /// Drop every entry of `track` cached for a level other than `level`
    fn purge_level_mismatch(state: &mut CacheState, track: TrackType, level: usize) {
        let before = state.media.get(&track).map(|q| q.len()).unwrap_or(0);
        if let Some(queue) = state.media.get_mut(&track) {
            queue.retain(|e| e.meta.level == level);
        }
        let after = state.media.get(&track).map(|q| q.len()).unwrap_or(0);
        state.init.remove(&track);
        debug!(%track, level, purged = before - after, "Purged fragments of stale level");
    }

    fn trim(&self, queue: &mut VecDeque<CacheEntry>, track: TrackType) {
        let mut accumulated = 0.0;
        let mut keep = 0;
        for entry in queue.iter().rev() {
            accumulated += entry.meta.duration;
            if accumulated > self.config.max_duration_secs || keep + 1 > self.config.max_entries {
                break;
            }
            keep += 1;
        }

        let evict = queue.len() - keep;
        if evict > 0 {
            queue.drain(..evict);
            debug!(%track, evicted = evict, kept = keep, "Trimmed fragment cache");
        }
    }

    /// Entry for an exact key, if still cached
    pub fn lookup(&self, track: TrackType, level: usize, sn: FragmentSn) -> Option<CacheEntry> {
        let state = self.state.lock();
        match sn {
            FragmentSn::Init => state
                .init
                .get(&track)
                .filter(|e| e.meta.level == level)
                .cloned(),
            FragmentSn::Media(_) => state.media.get(&track).and_then(|queue| {
                queue
                    .iter()
                    .find(|e| e.meta.level == level && e.meta.sn == sn)
                    .cloned()
            }),
        }
    }

    /// Media entry whose time span contains `position`
    pub fn covering(&self, track: TrackType, position: f64) -> Option<FragmentMeta> {
        let state = self.state.lock();
        state.media.get(&track).and_then(|queue| {
            queue
                .iter()
                .rev()
                .find(|e| position >= e.meta.start && position < e.meta.end())
                .map(|e| e.meta.clone())
        })
    }

    /// Level of the most recently cached media fragment of `track`
    pub fn last_level(&self, track: TrackType) -> Option<usize> {
        let state = self.state.lock();
        state
            .media
            .get(&track)
            .and_then(|q| q.back())
            .map(|e| e.meta.level)
    }

    /// Drop media entries that end before `position`
    pub fn purge_before(&self, position: f64) {
        let mut state = self.state.lock();
        let mut purged = 0;
        for queue in state.media.values_mut() {
            let before = queue.len();
            queue.retain(|e| e.meta.end() >= position);
            purged += before - queue.len();
        }
        debug!(position, purged, "Purged fragments before position");
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.media.clear();
        state.init.clear();
    }

    /// Return to the freshly constructed state
    pub fn reset(&self) {
        self.clear();
        debug!("Fragment cache reset");
    }

    pub fn total_duration(&self, track: TrackType) -> f64 {
        let state = self.state.lock();
        state
            .media
            .get(&track)
            .map(|q| q.iter().map(|e| e.meta.duration).sum())
            .unwrap_or(0.0)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut stats = CacheStats {
            init_entries: state.init.len(),
            ..Default::default()
        };
        for (track, queue) in &state.media {
            stats.media_entries += queue.len();
            stats
                .duration_by_track
                .insert(*track, queue.iter().map(|e| e.meta.duration).sum());
            stats.bytes += queue.iter().map(|e| e.payload.len()).sum::<usize>();
        }
        stats.bytes += state.init.values().map(|e| e.payload.len()).sum::<usize>();
        stats
    }
}

impl Default for FragmentCache {
    fn default() -> Self {
        Self::new(FragmentCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(track: TrackType, level: usize, sn: u64, duration: f64) -> CacheEntry {
        CacheEntry {
            meta: FragmentMeta {
                track,
                level,
                sn: FragmentSn::Media(sn),
                start: sn as f64 * duration,
                duration,
                url: None,
            },
            payload: Bytes::from(format!("{track}-{level}-{sn}")),
        }
    }

    fn init(track: TrackType, level: usize) -> CacheEntry {
        CacheEntry {
            meta: FragmentMeta {
                track,
                level,
                sn: FragmentSn::Init,
                start: 0.0,
                duration: 0.0,
                url: None,
            },
            payload: Bytes::from(format!("init-{level}")),
        }
    }

    #[test]
    fn test_lookup_returns_appended_payload() {
        let cache = FragmentCache::default();
        cache.append(media(TrackType::Video, 2, 7, 6.0));

        let hit = cache.lookup(TrackType::Video, 2, FragmentSn::Media(7)).unwrap();
        assert_eq!(hit.payload, Bytes::from("video-2-7"));
        assert!(cache.lookup(TrackType::Video, 1, FragmentSn::Media(7)).is_none());
        assert!(cache.lookup(TrackType::Audio, 2, FragmentSn::Media(7)).is_none());
    }

    #[test]
    fn test_same_key_replaces() {
        let cache = FragmentCache::default();
        cache.append(media(TrackType::Video, 0, 1, 6.0));
        let mut replacement = media(TrackType::Video, 0, 1, 6.0);
        replacement.payload = Bytes::from_static(b"new");
        cache.append(replacement);

        assert_eq!(cache.stats().media_entries, 1);
        let hit = cache.lookup(TrackType::Video, 0, FragmentSn::Media(1)).unwrap();
        assert_eq!(hit.payload, Bytes::from_static(b"new"));
    }

    #[test]
    fn test_duration_ceiling_evicts_oldest() {
        let cache = FragmentCache::default();
        for sn in 0..20 {
            cache.append(media(TrackType::Video, 0, sn, 6.0));
            assert!(cache.total_duration(TrackType::Video) <= 70.0);
        }
        // 11 * 6s = 66s fits, 12 would be 72s
        assert_eq!(cache.stats().media_entries, 11);
        assert!(cache.lookup(TrackType::Video, 0, FragmentSn::Media(8)).is_none());
        assert!(cache.lookup(TrackType::Video, 0, FragmentSn::Media(9)).is_some());
        assert!(cache.lookup(TrackType::Video, 0, FragmentSn::Media(19)).is_some());
    }

    #[test]
    fn test_count_ceiling() {
        let cache = FragmentCache::default();
        for sn in 0..60 {
            cache.append(media(TrackType::Audio, 0, sn, 1.0));
        }
        assert_eq!(cache.stats().media_entries, 40);
        assert!(cache.lookup(TrackType::Audio, 0, FragmentSn::Media(19)).is_none());
        assert!(cache.lookup(TrackType::Audio, 0, FragmentSn::Media(20)).is_some());
    }

    #[test]
    fn test_tracks_are_trimmed_independently() {
        let cache = FragmentCache::default();
        for sn in 0..15 {
            cache.append(media(TrackType::Video, 0, sn, 6.0));
        }
        cache.append(media(TrackType::Audio, 0, 0, 6.0));
        assert!(cache.lookup(TrackType::Audio, 0, FragmentSn::Media(0)).is_some());
    }

    #[test]
    fn test_stale_level_purge() {
        let cache = FragmentCache::default();
        cache.append(init(TrackType::Video, 1));
        cache.append(media(TrackType::Video, 1, 1, 6.0));
        cache.append(media(TrackType::Audio, 1, 1, 6.0));

        cache.append(init(TrackType::Video, 3));

        assert!(cache.lookup(TrackType::Video, 1, FragmentSn::Init).is_none());
        assert!(cache.lookup(TrackType::Video, 1, FragmentSn::Media(1)).is_none());
        assert!(cache.lookup(TrackType::Video, 3, FragmentSn::Init).is_some());
        // Other tracks untouched
        assert!(cache.lookup(TrackType::Audio, 1, FragmentSn::Media(1)).is_some());
    }

    #[test]
    fn test_same_level_init_keeps_media() {
        let cache = FragmentCache::default();
        cache.append(init(TrackType::Video, 1));
        cache.append(media(TrackType::Video, 1, 1, 6.0));
        cache.append(init(TrackType::Video, 1));
        assert!(cache.lookup(TrackType::Video, 1, FragmentSn::Media(1)).is_some());
    }

    #[test]
    fn test_purge_before() {
        let cache = FragmentCache::default();
        for sn in 0..5 {
            cache.append(media(TrackType::Video, 0, sn, 4.0));
        }
        // Fragment 1 spans [4, 8)
        cache.purge_before(9.0);
        assert!(cache.lookup(TrackType::Video, 0, FragmentSn::Media(1)).is_none());
        assert!(cache.lookup(TrackType::Video, 0, FragmentSn::Media(2)).is_some());
        assert_eq!(cache.covering(TrackType::Video, 13.0).map(|m| m.sn), Some(FragmentSn::Media(3)));
    }

    #[test]
    fn test_last_level_and_reset() {
        let cache = FragmentCache::default();
        cache.append(media(TrackType::Video, 0, 1, 4.0));
        cache.append(media(TrackType::Video, 2, 2, 4.0));
        assert_eq!(cache.last_level(TrackType::Video), Some(2));

        cache.reset();
        assert_eq!(cache.stats(), CacheStats::default());
        assert_eq!(cache.last_level(TrackType::Video), None);
    }
}
