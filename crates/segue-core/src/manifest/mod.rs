//! Manifest model and rendition selection for HLS ad creatives

mod hls;

pub use hls::{HlsLoader, HlsParser, LoadedLevel};

use crate::types::{AudioRendition, Level, Segment};
use serde::{Deserialize, Serialize};
use url::Url;

/// Parsed top-level manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterManifest {
    /// Renditions in manifest order
    pub levels: Vec<Level>,
    /// Alternate audio renditions
    pub audio: Vec<AudioRendition>,
    /// False when the top-level document was itself a media playlist
    pub is_multivariant: bool,
    pub url: Url,
}

/// Parsed media playlist of one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` present
    pub end_list: bool,
    pub url: Url,
}

impl MediaPlaylist {
    /// Sum of segment durations, in seconds
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration.as_secs_f64()).sum()
    }
}

/// Returns true if the document lists renditions rather than segments
pub fn is_multivariant(content: &str) -> bool {
    content.contains("#EXT-X-STREAM-INF")
}

/// Pick the rendition to load for an ad creative.
///
/// Prefers 720p when a bandwidth estimate is known and is at least double the
/// 720p rendition's bandwidth, otherwise the lowest-bandwidth 480p rendition,
/// otherwise the first listed level. Pure: depends only on its inputs.
pub fn select_level_to_load(levels: &[Level], bandwidth_estimate: Option<u64>) -> Option<&Level> {
    let lowest_at = |height: u32| {
        levels
            .iter()
            .filter(|l| l.height() == height)
            .min_by_key(|l| l.bandwidth)
    };

    if let (Some(estimate), Some(hd)) = (bandwidth_estimate, lowest_at(720)) {
        if estimate >= hd.bandwidth.saturating_mul(2) {
            return Some(hd);
        }
    }

    lowest_at(480).or_else(|| levels.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn level(index: usize, height: u32, kbps: u64) -> Level {
        Level {
            index,
            bandwidth: kbps * 1000,
            resolution: Some(Resolution::new(height * 16 / 9, height)),
            codecs: None,
            uri: Url::parse(&format!("https://ads.test/{height}p.m3u8")).unwrap(),
        }
    }

    #[test]
    fn test_prefers_720p_with_headroom() {
        let levels = vec![level(0, 480, 500), level(1, 720, 2000)];
        let picked = select_level_to_load(&levels, Some(4_000_000)).unwrap();
        assert_eq!(picked.height(), 720);
    }

    #[test]
    fn test_falls_back_to_480p_without_headroom() {
        let levels = vec![level(0, 480, 500), level(1, 720, 2000)];
        let picked = select_level_to_load(&levels, Some(3_500_000)).unwrap();
        assert_eq!(picked.height(), 480);
    }

    #[test]
    fn test_headroom_boundary() {
        let levels = vec![level(0, 480, 500), level(1, 720, 2000)];
        // 1.5x is short of the required doubling
        assert_eq!(
            select_level_to_load(&levels, Some(3_000_000)).unwrap().height(),
            480
        );
        assert_eq!(
            select_level_to_load(&levels, Some(3_999_999)).unwrap().height(),
            480
        );
        assert_eq!(
            select_level_to_load(&levels, Some(4_000_000)).unwrap().height(),
            720
        );
    }

    #[test]
    fn test_no_estimate_picks_480p() {
        let levels = vec![level(0, 720, 2000), level(1, 480, 900), level(2, 480, 500)];
        let picked = select_level_to_load(&levels, None).unwrap();
        assert_eq!(picked.index, 2);
    }

    #[test]
    fn test_first_listed_otherwise() {
        let levels = vec![level(0, 1080, 5000), level(1, 360, 300)];
        assert_eq!(select_level_to_load(&levels, None).unwrap().index, 0);
        assert!(select_level_to_load(&[], Some(1)).is_none());
    }
}
