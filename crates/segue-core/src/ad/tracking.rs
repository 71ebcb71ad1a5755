//! Ad beacons and quartile milestones

use super::model::Ad;
use crate::{error::VastErrorCode, events::Quartile, transport::HttpClient};
use std::collections::BTreeSet;
use tracing::debug;

/// Quartiles crossed by one creative play, each reported once
#[derive(Debug, Default)]
pub struct QuartileTracker {
    fired: BTreeSet<Quartile>,
}

impl QuartileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quartiles newly crossed at `position`
    pub fn update(&mut self, position: f64, duration: f64) -> Vec<Quartile> {
        if duration <= 0.0 {
            return Vec::new();
        }
        let progress = position / duration;
        Quartile::ALL
            .into_iter()
            .filter(|q| *q != Quartile::Complete || progress >= 1.0)
            .filter(|q| progress >= q.fraction() && self.fired.insert(*q))
            .collect()
    }

    /// Remaining quartiles at the end of media, `Complete` last
    pub fn finish(&mut self) -> Vec<Quartile> {
        Quartile::ALL
            .into_iter()
            .filter(|q| self.fired.insert(*q))
            .collect()
    }

    pub fn has_fired(&self, quartile: Quartile) -> bool {
        self.fired.contains(&quartile)
    }
}

/// Fires tracking beacons for ads
#[derive(Clone)]
pub struct AdTracker {
    client: HttpClient,
}

impl AdTracker {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub fn impressions(&self, ad: &Ad) {
        debug!(ad_id = %ad.id, count = ad.impressions.len(), "Firing impressions");
        for url in &ad.impressions {
            self.client.fire_beacon(url.clone());
        }
    }

    pub fn quartile(&self, ad: &Ad, quartile: Quartile) {
        for url in ad.tracking_urls(quartile) {
            self.client.fire_beacon(url.clone());
        }
    }

    pub fn click(&self, ad: &Ad) {
        for url in &ad.click_tracking {
            self.client.fire_beacon(url.clone());
        }
    }

    /// Fire the error beacon with `code`, if the ad has a template
    pub fn error(&self, ad: &Ad, code: VastErrorCode) {
        if let Some(url) = ad.error_beacon_url(code) {
            debug!(ad_id = %ad.id, code = code.code(), "Firing error beacon");
            self.client.fire_beacon(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quartiles_fire_once_in_order() {
        let mut tracker = QuartileTracker::new();
        assert_eq!(tracker.update(0.0, 20.0), vec![Quartile::Start]);
        assert!(tracker.update(1.0, 20.0).is_empty());
        assert_eq!(
            tracker.update(11.0, 20.0),
            vec![Quartile::FirstQuartile, Quartile::Midpoint]
        );
        assert!(tracker.update(11.5, 20.0).is_empty());
        assert_eq!(tracker.finish(), vec![Quartile::ThirdQuartile, Quartile::Complete]);
        assert!(tracker.finish().is_empty());
    }

    #[test]
    fn test_complete_at_end_position() {
        let mut tracker = QuartileTracker::new();
        let fired = tracker.update(20.0, 20.0);
        assert_eq!(fired.len(), 5);
        assert!(tracker.has_fired(Quartile::Complete));
    }
}
