use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_RATING: f32 = 10.0;

/// Per-user playback state of a single item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatchState {
    #[serde(default)]
    pub is_watched: bool,
    #[serde(default)]
    pub view_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_viewed_at: Option<DateTime<Utc>>,
    /// 0.0 to 10.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rating: Option<f32>,
    /// Resume position of a partially played item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_offset_ms: Option<u64>,
    /// Resume position as a fraction of the duration, so it survives different encodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_percent: Option<f32>,
}

impl WatchState {
    pub fn watched(view_count: u32) -> Self {
        Self {
            is_watched: true,
            view_count: view_count.max(1),
            ..Default::default()
        }
    }

    pub fn with_rating(mut self, rating: f32) -> Self {
        self.user_rating = Some(rating);
        self
    }

    pub fn with_last_viewed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_viewed_at = Some(at);
        self
    }

    pub fn in_progress(&self) -> bool {
        !self.is_watched && self.view_offset_ms.unwrap_or(0) > 0
    }

    /// Anything worth carrying over: a view, a rating or a resume point.
    pub fn has_activity(&self) -> bool {
        self.is_watched || self.view_count > 0 || self.user_rating.is_some() || self.in_progress()
    }

    /// Fill `view_percent` from the offset, rounded to two decimals.
    pub fn with_percent_from(mut self, duration_ms: Option<u64>) -> Self {
        if let (Some(offset), Some(duration)) = (self.view_offset_ms, duration_ms) {
            if duration > 0 && offset > 0 {
                let percent = (offset as f64 / duration as f64).min(1.0);
                self.view_percent = Some(((percent * 100.0).round() / 100.0) as f32);
            }
        }
        self
    }

    /// Ranking used when two records describe the same item: watched first, then more views.
    pub fn precedence(&self) -> (bool, u32) {
        (self.is_watched, self.view_count)
    }
}

pub fn is_valid_rating(rating: f32) -> bool {
    rating.is_finite() && (0.0..=MAX_RATING).contains(&rating)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_activity() {
        assert!(!WatchState::default().has_activity());
        assert!(WatchState::watched(1).has_activity());
        assert!(WatchState::default().with_rating(4.0).has_activity());

        let partial = WatchState {
            view_offset_ms: Some(60_000),
            ..Default::default()
        };
        assert!(partial.has_activity());
    }

    #[test]
    fn test_percent_from_duration() {
        let state = WatchState {
            view_offset_ms: Some(1_000),
            ..Default::default()
        }
        .with_percent_from(Some(3_000));
        assert_eq!(state.view_percent, Some(0.33));

        let no_duration = WatchState {
            view_offset_ms: Some(1_000),
            ..Default::default()
        }
        .with_percent_from(Some(0));
        assert_eq!(no_duration.view_percent, None);
    }

    #[test]
    fn test_rating_bounds() {
        assert!(is_valid_rating(0.0));
        assert!(is_valid_rating(10.0));
        assert!(!is_valid_rating(10.5));
        assert!(!is_valid_rating(f32::NAN));
    }
}
