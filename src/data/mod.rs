//! Stats merge and time-bucketing engine.
//!
//! Raw snapshots arrive from workers as loosely shaped JSON. This module
//! turns them into normalized timelines and finalized hourly windows, and
//! folds batches into stored documents:
//!
//! ```text
//!  raw snapshot ──▶ MetricPoint ──▶ Timeline ──merge──▶ TrackingWindow
//!                                                         │ apply_horizon
//!                                                         │ update_history
//!                                                         ▼
//!                                              stats.posts[url].tracking
//! ```
//!
//! Everything except the document appliers in [`posts`] and [`accounts`] is a
//! pure function of its inputs, including `now`.

pub mod accounts;
pub mod posts;
mod timeline;
mod window;

pub use accounts::{apply_accounts_batch, normalize_account};
pub use posts::{apply_posts_batch, collect_global_tracking};
pub use timeline::{MetricPoint, Timeline};
pub use window::{
    compute_hourly, compute_hourly_from, horizon, ready_hours, History24h, HourlyRow,
    TrackingWindow, WindowRank, WINDOW_HOURS,
};

use chrono::{Duration, FixedOffset};
use pulsewatch_types::msk;

/// Knobs shared by the document appliers.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Zone used for hour range labels.
    pub display_zone: FixedOffset,
    /// How long follower history is kept.
    pub follower_retention: Duration,
    /// Minimum spacing between follower points with an unchanged value.
    pub follower_min_spacing: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            display_zone: msk(),
            follower_retention: Duration::days(8),
            follower_min_spacing: Duration::minutes(5),
        }
    }
}
