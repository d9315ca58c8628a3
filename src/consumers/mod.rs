// src/consumers/mod.rs

//! Dashboard features built on the shared channel. Each one registers its
//! handlers through a `Subscriber` and unregisters them when dropped.

pub mod alert_banner;
pub mod dashboard_refresh;
pub mod sighting_feed;

pub use alert_banner::{Alert, AlertBanner};
pub use dashboard_refresh::DashboardRefresh;
pub use sighting_feed::SightingFeed;
