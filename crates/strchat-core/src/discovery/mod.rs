pub mod crawler;
pub mod store;

pub use crawler::{Crawler, Skip};
pub use store::{DiscoveredRelay, DiscoveredRelayStore};
