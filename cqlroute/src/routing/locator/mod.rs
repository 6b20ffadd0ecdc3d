//! Replica resolution: from a token to the hosts (and shards) owning it.
//!
//! Two tiers are consulted. A [`TabletMap`] holds per-table tablets pushed
//! by tablet-aware clusters; when it has no coverage for a token, the
//! static [`TokenMap`] built from the tokens hosts advertise answers instead.

pub mod tablet_updater;
pub mod tablets;
mod token_map;
mod token_ring;

pub use tablet_updater::TabletMapUpdateRequest;
pub use tablets::{TableSpec, TableTablets, Tablet, TabletMap, CUSTOM_PAYLOAD_TABLETS_V1_KEY};
pub use token_map::{TokenMap, TokenOwners};
pub use token_ring::TokenRing;
