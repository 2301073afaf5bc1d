//! Geo-Lookup Engine (spec §4.6).

pub mod cache;
pub mod data;
pub mod server;

pub use data::{GeoDataset, GeoRow, LookupResult};
pub use server::GeoService;
