// DANS : src/decoders/mod.rs

pub mod mpl_core;

pub use mpl_core::{decode_asset_header, AssetHeader, COLLECTION_MEMCMP_OFFSET};
