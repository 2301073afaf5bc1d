//! Geo-Lookup compressed cache file (spec §4.6 "Cache file").
//!
//! Persists the loaded `GeoDataset` to a gzip-compressed bincode image
//! keyed by schema version; on startup, if the cache is newer than the
//! CSV and the schema version matches, load the cache instead of
//! re-parsing.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::data::{GeoDataset, SCHEMA_VERSION};

#[derive(Serialize)]
struct CacheEnvelopeRef<'a> {
    version: &'a str,
    dataset: &'a GeoDataset,
}

#[derive(Deserialize)]
struct CacheEnvelopeOwned {
    version: String,
    dataset: GeoDataset,
}

pub fn save(path: &Path, dataset: &GeoDataset) -> anyhow::Result<()> {
    let file = File::create(path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let envelope = CacheEnvelopeRef {
        version: SCHEMA_VERSION,
        dataset,
    };
    bincode::serialize_into(encoder, &envelope)?;
    Ok(())
}

pub fn load(path: &Path) -> anyhow::Result<GeoDataset> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let envelope: CacheEnvelopeOwned = bincode::deserialize_from(decoder)?;
    if envelope.version != SCHEMA_VERSION {
        anyhow::bail!("cache schema version mismatch: {} != {SCHEMA_VERSION}", envelope.version);
    }
    Ok(envelope.dataset)
}

/// Load from CSV, using the cache when it is fresh (mtime newer than the
/// CSV) and schema-compatible; otherwise reparse and rewrite the cache.
pub fn load_or_build(csv_path: &Path, cache_path: &Path) -> anyhow::Result<GeoDataset> {
    if is_cache_fresh(csv_path, cache_path) {
        match load(cache_path) {
            Ok(dataset) => {
                tracing::info!(rows = dataset.row_count(), "loaded geo dataset from cache");
                return Ok(dataset);
            }
            Err(e) => tracing::warn!("geo cache invalid, rebuilding: {e}"),
        }
    }
    let dataset = GeoDataset::from_csv(csv_path)?;
    if let Err(e) = save(cache_path, &dataset) {
        tracing::warn!("failed to write geo cache: {e}");
    }
    tracing::info!(rows = dataset.row_count(), "built geo dataset from CSV");
    Ok(dataset)
}

fn is_cache_fresh(csv_path: &Path, cache_path: &Path) -> bool {
    let csv_mtime = mtime(csv_path);
    let cache_mtime = mtime(cache_path);
    match (csv_mtime, cache_mtime) {
        (Some(csv_t), Some(cache_t)) => cache_t > csv_t,
        _ => false,
    }
}

fn mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn save_then_load_preserves_lookup_behavior() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("networks.csv");
        let mut csv = File::create(&csv_path).unwrap();
        writeln!(csv, "network,asn,organization,country").unwrap();
        writeln!(csv, "10.0.0.0/8,AS1,Org1,US").unwrap();
        drop(csv);

        let dataset = GeoDataset::from_csv(&csv_path).unwrap();
        let cache_path = dir.path().join("networks.cache");
        save(&cache_path, &dataset).unwrap();
        let reloaded = load(&cache_path).unwrap();

        let ip = "10.1.2.3".parse().unwrap();
        assert_eq!(
            dataset.lookup(ip).map(|r| r.row.organization),
            reloaded.lookup(ip).map(|r| r.row.organization)
        );
    }
}
