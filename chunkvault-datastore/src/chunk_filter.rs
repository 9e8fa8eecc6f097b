//! Probabilistic digest membership filter.
//!
//! A plain bloom filter over chunk digests, used by the backup path to
//! skip store lookups for digests that were definitely never inserted.
//! False positives only cost an extra `contains` call; dedup
//! correctness never depends on this structure.

use std::hash::Hasher as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, format_err, Error};
use serde_json::json;
use siphasher::sip::SipHasher13;

use crate::digest::Digest;

/// Sidecar file name under the store root.
pub const FILTER_FILE_NAME: &str = "filter.json";

const LN2: f64 = std::f64::consts::LN_2;

pub struct ChunkFilter {
    k: u32,
    nbits: u64,
    bits: Vec<AtomicU64>,
    insertions: AtomicU64,
    expected_insertions: u64,
    target_fp_rate: f64,
}

fn filter_hashes(digest: &Digest) -> (u64, u64) {
    let mut h1 = SipHasher13::new_with_keys(0x6368_756e_6b76_6175, 0x6c74_0000_0000_0001);
    h1.write(digest.as_bytes());
    let mut h2 = SipHasher13::new_with_keys(0x6368_756e_6b76_6175, 0x6c74_0000_0000_0002);
    h2.write(digest.as_bytes());
    (h1.finish(), h2.finish())
}

impl ChunkFilter {
    /// Size the filter for `expected_insertions` distinct digests at
    /// the given target false-positive rate.
    pub fn new(expected_insertions: u64, target_fp_rate: f64) -> Self {
        assert!(
            target_fp_rate > 0.0 && target_fp_rate < 1.0,
            "false-positive rate must be in (0, 1)"
        );
        let n = expected_insertions.max(1) as f64;

        let nbits = ((-(n * target_fp_rate.ln()) / (LN2 * LN2)).ceil() as u64).max(64);
        let nbits = (nbits + 63) / 64 * 64;
        let k = (((nbits as f64 / n) * LN2).round() as u32).clamp(1, 16);

        let words = (nbits / 64) as usize;
        let mut bits = Vec::with_capacity(words);
        bits.resize_with(words, || AtomicU64::new(0));

        Self {
            k,
            nbits,
            bits,
            insertions: AtomicU64::new(0),
            expected_insertions,
            target_fp_rate,
        }
    }

    fn bit_positions(&self, digest: &Digest) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = filter_hashes(digest);
        let nbits = self.nbits;
        (0..self.k as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % nbits)
    }

    pub fn insert(&self, digest: &Digest) {
        for pos in self.bit_positions(digest) {
            let word = (pos / 64) as usize;
            let mask = 1u64 << (pos % 64);
            self.bits[word].fetch_or(mask, Ordering::Relaxed);
        }
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether `digest` may have been inserted. `false` is definite.
    pub fn might_contain(&self, digest: &Digest) -> bool {
        self.bit_positions(digest).all(|pos| {
            let word = (pos / 64) as usize;
            let mask = 1u64 << (pos % 64);
            self.bits[word].load(Ordering::Relaxed) & mask != 0
        })
    }

    pub fn insertions(&self) -> u64 {
        self.insertions.load(Ordering::Relaxed)
    }

    pub fn expected_insertions(&self) -> u64 {
        self.expected_insertions
    }

    /// Persist the filter as a JSON sidecar.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let words: Vec<u8> = self
            .bits
            .iter()
            .flat_map(|w| w.load(Ordering::Relaxed).to_le_bytes())
            .collect();

        let value = json!({
            "version": 1,
            "expected-insertions": self.expected_insertions,
            "target-fp-rate": self.target_fp_rate,
            "hashes": self.k,
            "bits": self.nbits,
            "insertions": self.insertions(),
            "data": base64::encode(&words),
        });

        let text = serde_json::to_string(&value)?;
        chunkvault_tools::fs::replace_file(path, text.as_bytes(), true)
    }

    /// Load the filter sidecar of `store`, falling back to a rebuild
    /// from the object tree when the sidecar is missing, unreadable or
    /// out of date (its insertion count no longer matches the store's
    /// distinct-digest count).
    pub fn load_or_rebuild(
        store: &crate::chunk_store::ChunkStore,
        expected_insertions: u64,
        target_fp_rate: f64,
    ) -> Result<Self, Error> {
        let path = store.filter_path();
        let distinct = store.stats().distinct_chunks;

        if path.exists() {
            match Self::load(&path) {
                Ok(filter) if filter.insertions() == distinct => return Ok(filter),
                Ok(_) => log::info!("membership filter out of date, rebuilding"),
                Err(err) => log::warn!("unable to load membership filter - {}", err),
            }
        }

        let filter = Self::new(expected_insertions.max(distinct), target_fp_rate);
        store.for_each_digest(|digest| {
            filter.insert(digest);
            Ok(())
        })?;
        Ok(filter)
    }

    /// Load a sidecar written by [`ChunkFilter::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| format_err!("unable to read filter {:?} - {}", path, err))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;

        if value["version"].as_u64() != Some(1) {
            bail!("unsupported filter version in {:?}", path);
        }

        let expected_insertions = value["expected-insertions"]
            .as_u64()
            .ok_or_else(|| format_err!("missing expected-insertions in {:?}", path))?;
        let target_fp_rate = value["target-fp-rate"]
            .as_f64()
            .ok_or_else(|| format_err!("missing target-fp-rate in {:?}", path))?;
        let k = value["hashes"]
            .as_u64()
            .ok_or_else(|| format_err!("missing hash count in {:?}", path))? as u32;
        let nbits = value["bits"]
            .as_u64()
            .ok_or_else(|| format_err!("missing bit count in {:?}", path))?;
        let insertions = value["insertions"].as_u64().unwrap_or(0);

        let words = base64::decode(
            value["data"]
                .as_str()
                .ok_or_else(|| format_err!("missing bit data in {:?}", path))?,
        )?;
        if words.len() as u64 * 8 != nbits {
            bail!("filter bit data has wrong length in {:?}", path);
        }

        let bits = words
            .chunks_exact(8)
            .map(|chunk| AtomicU64::new(u64::from_le_bytes(chunk.try_into().unwrap())))
            .collect();

        Ok(Self {
            k,
            nbits,
            bits,
            insertions: AtomicU64::new(insertions),
            expected_insertions,
            target_fp_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Hasher;

    fn digests(count: usize) -> Vec<Digest> {
        let hasher = Hasher::unkeyed();
        (0..count)
            .map(|i| hasher.hash_bytes(&(i as u64).to_le_bytes()))
            .collect()
    }

    #[test]
    fn no_false_negatives() {
        let filter = ChunkFilter::new(10_000, 0.01);
        let inserted = digests(10_000);

        for digest in &inserted {
            filter.insert(digest);
        }
        for digest in &inserted {
            assert!(filter.might_contain(digest));
        }
        assert_eq!(filter.insertions(), 10_000);
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let filter = ChunkFilter::new(10_000, 0.01);
        let all = digests(30_000);

        for digest in &all[..10_000] {
            filter.insert(digest);
        }

        let false_positives = all[10_000..]
            .iter()
            .filter(|d| filter.might_contain(d))
            .count();

        // target 1%, allow generous slack over 20k probes
        assert!(
            false_positives < 600,
            "false positive count too high: {}",
            false_positives
        );
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FILTER_FILE_NAME);

        let filter = ChunkFilter::new(1000, 0.02);
        let inserted = digests(500);
        for digest in &inserted {
            filter.insert(digest);
        }
        filter.save(&path).unwrap();

        let loaded = ChunkFilter::load(&path).unwrap();
        assert_eq!(loaded.insertions(), 500);
        for digest in &inserted {
            assert!(loaded.might_contain(digest));
        }
    }
}
