//! Process-wide cache counters.
//!
//! Plain atomics behind an `Arc`; the daemon increments the request-level
//! counters, the blob backend and compactor fill in the rest. Persisting a
//! snapshot to disk is the embedding process's business, not ours.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-tier blob counters, kept separately for organic traffic and for
/// gets issued by the compactor.
#[derive(Debug, Default, Serialize)]
pub struct TierMetrics {
    #[serde(rename = "Get.ByLocal")]
    pub get_by_local: AtomicU64,
    #[serde(rename = "Get.ByBundle")]
    pub get_by_bundle: AtomicU64,
    #[serde(rename = "Get.ByDownload")]
    pub get_by_download: AtomicU64,
    #[serde(rename = "Download.Bytes")]
    pub download_bytes: AtomicU64,
    #[serde(rename = "Uploaded.Files")]
    pub uploaded_files: AtomicU64,
    #[serde(rename = "Uploaded.Bytes")]
    pub uploaded_bytes: AtomicU64,
    /// Entries copied out of a bundle onto the local disk, so that later
    /// gets hit the local tier.
    #[serde(rename = "Bundle.ToLocal.Files")]
    pub bundle_to_local_files: AtomicU64,
    #[serde(rename = "Bundle.ToLocal.Bytes")]
    pub bundle_to_local_bytes: AtomicU64,
}

impl TierMetrics {
    fn clear(&self) {
        self.get_by_local.store(0, Ordering::Relaxed);
        self.get_by_bundle.store(0, Ordering::Relaxed);
        self.get_by_download.store(0, Ordering::Relaxed);
        self.download_bytes.store(0, Ordering::Relaxed);
        self.uploaded_files.store(0, Ordering::Relaxed);
        self.uploaded_bytes.store(0, Ordering::Relaxed);
        self.bundle_to_local_files.store(0, Ordering::Relaxed);
        self.bundle_to_local_bytes.store(0, Ordering::Relaxed);
    }
}

/// Compaction-job counters. One keyspace run counts as one job.
#[derive(Debug, Default, Serialize)]
pub struct CompactorMetrics {
    #[serde(rename = "Total")]
    pub total: AtomicU64,
    #[serde(rename = "Success")]
    pub success: AtomicU64,
    #[serde(rename = "Skip")]
    pub skip: AtomicU64,
    #[serde(rename = "Fail")]
    pub fail: AtomicU64,
    #[serde(rename = "SmallBlob.Add.Total")]
    pub add_files: AtomicU64,
    #[serde(rename = "SmallBlob.Add.TotalBytes")]
    pub add_bytes: AtomicU64,
    #[serde(rename = "SmallBlob.Remove.Total")]
    pub remove_files: AtomicU64,
    #[serde(rename = "SmallBlob.SkipFor.IOFailure")]
    pub skip_io_failure: AtomicU64,
    #[serde(rename = "SmallBlob.SkipFor.Corrupted")]
    pub skip_corrupted: AtomicU64,
    #[serde(rename = "SmallBlob.SkipFor.Missing")]
    pub skip_missing: AtomicU64,
    #[serde(rename = "SmallBlob.SkipFor.Other")]
    pub skip_other: AtomicU64,
}

impl CompactorMetrics {
    fn clear(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.skip.store(0, Ordering::Relaxed);
        self.fail.store(0, Ordering::Relaxed);
        self.add_files.store(0, Ordering::Relaxed);
        self.add_bytes.store(0, Ordering::Relaxed);
        self.remove_files.store(0, Ordering::Relaxed);
        self.skip_io_failure.store(0, Ordering::Relaxed);
        self.skip_corrupted.store(0, Ordering::Relaxed);
        self.skip_missing.store(0, Ordering::Relaxed);
        self.skip_other.store(0, Ordering::Relaxed);
    }
}

/// Bundle-store sync counters.
#[derive(Debug, Default, Serialize)]
pub struct BundleStoreMetrics {
    #[serde(rename = "Download.Total")]
    pub download_total: AtomicU64,
    #[serde(rename = "Download.Fail")]
    pub download_fail: AtomicU64,
    #[serde(rename = "Download.Skip")]
    pub download_skip: AtomicU64,
    #[serde(rename = "Download.Success.Bytes")]
    pub download_bytes: AtomicU64,
    #[serde(rename = "Load.Total")]
    pub load_total: AtomicU64,
    #[serde(rename = "Load.Fail")]
    pub load_fail: AtomicU64,
}

impl BundleStoreMetrics {
    fn clear(&self) {
        self.download_total.store(0, Ordering::Relaxed);
        self.download_fail.store(0, Ordering::Relaxed);
        self.download_skip.store(0, Ordering::Relaxed);
        self.download_bytes.store(0, Ordering::Relaxed);
        self.load_total.store(0, Ordering::Relaxed);
        self.load_fail.store(0, Ordering::Relaxed);
    }
}

/// All counters for one cache process.
#[derive(Debug, Default, Serialize)]
pub struct Metrics {
    #[serde(rename = "Get.Total")]
    pub get_total: AtomicU64,
    #[serde(rename = "Get.Hit")]
    pub get_hit: AtomicU64,
    #[serde(rename = "Get.Miss")]
    pub get_miss: AtomicU64,
    #[serde(rename = "Get.Error")]
    pub get_error: AtomicU64,
    #[serde(rename = "Put.Total")]
    pub put_total: AtomicU64,
    #[serde(rename = "Put.Error")]
    pub put_error: AtomicU64,
    #[serde(rename = "Blob.FromOrganic")]
    pub blob_organic: TierMetrics,
    #[serde(rename = "Blob.FromCompaction")]
    pub blob_compaction: TierMetrics,
    #[serde(rename = "Blob.Compactor")]
    pub compactor: CompactorMetrics,
    #[serde(rename = "Blob.BundleStore")]
    pub bundle_store: BundleStoreMetrics,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    /// The tier counters a blob operation should account against.
    pub fn tier(&self, in_compaction: bool) -> &TierMetrics {
        if in_compaction {
            &self.blob_compaction
        } else {
            &self.blob_organic
        }
    }

    /// Reset every counter to zero.
    pub fn clear(&self) {
        self.get_total.store(0, Ordering::Relaxed);
        self.get_hit.store(0, Ordering::Relaxed);
        self.get_miss.store(0, Ordering::Relaxed);
        self.get_error.store(0, Ordering::Relaxed);
        self.put_total.store(0, Ordering::Relaxed);
        self.put_error.store(0, Ordering::Relaxed);
        self.blob_organic.clear();
        self.blob_compaction.clear();
        self.compactor.clear();
        self.bundle_store.clear();
    }
}

/// Relaxed-increment helper; every counter here is a statistic, not a
/// synchronization point.
pub trait CounterExt {
    fn inc(&self);
    fn add(&self, n: u64);
    fn get(&self) -> u64;
}

impl CounterExt for AtomicU64 {
    fn inc(&self) {
        self.fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, n: u64) {
        self.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_selection() {
        let m = Metrics::new();
        m.tier(false).get_by_local.inc();
        m.tier(true).get_by_local.inc();
        m.tier(true).get_by_local.inc();
        assert_eq!(m.blob_organic.get_by_local.get(), 1);
        assert_eq!(m.blob_compaction.get_by_local.get(), 2);
    }

    #[test]
    fn test_clear_resets_everything() {
        let m = Metrics::new();
        m.get_total.add(5);
        m.compactor.skip_corrupted.inc();
        m.bundle_store.download_bytes.add(100);
        m.clear();
        assert_eq!(m.get_total.get(), 0);
        assert_eq!(m.compactor.skip_corrupted.get(), 0);
        assert_eq!(m.bundle_store.download_bytes.get(), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = Metrics::new();
        m.get_hit.inc();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["Get.Hit"], 1);
        assert_eq!(json["Blob.FromOrganic"]["Get.ByLocal"], 0);
    }
}
