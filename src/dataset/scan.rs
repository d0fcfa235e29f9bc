//! Parallel decode check over every image of a record store.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::dataset::decode::load_rgb;
use crate::dataset::manifest::RecordStore;

/// Outcome of scanning a record store
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub total: usize,
    pub decoded: usize,
    /// `(path, reason)` for every image that failed to decode
    pub failures: Vec<(PathBuf, String)>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Decode every image in `store` on the rayon pool
pub fn scan_images(store: &RecordStore, show_progress: bool) -> ScanReport {
    let total = store.len();
    let pb = if show_progress {
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut failures: Vec<(PathBuf, String)> = store
        .records()
        .par_iter()
        .filter_map(|record| {
            let result = load_rgb(&record.image_path);
            pb.inc(1);
            result
                .err()
                .map(|e| (record.image_path.clone(), e.to_string()))
        })
        .collect();
    failures.sort();

    pb.finish_and_clear();

    for (path, reason) in &failures {
        tracing::warn!("Unreadable image {}: {}", path.display(), reason);
    }

    ScanReport {
        total,
        decoded: total - failures.len(),
        failures,
    }
}
