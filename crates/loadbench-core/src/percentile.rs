use std::collections::BTreeMap;
use std::time::Duration;

/// Nearest-rank percentile over an ascending-sorted slice: the element at
/// index `floor((n - 1) * p / 100)`. `None` for an empty slice.
pub fn percentile_sorted(sorted: &[Duration], p: u8) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let p = usize::from(p.min(100));
    let idx = (sorted.len() - 1) * p / 100;
    Some(sorted[idx])
}

/// Nearest-rank percentile over unordered samples.
pub fn percentile(samples: &[Duration], p: u8) -> Option<Duration> {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    percentile_sorted(&sorted, p)
}

/// Every requested percentile, sorting the samples once. Empty when there
/// are no samples.
pub fn percentiles(samples: &[Duration], requested: &[u8]) -> BTreeMap<u8, Duration> {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    requested
        .iter()
        .filter_map(|&p| percentile_sorted(&sorted, p).map(|v| (p, v)))
        .collect()
}
