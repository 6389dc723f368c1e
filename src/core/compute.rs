//! Computational helpers.

/// Calculate a percentage. Returns 0% when `total` is 0.
pub fn perc(current: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }

    current as f64 * 100.0 / total as f64
}
