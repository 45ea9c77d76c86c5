//! IBLT sizing parameters.
//!
//! Small tables need disproportionately more space per expected difference to
//! keep the decode failure rate low; the pairs below were chosen from decode
//! rate measurements at each size class.

/// Returns `(space_overhead, n_hash)` for the expected number of recoverable
/// differences.
pub fn optimal_params(expected_items: u64) -> (f64, u8) {
    match expected_items {
        0..=1 => (15.0, 3),
        2 => (12.0, 3),
        3..=4 => (8.0, 3),
        5..=8 => (6.0, 3),
        9..=16 => (4.0, 3),
        17..=32 => (3.0, 3),
        33..=64 => (2.5, 3),
        65..=128 => (2.0, 3),
        129..=256 => (1.8, 4),
        257..=512 => (1.7, 4),
        513..=1024 => (1.6, 4),
        _ => (1.5, 4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_shrinks_with_size() {
        let mut last = f64::MAX;
        for expected in [1u64, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 4096] {
            let (overhead, n_hash) = optimal_params(expected);
            assert!(overhead <= last);
            assert!(overhead >= 1.5);
            assert!(n_hash == 3 || n_hash == 4);
            last = overhead;
        }
    }
}
