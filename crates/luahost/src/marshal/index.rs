// Zero-based native indices vs one-based script indices

/// Sentinel produced for script indices that do not map to a native index.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Converts a script (1-based) index to a native (0-based) one. Values `<= 0`
/// map to `INVALID_INDEX`; fractional values truncate.
pub fn array_index_from_number(f: f64) -> u32 {
    if f <= 0.0 || f.is_nan() {
        INVALID_INDEX
    } else {
        (f - 1.0) as u32
    }
}

pub fn array_index_to_number(index: u32) -> f64 {
    index as f64 + 1.0
}
