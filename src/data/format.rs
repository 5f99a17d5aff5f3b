//! Text formatting for result files.
//!
//! Complex values are written as `<re><sign><im>i` (e.g. `0.5-0.25i`) and
//! never in scientific notation; frequencies as whole hertz.

use num_complex::Complex64;

/// `0.5-0.25i`, `1+0i`.
pub fn format_complex(value: Complex64) -> String {
    format!("{}{:+}i", value.re, value.im)
}

/// Whole hertz, truncated toward negative infinity.
pub fn format_frequency(hz: f64) -> String {
    format!("{}", hz.floor())
}

/// Angle cell of a sweep row.
pub fn format_angle(degrees: f64) -> String {
    format!("{}", degrees)
}

/// One field per frequency, in whole hertz.
pub fn frequency_fields(frequencies: &[f64]) -> Vec<String> {
    frequencies.iter().copied().map(format_frequency).collect()
}

/// One field per sample in `re+imi` form.
pub fn complex_fields(values: &[Complex64]) -> Vec<String> {
    values.iter().copied().map(format_complex).collect()
}
