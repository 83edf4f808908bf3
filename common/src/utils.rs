//! Common Utilities
//!
//! Provides helper functions used across the MAC engine

use tracing::trace;

/// Integer division rounding up
pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    if divisor == 0 {
        return 0;
    }
    (value + divisor - 1) / divisor
}

/// Linear interpolation between two samples
pub fn lerp(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Number of bits carried by one sub-channel during one symbol
pub fn bits_per_resource_unit(modulation_bits: u8, code_rate: f64, data_subcarriers: u16) -> u32 {
    let bits = (modulation_bits as f64 * code_rate * data_subcarriers as f64).floor() as u32;

    trace!("{} bits per resource unit ({} bit symbols, rate {:.4}, {} subcarriers)",
           bits, modulation_bits, code_rate, data_subcarriers);

    bits
}

/// Time utilities for frame/symbol calculations
pub mod time {
    use std::time::Duration;

    /// Number of whole symbols that fit into a duration
    pub fn whole_symbols(duration: Duration, symbol: Duration) -> u32 {
        if symbol.is_zero() {
            return 0;
        }
        (duration.as_nanos() / symbol.as_nanos()) as u32
    }

    /// Number of symbols needed to cover a duration, rounding up
    pub fn symbols_covering(duration: Duration, symbol: Duration) -> u32 {
        if symbol.is_zero() {
            return 0;
        }
        let symbol_ns = symbol.as_nanos();
        ((duration.as_nanos() + symbol_ns - 1) / symbol_ns) as u32
    }

    /// Duration of a number of symbols
    pub fn symbols_duration(symbols: u32, symbol: Duration) -> Duration {
        symbol * symbols
    }
}
