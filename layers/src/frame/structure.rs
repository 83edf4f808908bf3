//! TDD Frame Structure
//!
//! Frame, symbol and guard durations plus the per-phase symbol budget of the
//! DL and UL sub-frames

use crate::LayerError;
use common::utils::time;
use std::time::Duration;
use tracing::debug;

/// Timing and grid parameters of the TDD frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameParameters {
    /// Frame duration
    pub frame_duration: Duration,
    /// OFDMA symbol duration including cyclic prefix
    pub symbol_duration: Duration,
    /// Number of sub-channels
    pub sub_channels: u16,
    /// Data sub-carriers per sub-channel
    pub data_subcarriers: u16,
    /// Transmit/receive transition gap
    pub ttg: Duration,
    /// Receive/transmit transition gap
    pub rtg: Duration,
    /// Frame head (preamble and FCH)
    pub frame_head_symbols: u32,
    /// DL-MAP broadcast
    pub dl_map_symbols: u32,
    /// UL-MAP broadcast
    pub ul_map_symbols: u32,
    /// DL data phase
    pub dl_data_symbols: u32,
    /// UL data phase
    pub ul_data_symbols: u32,
    /// Bandwidth request contention slots
    pub bw_request_symbols: u32,
    /// Ranging contention slots
    pub ranging_symbols: u32,
}

impl Default for FrameParameters {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(5),
            symbol_duration: Duration::from_micros(100),
            sub_channels: 96,
            data_subcarriers: 16,
            ttg: Duration::from_micros(100),
            rtg: Duration::from_micros(200),
            frame_head_symbols: 1,
            dl_map_symbols: 1,
            ul_map_symbols: 1,
            dl_data_symbols: 21,
            ul_data_symbols: 21,
            bw_request_symbols: 1,
            ranging_symbols: 1,
        }
    }
}

impl FrameParameters {
    /// Check the values that do not depend on the timeline layout
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.symbol_duration.is_zero() {
            return Err(LayerError::InvalidConfiguration("symbol duration must be positive".into()));
        }
        if self.frame_duration < self.symbol_duration {
            return Err(LayerError::InvalidConfiguration(
                format!("frame duration {:?} shorter than one symbol", self.frame_duration)
            ));
        }
        if self.sub_channels == 0 || self.data_subcarriers == 0 {
            return Err(LayerError::InvalidConfiguration(
                "sub-channel and data sub-carrier counts must be positive".into()
            ));
        }
        if self.dl_data_symbols == 0 || self.ul_data_symbols == 0 {
            return Err(LayerError::InvalidConfiguration("data phases need at least one symbol".into()));
        }

        debug!("Frame parameters: frame={:?}, symbol={:?}, DL={} symbols, UL={} symbols, {} sub-channels",
               self.frame_duration, self.symbol_duration,
               self.dl_symbols(), self.ul_symbols(), self.sub_channels);
        Ok(())
    }

    /// Whole symbols that fit into one frame
    pub fn symbols_per_frame(&self) -> u32 {
        time::whole_symbols(self.frame_duration, self.symbol_duration)
    }

    /// Symbols of the DL sub-frame (head, maps and DL data)
    pub fn dl_symbols(&self) -> u32 {
        self.frame_head_symbols + self.dl_map_symbols + self.ul_map_symbols + self.dl_data_symbols
    }

    /// Symbols of the UL sub-frame (UL data and contention slots)
    pub fn ul_symbols(&self) -> u32 {
        self.ul_data_symbols + self.bw_request_symbols + self.ranging_symbols
    }

    /// Duration of a number of symbols
    pub fn symbols(&self, count: u32) -> Duration {
        time::symbols_duration(count, self.symbol_duration)
    }

    /// Sum of all declared phase and gap durations
    pub fn declared_duration(&self) -> Duration {
        self.symbols(self.dl_symbols()) + self.ttg + self.symbols(self.ul_symbols()) + self.rtg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters_fill_frame() {
        let params = FrameParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.symbols_per_frame(), 50);
        assert_eq!(params.dl_symbols(), 24);
        assert_eq!(params.ul_symbols(), 23);
        assert_eq!(params.declared_duration(), params.frame_duration);
    }

    #[test]
    fn test_invalid_parameters() {
        let params = FrameParameters { symbol_duration: Duration::ZERO, ..Default::default() };
        assert!(params.validate().is_err());

        let params = FrameParameters { sub_channels: 0, ..Default::default() };
        assert!(params.validate().is_err());

        let params = FrameParameters { ul_data_symbols: 0, ..Default::default() };
        assert!(params.validate().is_err());
    }
}
