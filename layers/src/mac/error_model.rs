//! Error Rate Model
//!
//! Predicts the packet error rate of a transmission from the MCS in use and the
//! measured CIR. Symbol error rates come from sampled CIR tables, one per
//! modulation and reference code rate.

use super::link_quality::{Mcs, Modulation};
use crate::LayerError;
use common::utils::{ceil_div, lerp};
use tracing::{debug, trace};

/// Packet length used when none is given, in bits
pub const DEFAULT_PACKET_BITS: u64 = 1056;

/// Number of samples of the built-in tables (CIR 0..=22 dB)
const TABLE_SAMPLES: usize = 23;

/// Predicts symbol and packet error rates
pub trait ErrorRateModel: Send + Sync {
    /// Symbol error rate of an MCS at a CIR in dB
    fn symbol_error_rate(&self, mcs: &Mcs, cir: f64) -> f64;

    /// Probability that a packet of `packet_bits` bits is lost
    fn packet_error_rate(&self, mcs: &Mcs, cir: f64, packet_bits: u64) -> f64 {
        if packet_bits == 0 {
            return 0.0;
        }
        let ser = self.symbol_error_rate(mcs, cir).clamp(0.0, 1.0);
        let symbols = ceil_div(packet_bits, mcs.bits_per_symbol() as u64);
        let per = 1.0 - (1.0 - ser).powf(symbols as f64);

        trace!("{} at CIR {:.2} dB: SER {:.3e}, {} symbols, PER {:.3e}", mcs, cir, ser, symbols, per);
        per.clamp(0.0, 1.0)
    }
}

/// Sampled CIR to SER curve
#[derive(Debug, Clone)]
pub struct SerTable {
    samples: Vec<(f64, f64)>,
}

impl SerTable {
    /// Build a table from `(cir, ser)` samples with ascending CIR
    pub fn new(samples: Vec<(f64, f64)>) -> Result<Self, LayerError> {
        if samples.is_empty() {
            return Err(LayerError::ConfigurationError("SER table has no samples".into()));
        }
        for window in samples.windows(2) {
            let ((cir_a, ser_a), (cir_b, ser_b)) = (window[0], window[1]);
            if cir_b <= cir_a {
                return Err(LayerError::ConfigurationError(format!(
                    "SER table CIR not ascending at {} dB", cir_b
                )));
            }
            if ser_b > ser_a {
                return Err(LayerError::ConfigurationError(format!(
                    "SER table increases at {} dB", cir_b
                )));
            }
        }
        if samples.iter().any(|&(_, ser)| !(0.0..=1.0).contains(&ser)) {
            return Err(LayerError::ConfigurationError("SER outside [0, 1]".into()));
        }
        Ok(Self { samples })
    }

    /// Built-in table sampled at integer CIR from 0 dB, padded with SER 0
    fn from_integer_samples(leading: &[f64]) -> Result<Self, LayerError> {
        let samples = (0..TABLE_SAMPLES)
            .map(|cir| (cir as f64, leading.get(cir).copied().unwrap_or(0.0)))
            .collect();
        Self::new(samples)
    }

    /// SER at a CIR; 1 below the table, 0 above it, interpolated in between
    pub fn lookup(&self, cir: f64) -> f64 {
        let (first_cir, _) = self.samples[0];
        let (last_cir, last_ser) = self.samples[self.samples.len() - 1];
        if cir.is_nan() || cir < first_cir {
            return 1.0;
        }
        if cir > last_cir {
            return 0.0;
        }
        if cir == last_cir {
            return last_ser;
        }

        let upper = self.samples.partition_point(|&(sample_cir, _)| sample_cir <= cir);
        let (x0, y0) = self.samples[upper - 1];
        match self.samples.get(upper) {
            Some(&(x1, y1)) => lerp(x0, y0, x1, y1, cir),
            None => y0,
        }
    }
}

/// Error model over per-modulation reference tables
#[derive(Debug, Clone)]
pub struct TableErrorModel {
    /// `(modulation, reference code rate, table)`
    tables: Vec<(Modulation, f64, SerTable)>,
}

impl TableErrorModel {
    /// Empty model; every lookup yields SER 1
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    /// Add a reference table
    pub fn with_table(mut self, modulation: Modulation, code_rate: f64, table: SerTable) -> Self {
        self.tables.push((modulation, code_rate, table));
        self
    }

    /// Reference tables for BPSK, QPSK, QAM16 and QAM64
    pub fn wimax() -> Result<Self, LayerError> {
        let model = Self::new()
            .with_table(Modulation::Bpsk, 0.5, SerTable::from_integer_samples(&[
                0.17284, 0.1, 0.0354839, 0.0124521, 0.00363386, 0.000665585, 0.000124797, 4.15991e-05,
            ])?)
            .with_table(Modulation::Qpsk, 0.5, SerTable::from_integer_samples(&[
                1.0, 1.0, 1.0, 0.416667, 0.0555556, 0.00172018, 8.31878e-05,
            ])?)
            .with_table(Modulation::Qpsk, 0.75, SerTable::from_integer_samples(&[
                1.0, 1.0, 1.0, 1.0, 1.0, 0.684211, 0.333333, 0.048583, 0.00594227, 0.00146928,
                0.000118229, 1.97048e-05,
            ])?)
            .with_table(Modulation::Qam16, 0.5, SerTable::from_integer_samples(&[
                1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.88, 0.44, 0.0116129, 1.99601e-05,
            ])?)
            .with_table(Modulation::Qam16, 0.75, SerTable::from_integer_samples(&[
                1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.763158, 0.473684, 0.0488722,
                0.00615901, 0.000856793, 0.000177277, 5.90923e-05,
            ])?)
            .with_table(Modulation::Qam64, 2.0 / 3.0, SerTable::from_integer_samples(&[
                1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.980392,
                0.921569, 0.588235, 0.117647, 0.0154799, 0.000628457, 0.000195687, 1.95687e-05,
            ])?)
            .with_table(Modulation::Qam64, 0.75, SerTable::from_integer_samples(&[
                1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.982759,
                0.862069, 0.62069, 0.189655, 0.00907441, 0.000676133,
            ])?);

        debug!("Error model with {} SER tables", model.tables.len());
        Ok(model)
    }

    /// Table of the MCS's modulation with the smallest reference rate not
    /// below the MCS's rate, else the highest-rate table of that modulation
    fn table_for(&self, mcs: &Mcs) -> Option<&SerTable> {
        let same_modulation = || self.tables.iter().filter(|(modulation, _, _)| *modulation == mcs.modulation);

        same_modulation()
            .filter(|(_, rate, _)| *rate >= mcs.code_rate)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .or_else(|| same_modulation().max_by(|a, b| a.1.total_cmp(&b.1)))
            .map(|(_, _, table)| table)
    }
}

impl Default for TableErrorModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorRateModel for TableErrorModel {
    fn symbol_error_rate(&self, mcs: &Mcs, cir: f64) -> f64 {
        match self.table_for(mcs) {
            Some(table) => table.lookup(cir),
            None => {
                trace!("No SER table for {}", mcs);
                1.0
            }
        }
    }
}
