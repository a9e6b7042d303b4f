//! Magnitude computation for IQ samples
//!
//! RTL-SDR outputs 8-bit unsigned IQ samples (I, Q pairs) centered on 127.5.
//! Magnitude mode collapses every pair into a single amplitude byte.

use crate::error::{Result, StreamError};

/// Scale that maps the doubled magnitude back into 0..=255
const MAGNITUDE_SCALE: f64 = 0.71;
/// Magnitude of the smallest doubled offset (|±1, ±1|), removed so the center maps to zero
const MAGNITUDE_FLOOR: f64 = 1.4142;

/// Pre-computed magnitude lookup table for fast IQ → magnitude conversion
/// Index: (I << 8) | Q where I, Q are 0-255
pub struct MagnitudeTable {
    table: Box<[u8]>,
}

impl MagnitudeTable {
    /// Build the full 256×256 table.
    ///
    /// Both channels are centered and doubled (`2·x − 255`) so the true center
    /// 127.5 lands on an integer, then `sqrt(ci² + cq²) · 0.71 − 1.4142` is
    /// rounded and clamped into a byte.
    pub fn new() -> Self {
        let mut table = vec![0u8; 256 * 256];

        for i in 0..256i32 {
            for q in 0..256i32 {
                let ci = (2 * i - 255) as f64;
                let cq = (2 * q - 255) as f64;

                let raw = (ci * ci + cq * cq).sqrt() * MAGNITUDE_SCALE - MAGNITUDE_FLOOR;
                table[((i as usize) << 8) | q as usize] = raw.round().clamp(0.0, 255.0) as u8;
            }
        }

        Self {
            table: table.into_boxed_slice(),
        }
    }

    /// Convert IQ sample pair to magnitude
    #[inline(always)]
    pub fn magnitude(&self, i: u8, q: u8) -> u8 {
        self.table[((i as usize) << 8) | (q as usize)]
    }

    /// Convert an interleaved IQ buffer into one magnitude byte per pair.
    ///
    /// The output is exactly half the input length. Odd-length input has a
    /// dangling channel byte and is rejected.
    pub fn apply(&self, iq_data: &[u8]) -> Result<Vec<u8>> {
        if iq_data.len() % 2 != 0 {
            return Err(StreamError::Argument(format!(
                "interleaved IQ buffer has odd length {}",
                iq_data.len()
            )));
        }

        let mut output = Vec::new();
        output
            .try_reserve_exact(iq_data.len() / 2)
            .map_err(|_| StreamError::Allocation)?;
        output.extend(
            iq_data
                .chunks_exact(2)
                .map(|pair| self.magnitude(pair[0], pair[1])),
        );
        Ok(output)
    }
}

impl Default for MagnitudeTable {
    fn default() -> Self {
        Self::new()
    }
}
