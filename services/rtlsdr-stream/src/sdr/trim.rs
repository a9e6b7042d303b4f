//! Quiet-sample trimming
//!
//! Drops the leading and trailing runs of samples that stay inside the noise
//! margin so only the signal-bearing span of a packet is forwarded. A packet
//! that is quiet throughout produces no output at all.

use std::ops::Range;

/// Midpoint of an unsigned 8-bit IQ channel
const CHANNEL_CENTER: i32 = 127;

/// Width of one sample in the buffer being trimmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    /// One magnitude byte per sample
    Magnitude,
    /// Interleaved I/Q byte pair per sample
    Interleaved,
}

impl SampleWidth {
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::Magnitude => 1,
            SampleWidth::Interleaved => 2,
        }
    }

    /// Whether the sample starting at `sample[0]` carries signal above `margin`
    #[inline]
    fn is_loud(self, sample: &[u8], margin: u32) -> bool {
        let margin = margin.min(i32::MAX as u32) as i32;
        match self {
            SampleWidth::Magnitude => i32::from(sample[0]) > margin,
            SampleWidth::Interleaved => sample[..2].iter().any(|&b| {
                let b = i32::from(b);
                b < CHANNEL_CENTER - margin || b > CHANNEL_CENTER + margin
            }),
        }
    }
}

/// Locate the byte range spanning the first through the last loud sample.
///
/// Returns `None` when no complete sample exceeds `margin`. A trailing partial
/// sample is never examined nor included.
pub fn loud_span(buffer: &[u8], width: SampleWidth, margin: u32) -> Option<Range<usize>> {
    let w = width.bytes();
    let samples = buffer.len() / w;
    let sample = |k: usize| &buffer[k * w..(k + 1) * w];

    let first = (0..samples).find(|&k| width.is_loud(sample(k), margin))?;

    // Backward scan never revisits anything at or before `first`
    let last = (first + 1..samples)
        .rev()
        .find(|&k| width.is_loud(sample(k), margin))
        .unwrap_or(first);

    Some(first * w..(last + 1) * w)
}

/// Trim `buffer` down to its loud span, or `None` to drop it entirely.
pub fn trim(buffer: &[u8], width: SampleWidth, margin: u32) -> Option<&[u8]> {
    loud_span(buffer, width, margin).map(|span| &buffer[span])
}
