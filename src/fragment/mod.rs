//! Fragment wire format and builder
//!
//! Fragment structure (little-endian, fixed 24-byte header + payload):
//! ```text
//! ┌────────┬──────┬───────────────────────────────────────────┐
//! │ Offset │ Size │ Field                                     │
//! ├────────┼──────┼───────────────────────────────────────────┤
//! │      0 │    8 │ time_ns: i64, first sample of fragment    │
//! │      8 │    4 │ samples_this_fragment: i32                │
//! │     12 │    2 │ sample_width_ns: i16                      │
//! │     14 │    2 │ channel: i16, global channel id           │
//! │     16 │    4 │ samples_in_pulse: i32                     │
//! │     20 │    2 │ fragment_index: i16, 0-based within pulse │
//! │     22 │    2 │ baseline: i16                             │
//! │     24 │    P │ payload: i16 samples, zero-padded         │
//! └────────┴──────┴───────────────────────────────────────────┘
//! ```
//!
//! Every fragment of a run has the same total size `24 + P`, so downstream
//! readers can split a decompressed chunk file without a length prefix.

use thiserror::Error;

/// Fixed header size in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 24;

/// Default payload size in bytes (110 samples)
pub const DEFAULT_FRAGMENT_PAYLOAD_BYTES: usize = 110 * 2;

/// Synthetic channel id stamped on artificial deadtime fragments
pub const ARTIFICIAL_DEADTIME_CHANNEL: i16 = 790;

/// Fragment format errors
#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("Data too short for fragment header: {0} bytes")]
    TooShort(usize),
}

/// Decoded fragment header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Absolute time of the first sample in this fragment, nanoseconds
    pub time_ns: i64,
    pub samples_this_fragment: i32,
    pub sample_width_ns: i16,
    /// Global channel id
    pub channel: i16,
    /// Total pulse length, shared across the pulse's fragments
    pub samples_in_pulse: i32,
    pub fragment_index: i16,
    pub baseline: i16,
}

impl FragmentHeader {
    /// Append the 24 header bytes to a buffer
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.time_ns.to_le_bytes());
        buf.extend_from_slice(&self.samples_this_fragment.to_le_bytes());
        buf.extend_from_slice(&self.sample_width_ns.to_le_bytes());
        buf.extend_from_slice(&self.channel.to_le_bytes());
        buf.extend_from_slice(&self.samples_in_pulse.to_le_bytes());
        buf.extend_from_slice(&self.fragment_index.to_le_bytes());
        buf.extend_from_slice(&self.baseline.to_le_bytes());
    }

    /// Decode a header from the front of a fragment
    pub fn from_bytes(data: &[u8]) -> Result<Self, FragmentError> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::TooShort(data.len()));
        }

        Ok(Self {
            time_ns: i64::from_le_bytes(data[0..8].try_into().unwrap()),
            samples_this_fragment: i32::from_le_bytes(data[8..12].try_into().unwrap()),
            sample_width_ns: i16::from_le_bytes(data[12..14].try_into().unwrap()),
            channel: i16::from_le_bytes(data[14..16].try_into().unwrap()),
            samples_in_pulse: i32::from_le_bytes(data[16..20].try_into().unwrap()),
            fragment_index: i16::from_le_bytes(data[20..22].try_into().unwrap()),
            baseline: i16::from_le_bytes(data[22..24].try_into().unwrap()),
        })
    }
}

/// Decode the payload samples of a fragment (header's `samples_this_fragment`)
pub fn fragment_samples(data: &[u8]) -> Result<Vec<u16>, FragmentError> {
    let header = FragmentHeader::from_bytes(data)?;
    let n = header.samples_this_fragment.max(0) as usize;
    if data.len() < FRAGMENT_HEADER_SIZE + n * 2 {
        return Err(FragmentError::TooShort(data.len()));
    }
    Ok((0..n)
        .map(|i| {
            let off = FRAGMENT_HEADER_SIZE + i * 2;
            u16::from_le_bytes([data[off], data[off + 1]])
        })
        .collect())
}

/// Zero-copy u16 view over the little-endian u32 payload words of a pulse
///
/// Each word carries two samples, low half first. The view never copies;
/// fragments read samples straight out of the packet buffer.
#[derive(Debug, Clone, Copy)]
pub struct SampleView<'a> {
    words: &'a [u32],
}

impl<'a> SampleView<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words }
    }

    /// Number of samples (two per word)
    pub fn len(&self) -> usize {
        self.words.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Sample at index `i`
    #[inline]
    pub fn get(&self, i: usize) -> u16 {
        let word = self.words[i / 2];
        if i % 2 == 0 {
            (word & 0xFFFF) as u16
        } else {
            (word >> 16) as u16
        }
    }
}

/// One decoded waveform pulse, borrowed from its packet
#[derive(Debug, Clone, Copy)]
pub struct Pulse<'a> {
    /// Global channel id
    pub channel: i16,
    /// Absolute time of the first sample, nanoseconds
    pub time_ns: i64,
    pub sample_width_ns: i16,
    pub baseline: i16,
    pub samples: SampleView<'a>,
}

/// Builds fixed-size fragments from pulses
#[derive(Debug, Clone)]
pub struct FragmentBuilder {
    payload_bytes: usize,
}

impl Default for FragmentBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_FRAGMENT_PAYLOAD_BYTES)
    }
}

impl FragmentBuilder {
    pub fn new(payload_bytes: usize) -> Self {
        Self { payload_bytes }
    }

    /// Samples that fit in one fragment payload
    pub fn fragment_samples(&self) -> usize {
        self.payload_bytes / 2
    }

    /// Total on-wire fragment size
    pub fn fragment_size(&self) -> usize {
        FRAGMENT_HEADER_SIZE + self.payload_bytes
    }

    /// Iterate the fragments of a pulse as `(bytes, time_ns)` pairs
    pub fn pulse_fragments<'a, 'b>(&'a self, pulse: &'a Pulse<'b>) -> PulseFragments<'a, 'b> {
        PulseFragments {
            builder: self,
            pulse,
            index_in_pulse: 0,
            fragment_index: 0,
        }
    }

    /// Build an artificial deadtime fragment: a full-length, zero-payload
    /// fragment on the synthetic channel marking a window where real data
    /// could not be recovered.
    pub fn artificial_deadtime(&self, time_ns: i64) -> Vec<u8> {
        let length = self.fragment_samples() as i32;
        let header = FragmentHeader {
            time_ns,
            samples_this_fragment: length,
            sample_width_ns: 0,
            channel: ARTIFICIAL_DEADTIME_CHANNEL,
            samples_in_pulse: length,
            fragment_index: 0,
            baseline: 0,
        };

        let mut bytes = Vec::with_capacity(self.fragment_size());
        header.write_to(&mut bytes);
        bytes.resize(self.fragment_size(), 0);
        bytes
    }
}

/// Iterator over the fragments of one pulse
pub struct PulseFragments<'a, 'b> {
    builder: &'a FragmentBuilder,
    pulse: &'a Pulse<'b>,
    index_in_pulse: usize,
    fragment_index: i16,
}

impl Iterator for PulseFragments<'_, '_> {
    /// Serialized fragment and its absolute timestamp
    type Item = (Vec<u8>, i64);

    fn next(&mut self) -> Option<Self::Item> {
        let samples_in_pulse = self.pulse.samples.len();
        if self.index_in_pulse >= samples_in_pulse {
            return None;
        }

        let fragment_samples = self.builder.fragment_samples();
        let samples_this_fragment =
            fragment_samples.min(samples_in_pulse - self.index_in_pulse);
        let time_ns = self.pulse.time_ns
            + fragment_samples as i64
                * self.pulse.sample_width_ns as i64
                * self.fragment_index as i64;

        let header = FragmentHeader {
            time_ns,
            samples_this_fragment: samples_this_fragment as i32,
            sample_width_ns: self.pulse.sample_width_ns,
            channel: self.pulse.channel,
            samples_in_pulse: samples_in_pulse as i32,
            fragment_index: self.fragment_index,
            baseline: self.pulse.baseline,
        };

        let mut bytes = Vec::with_capacity(self.builder.fragment_size());
        header.write_to(&mut bytes);
        for i in self.index_in_pulse..self.index_in_pulse + samples_this_fragment {
            bytes.extend_from_slice(&self.pulse.samples.get(i).to_le_bytes());
        }
        bytes.resize(self.builder.fragment_size(), 0);

        self.index_in_pulse += samples_this_fragment;
        self.fragment_index += 1;
        Some((bytes, time_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pack samples two-per-word, low half first
    fn pack_words(samples: &[u16]) -> Vec<u32> {
        samples
            .chunks(2)
            .map(|pair| {
                let low = pair[0] as u32;
                let high = pair.get(1).copied().unwrap_or(0) as u32;
                low | (high << 16)
            })
            .collect()
    }

    fn pulse<'a>(words: &'a [u32], time_ns: i64) -> Pulse<'a> {
        Pulse {
            channel: 42,
            time_ns,
            sample_width_ns: 10,
            baseline: 16000,
            samples: SampleView::new(words),
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = FragmentHeader {
            time_ns: 5_499_999_000,
            samples_this_fragment: 100,
            sample_width_ns: 10,
            channel: 7,
            samples_in_pulse: 100,
            fragment_index: 0,
            baseline: 16123,
        };

        let mut bytes = Vec::new();
        header.write_to(&mut bytes);
        assert_eq!(bytes.len(), FRAGMENT_HEADER_SIZE);

        let restored = FragmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn header_field_offsets() {
        let header = FragmentHeader {
            time_ns: 0x1122_3344_5566_7788,
            samples_this_fragment: 110,
            sample_width_ns: 10,
            channel: 790,
            samples_in_pulse: 300,
            fragment_index: 2,
            baseline: -1,
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes);

        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788i64.to_le_bytes());
        assert_eq!(&bytes[8..12], &110i32.to_le_bytes());
        assert_eq!(&bytes[12..14], &10i16.to_le_bytes());
        assert_eq!(&bytes[14..16], &790i16.to_le_bytes());
        assert_eq!(&bytes[16..20], &300i32.to_le_bytes());
        assert_eq!(&bytes[20..22], &2i16.to_le_bytes());
        assert_eq!(&bytes[22..24], &(-1i16).to_le_bytes());
    }

    #[test]
    fn header_too_short() {
        let result = FragmentHeader::from_bytes(&[0u8; 10]);
        assert!(matches!(result, Err(FragmentError::TooShort(10))));
    }

    #[test]
    fn sample_view_unpacks_word_halves() {
        let words = vec![0x0002_0001, 0x0004_0003];
        let view = SampleView::new(&words);
        assert_eq!(view.len(), 4);
        assert_eq!(view.get(0), 1);
        assert_eq!(view.get(1), 2);
        assert_eq!(view.get(2), 3);
        assert_eq!(view.get(3), 4);
    }

    #[test]
    fn single_fragment_pulse() {
        let builder = FragmentBuilder::default();
        let samples: Vec<u16> = (0..100).collect();
        let words = pack_words(&samples);
        let p = pulse(&words, 5_499_999_000);

        let fragments: Vec<_> = builder.pulse_fragments(&p).collect();
        assert_eq!(fragments.len(), 1);

        let (bytes, time_ns) = &fragments[0];
        assert_eq!(time_ns, &5_499_999_000);
        assert_eq!(bytes.len(), 24 + 220);

        let header = FragmentHeader::from_bytes(bytes).unwrap();
        assert_eq!(header.samples_this_fragment, 100);
        assert_eq!(header.samples_in_pulse, 100);
        assert_eq!(header.fragment_index, 0);
        assert_eq!(header.channel, 42);
        assert_eq!(fragment_samples(bytes).unwrap(), samples);

        // Unused payload tail is zero-filled
        assert!(bytes[24 + 200..].iter().all(|&b| b == 0));
    }

    #[test]
    fn multi_fragment_pulse_splits_110_110_80() {
        let builder = FragmentBuilder::default();
        let samples: Vec<u16> = (0..300).collect();
        let words = pack_words(&samples);
        let p = pulse(&words, 1_000_000);

        let fragments: Vec<_> = builder.pulse_fragments(&p).collect();
        assert_eq!(fragments.len(), 3);

        let headers: Vec<_> = fragments
            .iter()
            .map(|(bytes, _)| FragmentHeader::from_bytes(bytes).unwrap())
            .collect();

        assert_eq!(
            headers
                .iter()
                .map(|h| h.samples_this_fragment)
                .collect::<Vec<_>>(),
            vec![110, 110, 80]
        );
        assert_eq!(
            headers.iter().map(|h| h.fragment_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(headers.iter().all(|h| h.samples_in_pulse == 300));

        // Fragment times step by fragment_samples * sample_width
        assert_eq!(headers[0].time_ns, 1_000_000);
        assert_eq!(headers[1].time_ns, 1_000_000 + 110 * 10);
        assert_eq!(headers[2].time_ns, 1_000_000 + 220 * 10);

        // Samples reassemble to the original pulse
        let mut reassembled = Vec::new();
        for (bytes, _) in &fragments {
            reassembled.extend(fragment_samples(bytes).unwrap());
        }
        assert_eq!(reassembled, samples);
    }

    #[test]
    fn empty_pulse_emits_nothing() {
        let builder = FragmentBuilder::default();
        let words: Vec<u32> = vec![];
        let p = pulse(&words, 0);
        assert_eq!(builder.pulse_fragments(&p).count(), 0);
    }

    #[test]
    fn deadtime_fragment_layout() {
        let builder = FragmentBuilder::default();
        let bytes = builder.artificial_deadtime(123_456_789);
        assert_eq!(bytes.len(), 244);

        let header = FragmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.time_ns, 123_456_789);
        assert_eq!(header.channel, ARTIFICIAL_DEADTIME_CHANNEL);
        assert_eq!(header.samples_this_fragment, 110);
        assert_eq!(header.samples_in_pulse, 110);
        assert_eq!(header.fragment_index, 0);
        assert_eq!(header.sample_width_ns, 0);
        assert_eq!(header.baseline, 0);
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn odd_payload_allows_odd_sample_counts() {
        // A 100-byte payload carries 50 samples per fragment
        let builder = FragmentBuilder::new(100);
        assert_eq!(builder.fragment_samples(), 50);
        assert_eq!(builder.fragment_size(), 124);

        let samples: Vec<u16> = (0..76).collect();
        let words = pack_words(&samples);
        assert_eq!(words.len(), 38);
        let p = Pulse {
            channel: 1,
            time_ns: 0,
            sample_width_ns: 2,
            baseline: 0,
            samples: SampleView::new(&words),
        };

        let fragments: Vec<_> = builder.pulse_fragments(&p).collect();
        assert_eq!(fragments.len(), 2);
        let h0 = FragmentHeader::from_bytes(&fragments[0].0).unwrap();
        let h1 = FragmentHeader::from_bytes(&fragments[1].0).unwrap();
        assert_eq!(h0.samples_this_fragment, 50);
        assert_eq!(h1.samples_this_fragment, 26);
    }
}
