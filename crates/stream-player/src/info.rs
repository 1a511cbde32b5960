/// PCM format announced by a decoder once it has parsed a bitstream header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    /// Bits per sample of the emitted PCM (little-endian, signed except 8-bit).
    pub bits: u16,
    pub channels: u16,
    /// Track the format was parsed from.
    pub source: Option<String>,
}

impl StreamInfo {
    pub fn new(sample_rate: u32, bits: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            bits,
            channels,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Bytes per interleaved frame (one sample for every channel).
    pub fn frame_bytes(&self) -> usize {
        (self.bits as usize).div_ceil(8) * self.channels as usize
    }

    /// Same PCM layout, ignoring which track it came from.
    pub fn same_format(&self, other: &StreamInfo) -> bool {
        self.sample_rate == other.sample_rate
            && self.bits == other.bits
            && self.channels == other.channels
    }

    /// Reject formats no output can be clocked at.
    pub fn is_playable(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0 && matches!(self.bits, 8 | 16 | 24 | 32)
    }
}
