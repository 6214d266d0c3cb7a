//! Sample chunks handed from the network reader to the readout worker.
//!
//! The digitizer streams raw fixed-width signed integers with no framing. The
//! word width (16 or 32 bit) is discovered once per connection and selected at
//! runtime through [`SampleWidth`]; every [`Chunk`] produced during that
//! connection carries the same width.
//!
//! Words are copied in native byte order. The device decides the layout and
//! this layer does not reinterpret it.

use crate::error::{AcqError, Result};

/// Width of one sample word on the data stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SampleWidth {
    /// 2-byte samples (`i16`).
    #[default]
    Word16,
    /// 4-byte samples (`i32`).
    Word32,
}

impl SampleWidth {
    /// Size of one word in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            SampleWidth::Word16 => 2,
            SampleWidth::Word32 => 4,
        }
    }

    /// Map the device's `data32` flag to a width: zero means 16-bit.
    pub fn from_data32(flag: u64) -> Self {
        if flag == 0 {
            SampleWidth::Word16
        } else {
            SampleWidth::Word32
        }
    }

    /// Select a width from a byte count (2 or 4).
    pub fn from_bytes(bytes: usize) -> Result<Self> {
        match bytes {
            2 => Ok(SampleWidth::Word16),
            4 => Ok(SampleWidth::Word32),
            other => Err(AcqError::Config(format!(
                "unsupported sample width: {} bytes",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SampleWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

/// An owned batch of samples.
///
/// A zero-length chunk is the end-of-stream sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// 16-bit samples.
    I16(Vec<i16>),
    /// 32-bit samples.
    I32(Vec<i32>),
}

impl Chunk {
    /// The zero-length sentinel chunk for `width`.
    pub fn empty(width: SampleWidth) -> Self {
        match width {
            SampleWidth::Word16 => Chunk::I16(Vec::new()),
            SampleWidth::Word32 => Chunk::I32(Vec::new()),
        }
    }

    /// Copy every whole word in `bytes` into a new chunk.
    ///
    /// Trailing bytes that do not form a whole word are ignored; use
    /// [`WordAssembler`] to carry them into the next read.
    pub fn decode(width: SampleWidth, bytes: &[u8]) -> Self {
        match width {
            SampleWidth::Word16 => Chunk::I16(
                bytes
                    .chunks_exact(2)
                    .map(|w| i16::from_ne_bytes([w[0], w[1]]))
                    .collect(),
            ),
            SampleWidth::Word32 => Chunk::I32(
                bytes
                    .chunks_exact(4)
                    .map(|w| i32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
                    .collect(),
            ),
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            Chunk::I16(v) => v.len(),
            Chunk::I32(v) => v.len(),
        }
    }

    /// True for a zero-length chunk (including the sentinel).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Word width of this chunk.
    pub fn width(&self) -> SampleWidth {
        match self {
            Chunk::I16(_) => SampleWidth::Word16,
            Chunk::I32(_) => SampleWidth::Word32,
        }
    }

    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.len() * self.width().bytes()
    }

    /// Borrow 16-bit samples, if this is a 16-bit chunk.
    pub fn as_i16(&self) -> Option<&[i16]> {
        match self {
            Chunk::I16(v) => Some(v),
            Chunk::I32(_) => None,
        }
    }

    /// Borrow 32-bit samples, if this is a 32-bit chunk.
    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Chunk::I32(v) => Some(v),
            Chunk::I16(_) => None,
        }
    }

    /// Widen every sample to `i64`.
    pub fn to_i64_vec(&self) -> Vec<i64> {
        match self {
            Chunk::I16(v) => v.iter().map(|&s| i64::from(s)).collect(),
            Chunk::I32(v) => v.iter().map(|&s| i64::from(s)).collect(),
        }
    }
}

/// Turns arbitrary byte deliveries into whole-word chunks.
///
/// TCP may split a word across two reads. The assembler keeps the partial
/// word and prepends it to the next delivery so no sample is dropped.
#[derive(Debug)]
pub struct WordAssembler {
    width: SampleWidth,
    carry: Vec<u8>,
    scratch: Vec<u8>,
}

impl WordAssembler {
    /// Create an assembler for `width`.
    pub fn new(width: SampleWidth) -> Self {
        Self {
            width,
            carry: Vec::with_capacity(width.bytes()),
            scratch: Vec::new(),
        }
    }

    /// Width of the chunks produced.
    pub fn width(&self) -> SampleWidth {
        self.width
    }

    /// Bytes held back waiting for the rest of their word.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Convert one delivery into a chunk of `floor((pending + len) / width)` samples.
    pub fn assemble(&mut self, bytes: &[u8]) -> Chunk {
        let word = self.width.bytes();
        if self.carry.is_empty() {
            let whole = bytes.len() - bytes.len() % word;
            self.carry.extend_from_slice(&bytes[whole..]);
            return Chunk::decode(self.width, &bytes[..whole]);
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&self.carry);
        self.scratch.extend_from_slice(bytes);
        self.carry.clear();

        let whole = self.scratch.len() - self.scratch.len() % word;
        self.carry.extend_from_slice(&self.scratch[whole..]);
        Chunk::decode(self.width, &self.scratch[..whole])
    }
}
