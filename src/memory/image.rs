//! Binary program-image container.
//!
//! Layout (all fields little endian):
//!
//! | offset | size | field |
//! |--------|------|-------------------------------|
//! | 0      | 4    | magic, `"SAPC"` (`0x43504153`) |
//! | 4      | 2    | code size in bytes            |
//! | 6      | 2    | initial program counter       |
//! | 8      | n    | code, copied to address 0     |

use std::error;
use std::fmt;

use crate::memory::{Byte, Memory, Word};
use crate::processor::Processor;

/// `"SAPC"` read as a little-endian u32.
pub const MAGIC: u32 = 0x4350_4153;

/// Size of the fixed image header in bytes.
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The image is shorter than its header or declared code size requires.
    Truncated { expected: usize, found: usize },
    /// The magic signature does not match `"SAPC"`.
    BadMagic { found: u32 },
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Truncated { expected, found } => {
                write!(
                    f,
                    "image truncated: expected {} bytes, found {}",
                    expected, found
                )
            }
            ImageError::BadMagic { found } => {
                write!(
                    f,
                    "bad magic `0x{:08X}`, expected `0x{:08X}` (\"SAPC\")",
                    found, MAGIC
                )
            }
        }
    }
}

impl error::Error for ImageError {}

/// A parsed program image: raw code bytes plus the initial program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Initial program counter
    pub entry: Word,
    /// Instruction/data bytes, destined for address 0
    pub code: Vec<Byte>,
}

impl Image {
    /// Parses an image from its serialized container form. Bytes after the
    /// declared code size are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ImageError::Truncated {
                expected: HEADER_SIZE,
                found: bytes.len(),
            });
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != MAGIC {
            return Err(ImageError::BadMagic { found: magic });
        }

        let code_size = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let entry = u16::from_le_bytes([bytes[6], bytes[7]]);

        let code = bytes
            .get(HEADER_SIZE..HEADER_SIZE + code_size)
            .ok_or(ImageError::Truncated {
                expected: HEADER_SIZE + code_size,
                found: bytes.len(),
            })?
            .to_vec();

        Ok(Image { entry, code })
    }

    /// Loads the code into memory at address zero and points the CPU at
    /// the entry address.
    pub fn load_into<const S: usize>(&self, cpu: &mut Processor, memory: &mut Memory<S>) {
        memory.load_program(&self.code);
        cpu.set_pc(self.entry);
    }
}
