pub mod image;

pub type Byte = u8; // 1 byte
pub type Word = u16; // 2 bytes

/// Bytes addressable by a 16-bit address.
pub const ADDRESS_SPACE: usize = 0x10000;

/// Trailing padding so a four-byte fetch window at the top of the address
/// space never reads out of bounds.
pub const FETCH_PADDING: usize = 8;

/// Default memory covering the full address space plus fetch padding
pub type StdMem = Memory<{ ADDRESS_SPACE + FETCH_PADDING }>;

/// Emulates memory for use with the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Memory<const S: usize> {
    /// The actual data of the memory
    pub data: [Byte; S],
}

impl<const S: usize> Default for Memory<S> {
    /// Initializes the memory
    fn default() -> Self {
        Memory { data: [0; S] }
    }
}

impl<const S: usize> Memory<S> {
    /// Reads a byte from the memory
    pub fn read_byte(&mut self, position: Word) -> Byte {
        self.data[position as usize]
    }

    /// Writes a byte to the memory
    pub fn write_byte(&mut self, position: Word, value: Byte) {
        self.data[position as usize] = value;
    }

    /// Reads a word from the memory (little endian)
    pub fn read_word(&mut self, position: Word) -> Word {
        (self.data[position as usize + 1] as Word) << 8 | (self.data[position as usize] as Word)
    }

    /// Writes a word to the memory (litte endian)
    pub fn write_word(&mut self, position: Word, value: Word) {
        self.data[position as usize] = (value & 0xFF) as Byte;
        self.data[position as usize + 1] = (value >> 8) as Byte;
    }

    /// Reads the four-byte fetch window starting at `position`. The longest
    /// instruction is three bytes; the padding keeps the over-read in bounds
    /// even at the very top of the address space.
    pub fn read_quad(&mut self, position: Word) -> [Byte; 4] {
        let at = position as usize;
        [
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ]
    }

    /// Writes an array of bytes to the memory
    pub fn write_array(&mut self, position: Word, data: &[Byte]) {
        (&mut self.data[position as usize..position as usize + data.len() as usize])
            .copy_from_slice(data);
    }

    /// Copies a program image into memory starting at address zero.
    /// The caller guarantees the program fits.
    pub fn load_program(&mut self, program: &[Byte]) {
        self.write_array(0, program);
    }

    /// Re-zeroes the memory without reallocating, so it can be reused
    /// across program loads
    pub fn reset(&mut self) {
        self.data = [0; S];
    }
}

/// Writes a block of instructions directly into the memory
#[macro_export]
macro_rules! write_instructions {
    ( $mem:ident : $pos:expr => $( $byte:expr ),+ ) => {
        $mem.write_array($pos, &[
            $(
                $byte as Byte,
            )+
        ]);
    };
}
