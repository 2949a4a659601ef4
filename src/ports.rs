//! Memory-mapped I/O port handlers for the `IN`/`OUT` instructions.

use std::io::{self, Read, Write};

use crate::memory::Byte;
use color_eyre::eyre::{Result, WrapErr};

/// The only port wired to the output device.
pub const OUTPUT_PORT: Byte = 3;

/// Device acknowledge for an input port: ports 1 and 2 are wired, everything
/// else floats. The CPU discards this status byte.
pub fn input_status(port: Byte) -> Byte {
    match port {
        1 | 2 => 1,
        _ => 0,
    }
}

/// I/O hooks consumed by the CPU. `IN` blocks on [`PortIo::input`]; `OUT`
/// hands port and accumulator to [`PortIo::output`], which emits only on
/// [`OUTPUT_PORT`] and ignores everything else.
pub trait PortIo {
    /// Supplies one byte from the input device
    fn input(&mut self, port: Byte) -> Result<Byte>;

    /// Emits `value` to the output device if `port` selects it
    fn output(&mut self, port: Byte, value: Byte) -> Result<()>;
}

/// Ports backed by a pair of byte streams. `StreamPorts::new(io::stdin(),
/// io::stdout())` gives the console-attached machine; tests attach slices
/// and vectors instead.
#[derive(Debug)]
pub struct StreamPorts<R, W> {
    /// Source for `IN`, one byte per instruction
    pub input: R,
    /// Sink for `OUT` on the output port, written as unpadded hex text
    pub output: W,
}

impl<R, W> StreamPorts<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: Read, W: Write> PortIo for StreamPorts<R, W> {
    fn input(&mut self, _port: Byte) -> Result<Byte> {
        let mut buf = [0; 1];
        // EOF reads as NUL, matching a closed console stream
        let read = self
            .input
            .read(&mut buf)
            .wrap_err("Input port read failed")?;

        Ok(if read == 0 { 0 } else { buf[0] })
    }

    fn output(&mut self, port: Byte, value: Byte) -> Result<()> {
        if port != OUTPUT_PORT {
            return Ok(());
        }

        write!(self.output, "{:x}", value).wrap_err("Output port write failed")?;
        self.output.flush().wrap_err("Output port flush failed")?;

        Ok(())
    }
}

/// Ports for machines that never execute `IN`/`OUT`: input reads NUL,
/// output is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPorts;

impl PortIo for NullPorts {
    fn input(&mut self, _port: Byte) -> Result<Byte> {
        Ok(0)
    }

    fn output(&mut self, _port: Byte, _value: Byte) -> Result<()> {
        Ok(())
    }
}

impl StreamPorts<io::Stdin, io::Stdout> {
    /// Ports attached to the process console
    pub fn console() -> Self {
        Self::new(io::stdin(), io::stdout())
    }
}
