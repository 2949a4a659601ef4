use color_eyre::eyre::Result;

use log::LevelFilter;
use sap::memory::{Byte, StdMem};
use sap::ports::StreamPorts;
use sap::processor::Processor;
use sap::write_instructions;
use simple_logger::SimpleLogger;

/// Counts down from 9, emitting each value on the output port.
fn main() -> Result<()> {
    color_eyre::install()?; // rust error handling
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap(); // logging

    let mut mem = StdMem::default();
    let mut cpu = Processor::default();

    use sap::processor::Opcode::*;
    write_instructions!(mem : 0 =>
        MVI_A, 9,
        OUT, 3,         // 0x0002: loop body
        DCR_A,
        JNZ, 0x02, 0x00,
        HLT
    );

    cpu.run(&mut mem, &mut StreamPorts::console())?;
    println!();

    Ok(())
}
