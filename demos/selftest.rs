use color_eyre::eyre::Result;

use log::LevelFilter;
use sap::memory::image::Image;
use sap::memory::StdMem;
use sap::ports::StreamPorts;
use sap::processor::Processor;
use simple_logger::SimpleLogger;

/// The self-test routine historically burned into the machine: an output
/// subroutine at address 0 and a main body at address 6 that prints, calls
/// the routine and halts.
const PROGRAM: [u8; 16] = [
    0x3E, 0x09, // 0000  MVI_A 9
    0x90, // 0002  SUB_B
    0xD3, 0x03, // 0003  OUT 3
    0xC9, // 0005  RET
    0x3E, 0x04, // 0006  MVI_A 4
    0x06, 0x02, // 0008  MVI_B 2
    0xD3, 0x03, // 000A  OUT 3
    0xCD, 0x00, 0x00, // 000C  CALL 0x0000
    0x76, // 000F  HLT
];

fn main() -> Result<()> {
    color_eyre::install()?; // rust error handling
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap(); // logging

    // Package the program as a "SAPC" image entered at the main body.
    let mut bytes = b"SAPC".to_vec();
    bytes.extend_from_slice(&(PROGRAM.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&0x0006u16.to_le_bytes());
    bytes.extend_from_slice(&PROGRAM);

    let image = Image::parse(&bytes)?;

    let mut mem = StdMem::default();
    let mut cpu = Processor::default();
    image.load_into(&mut cpu, &mut mem);

    cpu.run(&mut mem, &mut StreamPorts::console())?;
    println!();

    Ok(())
}
