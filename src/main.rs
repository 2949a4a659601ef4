use std::env;
use std::fs;

use color_eyre::eyre::{eyre, Result, WrapErr};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use sap::memory::image::Image;
use sap::memory::StdMem;
use sap::ports::StreamPorts;
use sap::processor::Processor;

fn main() -> Result<()> {
    color_eyre::install()?; // rust error handling
    SimpleLogger::new()
        .with_level(LevelFilter::Warn) // keep stdout clean for the output port
        .init()
        .unwrap(); // logging

    let path = env::args().nth(1).ok_or_else(|| eyre!("No input file"))?;
    let bytes = fs::read(&path).wrap_err_with(|| format!("Cannot open file `{}`", path))?;
    let image = Image::parse(&bytes).wrap_err_with(|| format!("Cannot load `{}`", path))?;

    let mut mem = StdMem::default();
    let mut cpu = Processor::default();
    image.load_into(&mut cpu, &mut mem);

    cpu.run(&mut mem, &mut StreamPorts::console())?;

    Ok(())
}
