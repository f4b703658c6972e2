//! Entry point for the bin2elf converter.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize `tracing` with the requested filter.
//! 3. Map the firmware image and load the ELF template.
//! 4. Resolve the section layout and patch the template.
//! 5. Serialize the result, unless running dry.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bin2elf::config::Config;
use bin2elf::convert::{ConvertParams, Converter};
use bin2elf::template::ElfTemplate;
use bin2elf::writer;

fn main() -> Result<()> {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).context("invalid log level")?)
        .with_writer(std::io::stderr)
        .init();

    // Map the input image into memory
    let file = File::open(&config.image)
        .with_context(|| format!("failed to open {}", config.image.display()))?;
    let image = unsafe { Mmap::map(&file)? };

    let template_data = std::fs::read(&config.template)
        .with_context(|| format!("failed to read template {}", config.template.display()))?;
    let mut template = ElfTemplate::load(&template_data)
        .with_context(|| format!("failed to load template {}", config.template.display()))?;

    let params = ConvertParams {
        base_addr: config.base_addr,
        addr_space_len: config.effective_addr_space_len(),
        func_align: config.func_align,
        sect_align: config.sect_align,
    };

    // 1. Scan for the anchor and resolve the layout.
    // 2. Patch the template descriptors.
    let converter = Converter::new(&image, params, &config.section);
    converter.run(&mut template)?;

    // 3. Serialize, unless running dry.
    let output = config.output_path();
    if config.dry_run {
        info!("dry run, not writing {}", output.display());
    } else {
        writer::write_elf(&output, &template)?;
        println!(
            "Converted {} to {}",
            config.image.display(),
            output.display()
        );
    }
    Ok(())
}
