//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the
//! converter using `clap`, along with parsing of numeric arguments
//! (hex/octal/binary prefixes accepted) and section override specs.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// Explicit placement for one named section, parsed from
/// `NAME[@ADDR][:LEN]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpec {
    pub name: String,
    /// Memory address of the section (not its input file position).
    pub addr: Option<u32>,
    /// Section length; for uninitialized sections this is the memory
    /// size, as the file size is zero.
    pub size: Option<u32>,
}

/// Re-wrap a raw ARM firmware memory dump as an analyzable ELF file.
///
/// The converter scans the dump for the exception index table, infers
/// the code, data and uninitialized regions around it, and applies the
/// resulting layout onto a template ELF.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Executable ARM firmware binary (raw memory dump)
    #[arg(short = 'p', long)]
    pub image: PathBuf,

    /// Output ELF file (default is the image name with the extension switched to .elf)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Template ELF file to take header fields and section descriptors from
    #[arg(short, long, default_value = "bin2elf_template.elf")]
    pub template: PathBuf,

    /// Base address; the first section from the image starts at this memory location
    #[arg(short, long, default_value = "0x1000000", value_parser = parse_u32)]
    pub base_addr: u32,

    /// Address space length after base; used addresses are expected to
    /// end at base-addr + addr-space-len, so it sizes the last section
    #[arg(short = 'l', long, default_value = "0x2000000", value_parser = parse_u32)]
    pub addr_space_len: u32,

    /// Set section position and/or length as NAME[@ADDR][:LEN], overriding
    /// detection; setting .ARM.exidx moves and sizes .text and .data to fit
    /// around it. Numbered clones of template sections (such as .bss2) are
    /// allowed. Repeatable
    #[arg(short, long = "section", value_parser = parse_section_spec)]
    pub section: Vec<SectionSpec>,

    /// Expected function alignment in the code region
    #[arg(long, default_value = "2", value_parser = parse_u32)]
    pub func_align: u32,

    /// Expected section alignment
    #[arg(long, default_value = "0x10", value_parser = parse_u32)]
    pub sect_align: u32,

    /// Compute the layout but do not write any files
    #[arg(long)]
    pub dry_run: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

impl Config {
    /// Output path, defaulting to the image path with `.elf`.
    pub fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => self.image.with_extension("elf"),
        }
    }

    /// Address space length, auto-expanded when the highest-placed
    /// override ends past the configured limit.
    pub fn effective_addr_space_len(&self) -> u32 {
        let mut len = self.addr_space_len;
        let last = self
            .section
            .iter()
            .filter(|s| s.addr.is_some())
            .max_by_key(|s| s.addr);
        if let Some(spec) = last {
            let end = spec.addr.unwrap_or(0) as i64 + spec.size.unwrap_or(0) as i64
                - self.base_addr as i64;
            if end > len as i64 {
                len = end.min(u32::MAX as i64) as u32;
                info!("address space length auto-expanded to {:#010x}", len);
            }
        }
        len
    }
}

/// Parses a number with an optional 0x/0o/0b prefix.
fn parse_u32(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let (digits, radix) = match text.get(..2) {
        Some("0x") | Some("0X") => (&text[2..], 16),
        Some("0o") | Some("0O") => (&text[2..], 8),
        Some("0b") | Some("0B") => (&text[2..], 2),
        _ => (text, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|err| format!("invalid number '{text}': {err}"))
}

/// Parses a `NAME[@ADDR][:LEN]` override.
fn parse_section_spec(text: &str) -> Result<SectionSpec, String> {
    let (head, size) = match text.split_once(':') {
        Some((head, len)) => (head, Some(parse_u32(len)?)),
        None => (text, None),
    };
    let (name, addr) = match head.split_once('@') {
        Some((name, addr)) => (name, Some(parse_u32(addr)?)),
        None => (head, None),
    };
    if name.is_empty() {
        return Err("section name is empty".to_string());
    }
    Ok(SectionSpec {
        name: name.to_string(),
        addr,
        size,
    })
}
