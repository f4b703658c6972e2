//! ELF template handling.
//!
//! The output file borrows its skeleton from a template ELF prepared for
//! the target platform (built from a mock firmware and stripped). The
//! template supplies section descriptors with the right types and flags;
//! the conversion only fills in addresses, sizes and payloads.
//!
//! Descriptor resolution is a small provider capability: lookup by exact
//! name, or clone a base descriptor for numbered siblings (`.bss2` is a
//! clone of `.bss`, inserted right after its predecessor).

use object::elf;
use object::{Architecture, Object, ObjectSection};

use crate::error::{Error, Result};

/// One mutable section descriptor from the template.
#[derive(Debug, Clone)]
pub struct TemplateSection {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub addr: u32,
    /// Section size; tracks `data.len()` except for `SHT_NOBITS`.
    pub size: u32,
    pub align: u32,
    pub data: Vec<u8>,
}

impl TemplateSection {
    pub fn is_uninitialized(&self) -> bool {
        self.sh_type == elf::SHT_NOBITS
    }
}

/// A loaded structural template: header fields worth carrying over plus
/// the allocatable section descriptors, in file order.
#[derive(Debug, Clone)]
pub struct ElfTemplate {
    pub machine: u16,
    pub flags: u32,
    pub entry: u32,
    pub sections: Vec<TemplateSection>,
}

impl ElfTemplate {
    /// Parses a template ELF. Only little-endian 32-bit ARM templates
    /// are usable; wider address spaces are out of scope.
    pub fn load(data: &[u8]) -> Result<Self> {
        let obj = object::File::parse(data)?;
        if obj.is_64() {
            return Err(Error::Template(
                "64-bit templates are not supported".to_string(),
            ));
        }
        if !obj.is_little_endian() {
            return Err(Error::Template(
                "big-endian templates are not supported".to_string(),
            ));
        }
        let machine = match obj.architecture() {
            Architecture::Arm => elf::EM_ARM,
            other => {
                return Err(Error::Template(format!(
                    "unsupported template architecture {other:?}"
                )))
            }
        };
        let flags = match obj.flags() {
            object::FileFlags::Elf { e_flags, .. } => e_flags,
            _ => return Err(Error::Template("template is not an ELF file".to_string())),
        };
        let mut sections = Vec::new();
        for section in obj.sections() {
            let sh_flags = match section.flags() {
                object::SectionFlags::Elf { sh_flags } => sh_flags,
                _ => 0,
            };
            // Only allocatable sections matter for the rewrapped image;
            // string and symbol tables are regenerated on write.
            if sh_flags & elf::SHF_ALLOC as u64 == 0 {
                continue;
            }
            let sh_type = match section.kind() {
                object::SectionKind::UninitializedData | object::SectionKind::Common => {
                    elf::SHT_NOBITS
                }
                object::SectionKind::Note => elf::SHT_NOTE,
                object::SectionKind::Elf(sh_type) => sh_type,
                _ => elf::SHT_PROGBITS,
            };
            let (data, size) = if sh_type == elf::SHT_NOBITS {
                (Vec::new(), section.size() as u32)
            } else {
                let data = section.data()?.to_vec();
                let size = data.len() as u32;
                (data, size)
            };
            sections.push(TemplateSection {
                name: section.name()?.to_string(),
                sh_type,
                sh_flags: sh_flags as u32,
                addr: section.address() as u32,
                size,
                align: section.align() as u32,
                data,
            });
        }
        Ok(Self {
            machine,
            flags,
            entry: obj.entry() as u32,
            sections,
        })
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// Returns the descriptor index for `name`, cloning the numbered
    /// base descriptor into place when the exact name is absent. The
    /// clone lands right after the previous sibling, or after the base
    /// section when no prior sibling exists.
    pub fn resolve_descriptor(&mut self, name: &str) -> Result<usize> {
        if let Some(idx) = self.index_of(name) {
            return Ok(idx);
        }
        let mismatch = || Error::TemplateMismatch {
            section: name.to_string(),
        };
        let (stem, num) = split_numeric_suffix(name).ok_or_else(mismatch)?;
        let base_idx = self.index_of(stem).ok_or_else(mismatch)?;
        let mut clone = self.sections[base_idx].clone();
        clone.name = name.to_string();
        let previous = format!("{}{}", stem, num as i64 - 1);
        let after_idx = self.index_of(&previous).unwrap_or(base_idx);
        self.sections.insert(after_idx + 1, clone);
        Ok(after_idx + 1)
    }
}

/// Splits a trailing decimal suffix off a section name. The name must
/// start with a dot and keep a non-digit stem (`.bss2` -> `.bss`, 2).
fn split_numeric_suffix(name: &str) -> Option<(&str, u32)> {
    if !name.starts_with('.') {
        return None;
    }
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if stem.len() == name.len() || stem.len() < 2 {
        return None;
    }
    let num: u32 = name[stem.len()..].parse().ok()?;
    Some((stem, num))
}
