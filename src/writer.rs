//! ELF file writer.
//!
//! Serializes a patched [`ElfTemplate`] into a complete ELF32 image:
//! file header, a single RWX LOAD segment, the section payloads laid out
//! sequentially (preserving the contiguity of the source dump), then the
//! section header table and a regenerated `.shstrtab`.

use object::endian::{U16, U32};
use object::pod::bytes_of;
use object::{elf, Endianness};
use std::path::Path;

use crate::addr::align_up;
use crate::error::Result;
use crate::template::ElfTemplate;

const EHDR_SIZE: u16 = 52;
const PHDR_SIZE: u16 = 32;
const SHDR_SIZE: u16 = 40;
/// File offset where section payloads begin.
const DATA_OFFSET: u64 = 0x1000;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}

/// Builds the output ELF image in memory. Deterministic: identical
/// templates produce identical bytes.
pub fn build_elf(template: &ElfTemplate) -> Vec<u8> {
    let num_sections = template.sections.len() as u16 + 2; // null + shstrtab

    // Sequential payload layout; uninitialized sections take no file
    // bytes and inherit the running offset.
    let mut offsets = Vec::with_capacity(template.sections.len());
    let mut offset = DATA_OFFSET;
    for section in &template.sections {
        offsets.push(offset as u32);
        if !section.is_uninitialized() {
            offset += section.data.len() as u64;
        }
    }
    let payload_end = offset;

    let mut buffer = Vec::new();
    let file_header = elf::FileHeader32::<Endianness> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS32,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(elf::ET_EXEC),
        e_machine: u16(template.machine),
        e_version: u32(elf::EV_CURRENT as u32),
        e_entry: u32(template.entry),
        e_phoff: u32(EHDR_SIZE as u32),
        e_shoff: u32(0), // patched once the layout is final
        e_flags: u32(template.flags),
        e_ehsize: u16(EHDR_SIZE),
        e_phentsize: u16(PHDR_SIZE),
        e_phnum: u16(1),
        e_shentsize: u16(SHDR_SIZE),
        e_shnum: u16(num_sections),
        e_shstrndx: u16(num_sections - 1),
    };
    buffer.extend_from_slice(bytes_of(&file_header));

    // Single LOAD segment covering the whole rewrapped image; memory
    // size additionally spans the uninitialized tail.
    let mem_end = template
        .sections
        .iter()
        .map(|s| s.addr as u64 + s.size as u64)
        .max()
        .unwrap_or(template.entry as u64);
    let prog_header = elf::ProgramHeader32::<Endianness> {
        p_type: u32(elf::PT_LOAD),
        p_offset: u32(DATA_OFFSET as u32),
        p_vaddr: u32(template.entry),
        p_paddr: u32(template.entry),
        p_filesz: u32((payload_end - DATA_OFFSET) as u32),
        p_memsz: u32(mem_end.saturating_sub(template.entry as u64) as u32),
        p_flags: u32(elf::PF_R | elf::PF_W | elf::PF_X),
        p_align: u32(DATA_OFFSET as u32),
    };
    buffer.extend_from_slice(bytes_of(&prog_header));

    // Pad the headers out to the payload offset.
    if (buffer.len() as u64) < DATA_OFFSET {
        buffer.resize(DATA_OFFSET as usize, 0);
    }

    // Section payloads.
    for (section, &offset) in template.sections.iter().zip(&offsets) {
        if section.is_uninitialized() {
            continue;
        }
        if offset as usize > buffer.len() {
            buffer.resize(offset as usize, 0);
        }
        buffer.extend_from_slice(&section.data);
    }

    // Section header string table.
    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::with_capacity(template.sections.len());
    for section in &template.sections {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(section.name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    let shoff = align_up(buffer.len() as u64, 4);
    buffer.resize(shoff as usize, 0);

    // Null section header.
    let null_header = elf::SectionHeader32::<Endianness> {
        sh_name: u32(0),
        sh_type: u32(elf::SHT_NULL),
        sh_flags: u32(0),
        sh_addr: u32(0),
        sh_offset: u32(0),
        sh_size: u32(0),
        sh_link: u32(0),
        sh_info: u32(0),
        sh_addralign: u32(0),
        sh_entsize: u32(0),
    };
    buffer.extend_from_slice(bytes_of(&null_header));

    for (i, (section, &offset)) in template.sections.iter().zip(&offsets).enumerate() {
        let size = if section.is_uninitialized() {
            section.size
        } else {
            section.data.len() as u32
        };
        let section_header = elf::SectionHeader32::<Endianness> {
            sh_name: u32(name_offsets[i]),
            sh_type: u32(section.sh_type),
            sh_flags: u32(section.sh_flags),
            sh_addr: u32(section.addr),
            sh_offset: u32(offset),
            sh_size: u32(size),
            sh_link: u32(0),
            sh_info: u32(0),
            sh_addralign: u32(section.align),
            sh_entsize: u32(0),
        };
        buffer.extend_from_slice(bytes_of(&section_header));
    }

    // String table header, then its contents right after the table.
    let shstrtab_offset = shoff + num_sections as u64 * SHDR_SIZE as u64;
    let strtab_header = elf::SectionHeader32::<Endianness> {
        sh_name: u32(shstrtab_name),
        sh_type: u32(elf::SHT_STRTAB),
        sh_flags: u32(0),
        sh_addr: u32(0),
        sh_offset: u32(shstrtab_offset as u32),
        sh_size: u32(shstrtab.len() as u32),
        sh_link: u32(0),
        sh_info: u32(0),
        sh_addralign: u32(1),
        sh_entsize: u32(0),
    };
    buffer.extend_from_slice(bytes_of(&strtab_header));
    buffer.extend_from_slice(&shstrtab);

    // Patch e_shoff now that the header table position is known.
    buffer[32..36].copy_from_slice(&(shoff as u32).to_le_bytes());

    buffer
}

/// Writes the serialized template to `path`.
pub fn write_elf(path: &Path, template: &ElfTemplate) -> Result<()> {
    std::fs::write(path, build_elf(template))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateSection;
    use object::{Object, ObjectSection};

    fn section(name: &str, sh_type: u32, addr: u32, data: Vec<u8>) -> TemplateSection {
        let size = data.len() as u32;
        TemplateSection {
            name: name.to_string(),
            sh_type,
            sh_flags: (elf::SHF_ALLOC | elf::SHF_EXECINSTR) as u32,
            addr,
            size,
            align: 4,
            data,
        }
    }

    #[test]
    fn output_parses_back_with_object() {
        let mut bss = section(".bss", elf::SHT_NOBITS, 0x0100_0040, Vec::new());
        bss.size = 0x80;
        let template = ElfTemplate {
            machine: elf::EM_ARM,
            flags: 0x0500_0000,
            entry: 0x0100_0000,
            sections: vec![
                section(".text", elf::SHT_PROGBITS, 0x0100_0000, vec![0xAA; 0x40]),
                bss,
            ],
        };
        let image = build_elf(&template);
        let parsed = object::File::parse(&*image).unwrap();
        assert_eq!(parsed.entry(), 0x0100_0000);
        assert!(!parsed.is_64());
        let text = parsed.section_by_name(".text").unwrap();
        assert_eq!(text.address(), 0x0100_0000);
        assert_eq!(text.data().unwrap(), &[0xAA; 0x40][..]);
        let bss = parsed.section_by_name(".bss").unwrap();
        assert_eq!(bss.size(), 0x80);
    }

    #[test]
    fn identical_templates_serialize_identically() {
        let template = ElfTemplate {
            machine: elf::EM_ARM,
            flags: 0,
            entry: 0x0100_0000,
            sections: vec![section(
                ".text",
                elf::SHT_PROGBITS,
                0x0100_0000,
                vec![1, 2, 3, 4],
            )],
        };
        assert_eq!(build_elf(&template), build_elf(&template));
    }
}
