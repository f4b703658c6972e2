//! Exception index table scanning.
//!
//! A flattened firmware image keeps no section table, but the ARM
//! exception index (`.ARM.exidx`) has a structure regular enough to
//! detect with few false positives: fixed-width records whose first word
//! is a prel31 offset to a function entry in the code region below the
//! table. Finding that table anchors the whole section layout.
//!
//! The record format is described in "Exception Handling ABI for the ARM
//! Architecture".

use tracing::{debug, trace, warn};

use crate::addr::prel31_to_addr;

/// Section name the scanners hunt for.
pub const EXIDX_SECTION: &str = ".ARM.exidx";

/// Second-word sentinel meaning "no unwind information for this range".
pub const EXIDX_CANTUNWIND: u32 = 0x1;

/// One packed little-endian exception index record.
#[derive(Debug, Clone, Copy)]
pub struct ExIdxEntry {
    /// prel31 offset to the function the record covers; bit 31 reserved.
    pub table_offset: u32,
    /// Sentinel, inline handler descriptor, or prel31 offset to an
    /// out-of-line table entry.
    pub entry: u32,
}

impl ExIdxEntry {
    pub const SIZE: usize = 8;

    /// Reads a record at `pos`, or `None` when fewer than
    /// [`ExIdxEntry::SIZE`] bytes remain.
    pub fn read(image: &[u8], pos: usize) -> Option<Self> {
        Some(Self {
            table_offset: read_u32_le(image, pos)?,
            entry: read_u32_le(image, pos + 4)?,
        })
    }
}

fn read_u32_le(image: &[u8], pos: usize) -> Option<u32> {
    let b = image.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decides whether `record` is a plausible exception index entry, given
/// that the code region is presumed to span `[base, base + section_pos)`
/// and the record sits at image offset `entry_pos`.
///
/// Comparisons run at i64 width so the checks behave the same near the
/// bottom and the top of the 32-bit address space.
pub fn is_index_entry(
    image: &[u8],
    record: ExIdxEntry,
    base: u32,
    func_align: u32,
    sect_align: u32,
    section_pos: usize,
    entry_pos: usize,
) -> bool {
    // The offset is encoded "with bit 31 clear"; zero never encodes a
    // real function.
    if record.table_offset == 0 || record.table_offset & 0x8000_0000 != 0 {
        return false;
    }
    let code_start = base as i64;
    let code_end = base as i64 + section_pos as i64;
    let here = base.wrapping_add(entry_pos as u32);
    // The first word must resolve to a function start inside the code
    // region below the table.
    let func = prel31_to_addr(record.table_offset, here) as i64;
    if func <= code_start || func >= code_end || func % func_align as i64 != 0 {
        return false;
    }
    // Second word, option one: the can't-unwind sentinel.
    if record.entry == EXIDX_CANTUNWIND {
        trace!(
            "matching '{}' entry at {:#010x}: {:#010x} {:#010x} [cantunwind]",
            EXIDX_SECTION,
            entry_pos,
            func,
            record.entry
        );
        return true;
    }
    // Option two: an inline handler descriptor. Bits 30-28 are reserved
    // as zero; the personality index and its data live in the low bits.
    if record.entry & 0x8000_0000 != 0 {
        if record.entry & 0x7000_0000 != 0 {
            return false;
        }
        trace!(
            "matching '{}' entry at {:#010x}: {:#010x} {:#010x} [inline entry, idx {:#x}]",
            EXIDX_SECTION,
            entry_pos,
            func,
            record.entry,
            (record.entry >> 24) & 7
        );
        return true;
    }
    // Option three: a prel31 offset to an out-of-line table entry. The
    // table is expected adjacent to the index: either just below the
    // presumed section start, or shortly past this record. The window
    // multipliers are empirical constants; do not re-derive them.
    let table = prel31_to_addr(record.entry, here) as i64;
    let here_abs = base as i64 + entry_pos as i64;
    let near_section =
        table >= code_end - sect_align as i64 * 0x10 && table <= code_end - 4;
    let after_record = table >= here_abs + ExIdxEntry::SIZE as i64
        && table < here_abs + sect_align as i64 * 0x20;
    if !near_section && !after_record {
        return false;
    }
    // Entry sizes vary but are always multiples of 4.
    if table % 4 != 0 {
        return false;
    }
    // The entry starts with a personality routine pointer; it must be
    // readable and look like a function in the code region.
    let table_pos = table - base as i64;
    if table_pos < 0 {
        return false;
    }
    let Some(routine) = read_u32_le(image, table_pos as usize) else {
        return false;
    };
    let routine = routine as i64;
    if routine <= code_start || routine >= code_end || routine % func_align as i64 != 0 {
        return false;
    }
    trace!(
        "matching '{}' entry at {:#010x}: {:#010x} {:#010x} [table entry at {:#010x}]",
        EXIDX_SECTION,
        entry_pos,
        func,
        record.entry,
        table
    );
    true
}

/// Locates the exception index section by trying candidate positions at
/// successive multiples of `sect_align` and counting how many valid
/// records each one holds.
///
/// Scanning deliberately continues past the first hit: a later run may
/// supersede an earlier false positive, so the last match wins and
/// finding more than one is reported as a warning. A run cut short by
/// end-of-input invalidates the whole candidate. Returns the section's
/// image position and byte length.
pub fn scan_index_section(
    image: &[u8],
    base: u32,
    start_pos: usize,
    func_align: u32,
    sect_align: u32,
) -> Option<(usize, usize)> {
    assert!(
        sect_align as usize >= ExIdxEntry::SIZE,
        "section alignment smaller than an index entry"
    );
    let mut match_count = 0usize;
    let mut match_pos = 0usize;
    let mut match_entries = 0usize;
    let mut pos = start_pos;
    'scan: loop {
        // Count consecutive valid records at this candidate position.
        let mut entry_count = 0usize;
        let mut entry_pos = pos;
        loop {
            let Some(record) = ExIdxEntry::read(image, entry_pos) else {
                // No trailing partial section at end-of-input.
                break 'scan;
            };
            if !is_index_entry(image, record, base, func_align, sect_align, pos, entry_pos) {
                break;
            }
            entry_count += 1;
            entry_pos += ExIdxEntry::SIZE;
        }
        // The gap up to the next section boundary must be zero filled.
        if entry_count > 0 && entry_pos % sect_align as usize != 0 {
            let pad_end = entry_pos + sect_align as usize - entry_pos % sect_align as usize;
            let padding = &image[entry_pos..pad_end.min(image.len())];
            if !padding.iter().all(|&b| b == 0) {
                entry_count = 0;
            }
        }
        if entry_count > 0 {
            debug!(
                "matching '{}' section at {:#010x}: {} exception entries",
                EXIDX_SECTION, pos, entry_count
            );
            match_pos = pos;
            match_entries = entry_count;
            match_count += 1;
        }
        pos += sect_align as usize;
    }
    if match_count > 1 {
        warn!(
            "multiple ({}) matches found for section '{}' with alignment {:#04x}",
            match_count, EXIDX_SECTION, sect_align
        );
    }
    if match_count < 1 {
        return None;
    }
    Some((match_pos, match_entries * ExIdxEntry::SIZE))
}

/// Last-resort scan for an empty exception index: a zero-filled block
/// ending at an aligned offset, which is what the boundary between code
/// and data usually looks like on minimal builds.
///
/// Returns the end offset of the last all-zero window in the run; the
/// section itself has zero length there. Windows before the first match
/// are skipped, the first non-matching window after a match ends the
/// scan.
pub fn scan_empty_index_section(image: &[u8], start_pos: usize, sect_align: u32) -> Option<usize> {
    let sect_align = sect_align as usize;
    let mut match_count = 0usize;
    let mut match_pos = 0usize;
    let mut pos = start_pos;
    loop {
        let Some(window) = image.get(pos..pos + sect_align) else {
            break;
        };
        if window.iter().all(|&b| b == 0) {
            match_pos = pos + sect_align;
            match_count += 1;
        } else if match_count > 0 {
            break;
        }
        pos += sect_align;
    }
    if match_count < 1 {
        return None;
    }
    Some(match_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x0100_0000;
    const FUNC_ALIGN: u32 = 2;
    const SECT_ALIGN: u32 = 0x10;

    fn prel31_field(target: u32, reference: u32) -> u32 {
        target.wrapping_sub(reference) & 0x7FFF_FFFF
    }

    fn put_u32(image: &mut [u8], pos: usize, value: u32) {
        image[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a record at `pos` covering a function at `func`, with the
    /// given second word.
    fn put_record(image: &mut [u8], pos: usize, func: u32, entry: u32) {
        put_u32(image, pos, prel31_field(func, BASE + pos as u32));
        put_u32(image, pos + 4, entry);
    }

    fn check(image: &[u8], section_pos: usize, entry_pos: usize) -> bool {
        let record = ExIdxEntry::read(image, entry_pos).unwrap();
        is_index_entry(
            image,
            record,
            BASE,
            FUNC_ALIGN,
            SECT_ALIGN,
            section_pos,
            entry_pos,
        )
    }

    #[test]
    fn accepts_cantunwind_sentinel() {
        let mut image = vec![0u8; 0x40];
        put_record(&mut image, 0x20, BASE + 0x10, EXIDX_CANTUNWIND);
        assert!(check(&image, 0x20, 0x20));
    }

    #[test]
    fn rejects_zero_and_reserved_bit_offsets() {
        let mut image = vec![0u8; 0x40];
        put_u32(&mut image, 0x20, 0);
        put_u32(&mut image, 0x24, EXIDX_CANTUNWIND);
        assert!(!check(&image, 0x20, 0x20));
        put_u32(&mut image, 0x20, 0x8000_0010);
        assert!(!check(&image, 0x20, 0x20));
    }

    #[test]
    fn rejects_function_outside_code_region() {
        let mut image = vec![0u8; 0x40];
        // Points past the presumed section start.
        put_record(&mut image, 0x20, BASE + 0x30, EXIDX_CANTUNWIND);
        assert!(!check(&image, 0x20, 0x20));
        // Points at the base itself (exclusive bound).
        put_record(&mut image, 0x20, BASE, EXIDX_CANTUNWIND);
        assert!(!check(&image, 0x20, 0x20));
        // Odd address with a function alignment of 2.
        put_record(&mut image, 0x20, BASE + 0x11, EXIDX_CANTUNWIND);
        assert!(!check(&image, 0x20, 0x20));
    }

    #[test]
    fn inline_descriptor_requires_reserved_bits_clear() {
        let mut image = vec![0u8; 0x40];
        put_record(&mut image, 0x20, BASE + 0x10, 0x8012_3456);
        assert!(check(&image, 0x20, 0x20));
        put_record(&mut image, 0x20, BASE + 0x10, 0x9000_0000);
        assert!(!check(&image, 0x20, 0x20));
    }

    #[test]
    fn out_of_line_entry_validates_personality_routine() {
        let mut image = vec![0u8; 0x140];
        // Table entry just below the presumed section start at 0x100,
        // with a personality routine pointing into the code region.
        put_u32(&mut image, 0xF0, BASE + 0x50);
        put_record(
            &mut image,
            0x100,
            BASE + 0x10,
            prel31_field(BASE + 0xF0, BASE + 0x100),
        );
        assert!(check(&image, 0x100, 0x100));
        // An unaligned routine kills the match.
        put_u32(&mut image, 0xF0, BASE + 0x51);
        assert!(!check(&image, 0x100, 0x100));
        // So does a table offset in the gap between the two acceptance
        // windows (past the section start, before the next record).
        put_u32(&mut image, 0xF0, BASE + 0x50);
        put_record(
            &mut image,
            0x100,
            BASE + 0x10,
            prel31_field(BASE + 0x104, BASE + 0x100),
        );
        assert!(!check(&image, 0x100, 0x100));
    }

    #[test]
    fn scanner_finds_single_record_run() {
        let mut image = vec![0xE1u8; 0x110];
        put_record(&mut image, 0x100, BASE + 0x10, EXIDX_CANTUNWIND);
        image[0x108..0x110].fill(0);
        assert_eq!(
            scan_index_section(&image, BASE, 0, FUNC_ALIGN, SECT_ALIGN),
            Some((0x100, 8))
        );
    }

    #[test]
    fn scanner_prefers_the_last_match() {
        // Four sentinel records: the aligned tail of the run is itself a
        // valid candidate, so the scan ends up preferring it.
        let mut image = vec![0xE1u8; 0x140];
        for i in 0..4 {
            put_record(
                &mut image,
                0x100 + i * ExIdxEntry::SIZE,
                BASE + 0x10 + 2 * i as u32,
                EXIDX_CANTUNWIND,
            );
        }
        assert_eq!(
            scan_index_section(&image, BASE, 0, FUNC_ALIGN, SECT_ALIGN),
            Some((0x110, 16))
        );
    }

    #[test]
    fn scanner_discards_run_cut_by_end_of_input() {
        let mut image = vec![0xE1u8; 0x10C];
        put_record(&mut image, 0x100, BASE + 0x10, EXIDX_CANTUNWIND);
        // Only 4 bytes remain after the record; the candidate at 0x100
        // would still be reading when input ends.
        assert_eq!(
            scan_index_section(&image, BASE, 0, FUNC_ALIGN, SECT_ALIGN),
            None
        );
    }

    #[test]
    fn scanner_requires_zero_padding() {
        let mut image = vec![0xE1u8; 0x120];
        put_record(&mut image, 0x100, BASE + 0x10, EXIDX_CANTUNWIND);
        image[0x108..0x110].fill(0xCC);
        assert_eq!(
            scan_index_section(&image, BASE, 0, FUNC_ALIGN, SECT_ALIGN),
            None
        );
    }

    #[test]
    fn empty_scan_reports_end_of_zero_run() {
        let mut image = vec![0xFFu8; 0x40];
        image[0x10..0x30].fill(0);
        assert_eq!(scan_empty_index_section(&image, 0, SECT_ALIGN), Some(0x30));
    }

    #[test]
    fn empty_scan_runs_to_end_of_input() {
        let image = vec![0u8; 0x30];
        assert_eq!(scan_empty_index_section(&image, 0, SECT_ALIGN), Some(0x30));
    }

    #[test]
    fn empty_scan_without_zero_window_fails() {
        let image = vec![0xFFu8; 0x40];
        assert_eq!(scan_empty_index_section(&image, 0, SECT_ALIGN), None);
    }
}
