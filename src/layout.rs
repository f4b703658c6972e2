//! Section layout resolution.
//!
//! The exception index anchor splits the image into code before it and
//! data after it; uninitialized regions chain past the stored data. The
//! settle passes here derive an address and size for every section,
//! honoring explicit overrides, and the reconciliation passes turn those
//! possibly-conflicting constraints into an ordered, non-overlapping
//! [`LayoutPlan`].

use tracing::{debug, info, warn};

use crate::config::SectionSpec;
use crate::error::{Error, Result};
use crate::exidx::{self, EXIDX_SECTION};

pub const TEXT_SECTION: &str = ".text";
pub const DATA_SECTION: &str = ".data";
pub const BSS_SECTION: &str = ".bss";

/// The primary `.bss` or a numbered sibling such as `.bss2`.
fn is_uninitialized_name(name: &str) -> bool {
    match name.strip_prefix(BSS_SECTION) {
        Some(rest) => rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// A numbered uninitialized sibling (`.bss2`, `.bss3`, ...).
fn is_bss_sibling(name: &str) -> bool {
    matches!(name.strip_prefix(BSS_SECTION),
        Some(rest) if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Content is stored in the image.
    Loaded,
    /// Only address and size are meaningful; nothing is read.
    Uninitialized,
}

/// A section whose placement is still being settled.
#[derive(Debug, Clone)]
struct Section {
    name: String,
    addr: Option<u32>,
    size: Option<u32>,
    kind: SectionKind,
}

/// A finalized section. Address and size are immutable once the
/// reconciler has emitted the plan.
#[derive(Debug, Clone)]
pub struct ResolvedSection {
    pub name: String,
    pub addr: u32,
    pub size: u32,
    pub kind: SectionKind,
    pub align: u32,
    pub file_pos: u32,
}

/// Ordered, reconciled section layout for one conversion run.
#[derive(Debug, Clone)]
pub struct LayoutPlan {
    pub sections: Vec<ResolvedSection>,
}

/// Settles section addresses and sizes around the exception index
/// anchor, then reconciles them into a [`LayoutPlan`].
pub struct Layout {
    base: u32,
    addr_space_len: u32,
    func_align: u32,
    sect_align: u32,
    sections: Vec<Section>,
}

impl Layout {
    /// Creates a layout seeded with the user's section overrides, which
    /// always take precedence over scanning and inference.
    pub fn new(
        base: u32,
        addr_space_len: u32,
        func_align: u32,
        sect_align: u32,
        overrides: &[SectionSpec],
    ) -> Self {
        let mut layout = Self {
            base,
            addr_space_len,
            func_align,
            sect_align,
            sections: Vec::new(),
        };
        for spec in overrides {
            let section = layout.entry(&spec.name);
            if spec.addr.is_some() {
                section.addr = spec.addr;
            }
            if spec.size.is_some() {
                section.size = spec.size;
            }
        }
        layout
    }

    /// Runs every settle pass and the reconciler over `image`.
    pub fn resolve(&mut self, image: &[u8]) -> Result<LayoutPlan> {
        debug!("searching for sections");
        let exidx = self.settle_index_section(image)?;
        self.settle_text(exidx.0)?;
        let data = self.settle_data(exidx, image.len())?;
        self.settle_bss(data)?;
        let order = self.section_order();
        self.backfill_sizes(&order)?;
        Ok(self.finish(&order))
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    fn entry(&mut self, name: &str) -> &mut Section {
        let idx = match self.index_of(name) {
            Some(i) => i,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    addr: None,
                    size: None,
                    kind: if is_uninitialized_name(name) {
                        SectionKind::Uninitialized
                    } else {
                        SectionKind::Loaded
                    },
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    fn addr_of(&self, name: &str) -> Option<u32> {
        self.sections.iter().find(|s| s.name == name).and_then(|s| s.addr)
    }

    fn size_of(&self, name: &str) -> Option<u32> {
        self.sections.iter().find(|s| s.name == name).and_then(|s| s.size)
    }

    /// Stores `base + pos` as the section's address, unless it falls
    /// outside the 32-bit space, in which case the section is left
    /// unplaced and will not be created.
    fn chain_addr(&mut self, name: &str, pos: i64) {
        let addr = self.base as i64 + pos;
        match u32::try_from(addr) {
            Ok(addr) => {
                self.entry(name).addr = Some(addr);
            }
            Err(_) => {
                warn!(
                    "section '{}' at {:#x} is beyond the address space limit, not created",
                    name, addr
                );
            }
        }
    }

    /// Finds the exception index section, or takes it from an override.
    /// Returns its image position (relative to base) and byte length.
    fn settle_index_section(&mut self, image: &[u8]) -> Result<(i64, u32)> {
        let mut default_len = self.sect_align;
        let addr = match self.addr_of(EXIDX_SECTION) {
            Some(addr) => addr,
            None => {
                let scanned = exidx::scan_index_section(
                    image,
                    self.base,
                    0,
                    self.func_align,
                    self.sect_align,
                )
                .or_else(|| {
                    exidx::scan_index_section(
                        image,
                        self.base,
                        0,
                        self.func_align,
                        self.sect_align >> 1,
                    )
                })
                .or_else(|| {
                    warn!(
                        "real '{}' section not found, looking for an empty one; \
                         consider providing its address manually",
                        EXIDX_SECTION
                    );
                    exidx::scan_empty_index_section(image, 0, self.sect_align)
                        .map(|pos| (pos, 0))
                })
                .ok_or_else(|| Error::SectionNotFound {
                    section: EXIDX_SECTION.to_string(),
                })?;
                default_len = scanned.1 as u32;
                let addr = self.base.checked_add(scanned.0 as u32).ok_or_else(|| {
                    Error::AddressSpaceTooSmall {
                        section: EXIDX_SECTION.to_string(),
                    }
                })?;
                self.entry(EXIDX_SECTION).addr = Some(addr);
                addr
            }
        };
        let section = self.entry(EXIDX_SECTION);
        let len = *section.size.get_or_insert(default_len);
        debug!(
            "set '{}' section at mem addr {:#010x}, size {:#010x}",
            EXIDX_SECTION, addr, len
        );
        Ok((addr as i64 - self.base as i64, len))
    }

    /// The code region occupies everything from the image start up to
    /// the anchor. Nothing before the anchor can be inferred, so a code
    /// region with implausibly little room is a hard error.
    fn settle_text(&mut self, exidx_pos: i64) -> Result<()> {
        let addr = match self.addr_of(TEXT_SECTION) {
            Some(addr) => addr,
            None => {
                if exidx_pos <= self.func_align as i64 * 8 {
                    return Err(Error::NoSpace {
                        section: TEXT_SECTION.to_string(),
                        anchor: EXIDX_SECTION.to_string(),
                    });
                }
                let addr = self.base;
                self.entry(TEXT_SECTION).addr = Some(addr);
                addr
            }
        };
        let inferred = exidx_pos - (addr as i64 - self.base as i64);
        let section = self.entry(TEXT_SECTION);
        if section.size.is_none() {
            if inferred < 0 {
                return Err(Error::NegativeGap {
                    section: TEXT_SECTION.to_string(),
                });
            }
            section.size = Some(inferred as u32);
        }
        let size = self.size_of(TEXT_SECTION).unwrap_or(0);
        debug!(
            "set '{}' section at mem addr {:#010x}, size {:#010x}",
            TEXT_SECTION, addr, size
        );
        Ok(())
    }

    /// Initialized data starts right at the anchor's end, with no
    /// inserted alignment, and runs to end-of-image.
    fn settle_data(&mut self, exidx: (i64, u32), image_len: usize) -> Result<(i64, u32)> {
        let mut pos = exidx.0 + exidx.1 as i64;
        if let Some(addr) = self.addr_of(DATA_SECTION) {
            pos = addr as i64 - self.base as i64;
        } else {
            self.chain_addr(DATA_SECTION, pos);
        }
        let len = match self.size_of(DATA_SECTION) {
            Some(len) => len,
            None => {
                let len = (image_len as i64 - pos).clamp(0, u32::MAX as i64) as u32;
                self.entry(DATA_SECTION).size = Some(len);
                len
            }
        };
        debug!(
            "set '{}' section at mem addr {:#010x}, size {:#010x}",
            DATA_SECTION,
            self.base as i64 + pos,
            len
        );
        Ok((pos, len))
    }

    /// The primary uninitialized region follows the stored data; its
    /// default size fills the rest of the configured address space.
    /// Numbered siblings chain after it in declaration order and need an
    /// explicit size, since nothing is read from the image for them.
    fn settle_bss(&mut self, data: (i64, u32)) -> Result<()> {
        let (mut pos, mut len) = data;
        pos += len as i64;
        if let Some(addr) = self.addr_of(BSS_SECTION) {
            pos = addr as i64 - self.base as i64;
        } else {
            self.chain_addr(BSS_SECTION, pos);
        }
        len = match self.size_of(BSS_SECTION) {
            Some(len) => len,
            None => {
                let len = (self.addr_space_len as i64 - pos).clamp(0, u32::MAX as i64) as u32;
                self.entry(BSS_SECTION).size = Some(len);
                len
            }
        };
        debug!(
            "set '{}' section at mem addr {:#010x}, size {:#010x}",
            BSS_SECTION,
            self.base as i64 + pos,
            len
        );
        let siblings: Vec<String> = self
            .sections
            .iter()
            .filter(|s| is_bss_sibling(&s.name) && s.size.is_some())
            .map(|s| s.name.clone())
            .collect();
        for name in siblings {
            pos += len as i64;
            if let Some(addr) = self.addr_of(&name) {
                pos = addr as i64 - self.base as i64;
            } else {
                self.chain_addr(&name, pos);
            }
            len = self.size_of(&name).unwrap_or(0);
            debug!(
                "set '{}' section at mem addr {:#010x}, size {:#010x}",
                name,
                self.base as i64 + pos,
                len
            );
        }
        Ok(())
    }

    /// Orders placed sections by address. Sections sharing an address
    /// are emitted with the zero-sized ones first, so the container's
    /// section order stays deterministic.
    fn section_order(&self) -> Vec<usize> {
        let mut addrs: Vec<u32> = self.sections.iter().filter_map(|s| s.addr).collect();
        addrs.sort_unstable();
        addrs.dedup();
        let mut order = Vec::new();
        for addr in addrs {
            for (i, section) in self.sections.iter().enumerate() {
                if section.addr == Some(addr) && section.size == Some(0) {
                    order.push(i);
                }
            }
            for (i, section) in self.sections.iter().enumerate() {
                if section.addr == Some(addr) && !order.contains(&i) {
                    order.push(i);
                }
            }
        }
        order
    }

    /// Back-fills missing sizes from the gap to the next section (or to
    /// the end of the address space for the highest one) and clamps
    /// explicit sizes that would overlap a neighbor.
    fn backfill_sizes(&mut self, order: &[usize]) -> Result<()> {
        let limit = u32::MAX as i64;
        let mut next_addr = self.base as i64 + self.addr_space_len as i64 + 1;
        for (k, &i) in order.iter().enumerate().rev() {
            let name = self.sections[i].name.clone();
            let addr = match self.sections[i].addr {
                Some(addr) => addr as i64,
                None => continue,
            };
            let mut budget = next_addr - addr;
            if budget < 0 {
                return Err(if k == order.len() - 1 {
                    Error::AddressSpaceTooSmall { section: name }
                } else {
                    Error::NegativeGap { section: name }
                });
            }
            // Leave one alignment unit of headroom below the top of the
            // 32-bit space.
            if addr + budget > limit + 1 - self.sect_align as i64 {
                budget = limit + 1 - self.sect_align as i64 - addr;
                if budget < 0 {
                    return Err(Error::NegativeGap { section: name });
                }
            }
            match self.sections[i].size {
                Some(size) if size as i64 > budget => {
                    warn!(
                        "section '{}' size reduced to {:#x} due to overlapping",
                        name, budget
                    );
                    self.sections[i].size = Some(budget as u32);
                }
                None => self.sections[i].size = Some(budget as u32),
                _ => {}
            }
            next_addr = addr;
        }
        Ok(())
    }

    /// Derives each section's natural alignment and file position and
    /// freezes the plan.
    fn finish(&mut self, order: &[usize]) -> LayoutPlan {
        let mut sections = Vec::with_capacity(order.len());
        for &i in order {
            let section = &self.sections[i];
            let (addr, size) = match (section.addr, section.size) {
                (Some(addr), Some(size)) => (addr, size),
                _ => continue,
            };
            // Keep the alignment near the expectation, shrinking until
            // both the address and the size are multiples of it.
            let mut align = self.sect_align << 1;
            while addr % align != 0 {
                align >>= 1;
            }
            while size % align != 0 {
                align >>= 1;
            }
            info!("section '{}' alignment set to {:#04x}", section.name, align);
            // The image is a linear dump, so the file position is just
            // the address shifted down by the base.
            let file_pos = (addr as i64 - self.base as i64).max(0) as u32;
            info!(
                "section '{}' file position set to {:#010x}",
                section.name, file_pos
            );
            sections.push(ResolvedSection {
                name: section.name.clone(),
                addr,
                size,
                kind: section.kind,
                align,
                file_pos,
            });
        }
        LayoutPlan { sections }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x0100_0000;

    fn spec(name: &str, addr: Option<u32>, size: Option<u32>) -> SectionSpec {
        SectionSpec {
            name: name.to_string(),
            addr,
            size,
        }
    }

    fn layout(overrides: &[SectionSpec]) -> Layout {
        Layout::new(BASE, 0x0200_0000, 2, 0x10, overrides)
    }

    #[test]
    fn zero_sized_sections_order_first_at_shared_address() {
        let l = layout(&[
            spec(".data", Some(BASE + 0x100), Some(0x10)),
            spec(".ARM.exidx", Some(BASE + 0x100), Some(0)),
        ]);
        let order = l.section_order();
        let names: Vec<&str> = order.iter().map(|&i| l.sections[i].name.as_str()).collect();
        assert_eq!(names, [".ARM.exidx", ".data"]);
    }

    #[test]
    fn backfill_fills_missing_and_clamps_overlap() {
        let mut l = Layout::new(0, 0x1000, 2, 0x10, &[]);
        l.entry("a").addr = Some(0x100);
        l.entry("b").addr = Some(0x200);
        l.entry("b").size = Some(0x300);
        l.entry("c").addr = Some(0x400);
        l.entry("c").size = Some(0x10);
        let order = l.section_order();
        l.backfill_sizes(&order).unwrap();
        assert_eq!(l.size_of("a"), Some(0x100));
        assert_eq!(l.size_of("b"), Some(0x200));
        assert_eq!(l.size_of("c"), Some(0x10));
    }

    #[test]
    fn backfill_rejects_section_past_address_space() {
        let mut l = Layout::new(0, 0x1000, 2, 0x10, &[]);
        l.entry("a").addr = Some(0x2000);
        let order = l.section_order();
        assert!(matches!(
            l.backfill_sizes(&order),
            Err(Error::AddressSpaceTooSmall { .. })
        ));
    }

    #[test]
    fn alignment_inference_halves_until_it_fits() {
        let mut l = layout(&[]);
        l.entry("a").addr = Some(BASE + 0x1000);
        l.entry("a").size = Some(0x20);
        l.entry("b").addr = Some(BASE + 0x1028);
        l.entry("b").size = Some(0x8);
        let order = l.section_order();
        let plan = l.finish(&order);
        assert_eq!(plan.sections[0].align, 0x20);
        assert_eq!(plan.sections[1].align, 0x8);
        assert_eq!(plan.sections[0].file_pos, 0x1000);
    }

    #[test]
    fn resolve_with_empty_index_fallback() {
        // No valid records anywhere; the zero block between 0x40 and
        // 0x80 marks the code/data boundary.
        let mut image = vec![0xFFu8; 0xC0];
        image[0x40..0x80].fill(0);
        let mut l = layout(&[]);
        let plan = l.resolve(&image).unwrap();
        let find = |name: &str| plan.sections.iter().find(|s| s.name == name).unwrap();
        let exidx = find(EXIDX_SECTION);
        assert_eq!((exidx.addr, exidx.size), (BASE + 0x80, 0));
        let text = find(TEXT_SECTION);
        assert_eq!((text.addr, text.size), (BASE, 0x80));
        let data = find(DATA_SECTION);
        assert_eq!((data.addr, data.size), (BASE + 0x80, 0x40));
        let bss = find(BSS_SECTION);
        assert_eq!((bss.addr, bss.size), (BASE + 0xC0, 0x0200_0000 - 0xC0));
        assert_eq!(bss.kind, SectionKind::Uninitialized);
    }

    #[test]
    fn bss_siblings_chain_in_declaration_order() {
        let mut image = vec![0xFFu8; 0x80];
        image[0x40..0x80].fill(0);
        let mut l = Layout::new(
            BASE,
            0x1000,
            2,
            0x10,
            &[
                spec(".bss", None, Some(0x100)),
                spec(".bss2", None, Some(0x80)),
                spec(".bss3", Some(BASE + 0x800), Some(0x50)),
            ],
        );
        let plan = l.resolve(&image).unwrap();
        let find = |name: &str| plan.sections.iter().find(|s| s.name == name).unwrap();
        assert_eq!(find(".bss").addr, BASE + 0x80);
        assert_eq!(find(".bss2").addr, BASE + 0x180);
        assert_eq!((find(".bss3").addr, find(".bss3").size), (BASE + 0x800, 0x50));
    }

    #[test]
    fn text_needs_room_before_the_anchor() {
        let mut l = layout(&[spec(".ARM.exidx", Some(BASE + 0x10), Some(0x10))]);
        let image = vec![0u8; 0x40];
        assert!(matches!(l.resolve(&image), Err(Error::NoSpace { .. })));
    }
}
