//! Conversion orchestration.
//!
//! Ties the pipeline together: resolve the section layout from the
//! image, then apply it onto the template (addresses, alignments,
//! sizes, payload bytes and the entry point). The caller decides whether
//! the patched template is serialized; dry runs are not.

use tracing::{debug, info};

use crate::config::SectionSpec;
use crate::error::{Error, Result};
use crate::layout::{Layout, LayoutPlan};
use crate::template::ElfTemplate;

/// Numeric knobs for one conversion run.
#[derive(Debug, Clone, Copy)]
pub struct ConvertParams {
    pub base_addr: u32,
    pub addr_space_len: u32,
    pub func_align: u32,
    pub sect_align: u32,
}

/// Single-pass converter; owns nothing across runs.
pub struct Converter<'a> {
    image: &'a [u8],
    params: ConvertParams,
    overrides: Vec<SectionSpec>,
}

impl<'a> Converter<'a> {
    pub fn new(image: &'a [u8], params: ConvertParams, overrides: &[SectionSpec]) -> Self {
        Self {
            image,
            params,
            overrides: overrides.to_vec(),
        }
    }

    /// Locates the anchor section and derives the full layout.
    pub fn resolve(&self) -> Result<LayoutPlan> {
        info!("memory base address set to {:#010x}", self.params.base_addr);
        let mut layout = Layout::new(
            self.params.base_addr,
            self.params.addr_space_len,
            self.params.func_align,
            self.params.sect_align,
            &self.overrides,
        );
        layout.resolve(self.image)
    }

    /// Applies a resolved layout onto the template.
    pub fn apply(&self, plan: &LayoutPlan, template: &mut ElfTemplate) -> Result<()> {
        template.entry = self.params.base_addr;
        for section in &plan.sections {
            let idx = template.resolve_descriptor(&section.name)?;
            info!(
                "preparing ELF section '{}' from image position {:#010x}",
                section.name, section.file_pos
            );
            let descriptor = &mut template.sections[idx];
            descriptor.addr = section.addr;
            descriptor.align = section.align;
            if descriptor.is_uninitialized() {
                // Content is not stored in the image; only the size is
                // carried into the container.
                descriptor.size = section.size;
            } else if section.size == 0 {
                descriptor.data.clear();
                descriptor.size = 0;
            } else {
                let start = section.file_pos as usize;
                let bytes = start
                    .checked_add(section.size as usize)
                    .and_then(|end| self.image.get(start..end))
                    .ok_or_else(|| Error::ShortRead {
                        section: section.name.clone(),
                        offset: section.file_pos,
                        size: section.size,
                    })?;
                descriptor.data = bytes.to_vec();
                descriptor.size = section.size;
            }
        }
        Ok(())
    }

    /// Full conversion: resolve, then patch the template. Returns the
    /// plan so dry runs can report the layout without writing anything.
    pub fn run(&self, template: &mut ElfTemplate) -> Result<LayoutPlan> {
        let plan = self.resolve()?;
        debug!("updating entry point and section headers");
        self.apply(&plan, template)?;
        Ok(plan)
    }
}
