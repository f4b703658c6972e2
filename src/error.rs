//! Conversion error types.
//!
//! Every fatal condition maps to one variant naming the stage and the
//! section that triggered it. Warnings (ambiguous scanner matches, size
//! clamps) are not errors; they are logged and processing continues.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Neither the entry scanner nor the empty-region fallback found a
    /// plausible location for the section.
    #[error("no matches found for section '{section}' in the input image")]
    SectionNotFound { section: String },

    /// A region has no room to exist given its neighbors.
    #[error("no place for section '{section}' before section '{anchor}'")]
    NoSpace { section: String, anchor: String },

    /// The configured address space cannot fit the highest section.
    #[error("address space length too small to fit section '{section}'")]
    AddressSpaceTooSmall { section: String },

    /// Section addresses contradict each other (a lower-ordered section
    /// starts above the next one).
    #[error("section addresses lead to negative distance after '{section}'")]
    NegativeGap { section: String },

    /// The template has no descriptor for a resolved section, and the
    /// name carries no numeric suffix to clone a base descriptor from.
    #[error("template has no section '{section}' to update or clone")]
    TemplateMismatch { section: String },

    /// The image holds fewer bytes than a section's resolved size.
    #[error(
        "could not read {size:#x} bytes for section '{section}' at image position {offset:#x}"
    )]
    ShortRead {
        section: String,
        offset: u32,
        size: u32,
    },

    /// The template file cannot be used (wrong class, endianness or
    /// machine).
    #[error("unsupported template: {0}")]
    Template(String),

    #[error(transparent)]
    Object(#[from] object::read::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
