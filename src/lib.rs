//! Firmware dump to ELF converter library.
//!
//! This library provides the core components of the `bin2elf` converter.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `addr`: prel31 and alignment arithmetic.
//! - `exidx`: exception index table scanning.
//! - `layout`: section layout resolution and reconciliation.
//! - `template`: ELF template descriptors.
//! - `convert`: conversion orchestration.
//! - `writer`: ELF serialization.

pub mod addr;
pub mod config;
pub mod convert;
pub mod error;
pub mod exidx;
pub mod layout;
pub mod template;
pub mod writer;

pub use error::{Error, Result};
