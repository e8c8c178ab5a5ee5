// SPDX-License-Identifier: BSD-3-Clause

//! Configuration model for the CoMo measurement core.
//!
//! The supervisor consumes one YAML document describing the shared memory
//! budget, the sniffers to attach, the modules to run and the storage
//! layout, validates it once, and hands read-only slices of it to each
//! child process. The configuration language itself (includes, macros,
//! CLI overrides) is out of scope; this is the resolved object.

pub mod byte_units;
pub mod error;
pub mod model;
pub mod validate;

pub use error::Error;
pub use model::{CaptureConfig, Config, ModuleSpec, QueryConfig, SnifferSpec, StorageConfig};
