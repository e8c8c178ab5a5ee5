// SPDX-License-Identifier: BSD-3-Clause

//! The supervisor.
//!
//! Owns the configuration, wires the pipeline and watches it. Stages boot
//! in reverse data-flow order (storage, then export, then capture) so
//! each child's downstream peer is listening before the child connects.
//! Two deployment shapes:
//!
//! - **inline**: each stage runs as a thread of this process with its own
//!   current-thread runtime, still talking through the bus and the shared
//!   arena. Offline trace runs and the test suite use this.
//! - **multiprocess**: each stage is a re-exec of the same binary with
//!   `--role`; the supervisor reaps children, restarts storage within a
//!   bounded budget and tears the pipeline down when capture or export
//!   dies (their loss means accumulating data loss).

pub mod error;
pub mod query;
pub mod roles;
pub mod supervisor;

pub use error::Error;
pub use supervisor::{PipelineReport, Supervisor};
