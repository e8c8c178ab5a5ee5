// SPDX-License-Identifier: BSD-3-Clause

//! Supervisor errors.

/// All errors the supervisor can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration failure.
    #[error("config: {0}")]
    Config(#[from] como_config::Error),

    /// Engine failure in one of the stages.
    #[error("engine: {0}")]
    Engine(#[from] como_engine::Error),

    /// Storage failure.
    #[error("storage: {0}")]
    Storage(#[from] como_storage::Error),

    /// Bus failure.
    #[error("ipc: {0}")]
    Ipc(#[from] como_ipc::Error),

    /// Shared-memory failure at startup.
    #[error("shared memory: {0}")]
    Shmem(#[from] como_shmem::Error),

    /// Filesystem failure (run directory, child binary).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A stage thread panicked or a child process died unexpectedly.
    #[error("{role} stage failed: {reason}")]
    StageFailed {
        /// Which stage.
        role: &'static str,
        /// What happened.
        reason: String,
    },

    /// Storage kept crashing past its respawn budget.
    #[error("storage respawn budget of {budget} exhausted")]
    RespawnBudget {
        /// The configured budget.
        budget: u32,
    },

    /// A query referenced an unknown module.
    #[error("unknown module `{module}`")]
    UnknownModule {
        /// The requested module name.
        module: String,
    },
}
