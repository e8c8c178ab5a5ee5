// SPDX-License-Identifier: BSD-3-Clause

//! Engine errors.

/// All errors the pipeline engine can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Shared-memory failure; fatal for the owning process.
    #[error("shared memory: {0}")]
    Shmem(#[from] como_shmem::Error),

    /// Bus failure toward a peer process.
    #[error("ipc: {0}")]
    Ipc(#[from] como_ipc::Error),

    /// Packet model failure (templates, filters).
    #[error("packet model: {0}")]
    Pkt(#[from] como_pkt::Error),

    /// Storage failure while appending or reading records.
    #[error("storage: {0}")]
    Storage(#[from] como_storage::Error),

    /// A module callback failed; the module gets disabled.
    #[error("module `{module}`: {source}")]
    Module {
        /// The module's configured name.
        module: String,
        /// The callback failure.
        #[source]
        source: ModuleError,
    },

    /// A sniffer driver failed to start or read.
    #[error("sniffer `{sniffer}`: {reason}")]
    Sniffer {
        /// The sniffer's configured name.
        sniffer: String,
        /// Driver-reported reason.
        reason: String,
    },

    /// A module or sniffer kind has no registered implementation.
    #[error("no {kind} implementation registered under `{name}`")]
    UnknownKind {
        /// `"module"` or `"sniffer"`.
        kind: &'static str,
        /// The unresolvable kind name.
        name: String,
    },

    /// No sniffer is compatible with a module's input metadesc.
    #[error("module `{module}` matches no configured sniffer")]
    NoCompatibleSniffer {
        /// The module left without input.
        module: String,
    },

    /// The engine was driven in an impossible way (bad client id, ack for
    /// an unknown batch); logged and the offending peer dropped.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What was violated.
        reason: String,
    },
}

/// Failures raised by module callbacks.
#[derive(thiserror::Error, Debug)]
pub enum ModuleError {
    /// `init` rejected its arguments.
    #[error("bad argument `{arg}`: {reason}")]
    BadArg {
        /// Argument name.
        arg: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `store` could not serialize a record.
    #[error("store failed: {0}")]
    Store(String),

    /// `load` met bytes it does not recognize.
    #[error("load failed: {0}")]
    Load(String),

    /// `init` declared an inconsistent property set.
    #[error("contract violation: {0}")]
    Contract(String),
}
