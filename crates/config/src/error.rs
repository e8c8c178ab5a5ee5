// SPDX-License-Identifier: BSD-3-Clause

//! Configuration errors.

/// All errors the configuration layer can produce.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("cannot read configuration `{path}`: {source}")]
    Io {
        /// Path passed on the command line.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML document failed to deserialize.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The document deserialized but fails a semantic check.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What the validation pass objected to.
        reason: String,
    },

    /// Two sniffers or two modules share a name.
    #[error("duplicate {kind} name `{name}`")]
    DuplicateName {
        /// `"sniffer"` or `"module"`.
        kind: &'static str,
        /// The name that appears twice.
        name: String,
    },
}
