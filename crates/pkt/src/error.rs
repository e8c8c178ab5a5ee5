// SPDX-License-Identifier: BSD-3-Clause

//! Errors for the packet model.

/// All errors that can occur while parsing packets, templates or filters.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A packet descriptor could not be decoded from its serialized form.
    #[error("truncated packet descriptor: need {need} bytes, have {have}")]
    TruncatedDescriptor {
        /// Bytes required by the fixed descriptor layout.
        need: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// A metadesc template string does not follow the `link:l2:l3:l4` form.
    #[error("invalid metadesc template `{template}`: {reason}")]
    InvalidTemplate {
        /// The offending template text.
        template: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A layer name is not known at the given layer.
    #[error("unknown protocol `{name}` at layer {layer}")]
    UnknownProtocol {
        /// The protocol name that failed to resolve.
        name: String,
        /// The layer position (`link`, `l2`, `l3`, `l4`).
        layer: &'static str,
    },

    /// A filter expression failed to parse.
    #[error("invalid filter `{filter}` at offset {at}: {reason}")]
    InvalidFilter {
        /// The filter source text.
        filter: String,
        /// Byte offset of the failure.
        at: usize,
        /// Why parsing stopped.
        reason: String,
    },

    /// A pktmeta entry would not fit the declared bounds.
    #[error("pktmeta entry `{name}` too large ({len} bytes)")]
    PktMetaTooLarge {
        /// Entry name.
        name: String,
        /// Requested value length.
        len: usize,
    },
}
