// SPDX-License-Identifier: BSD-3-Clause

//! The module callback contract.
//!
//! A module is a user-supplied measurement unit. The core owns the flow
//! records (fixed-size byte spans allocated per the sizes declared at
//! init) and the tables they live in; the module owns their meaning. The
//! capture side of the contract is `check`/`hash`/`matches`/`update`, the
//! export side `ematch`/`export`/`action`/`store`, and the query side
//! `load`/`print`/`replay`.
//!
//! Records serialized by `store` are self-describing byte sequences in
//! network byte order; `load` is their exact inverse and is the only way
//! the core ever finds record boundaries in a stream.

use std::collections::HashMap;

use bitflags::bitflags;
use bytes::BytesMut;
use como_pkt::{Filter, Metadesc, PktView, Timestamp};

use crate::error::{Error, ModuleError};

bitflags! {
    /// What to do with one export record, as decided by `action`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Action: u32 {
        /// Serialize the record with `store` and append it to the stream.
        const STORE = 1 << 0;
        /// Drop the record from the export table afterwards.
        const DISCARD = 1 << 1;
        /// Stop walking the table for this interval.
        const STOP = 1 << 2;
    }
}

/// Outcome of a capture-side `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// The record absorbed the packet.
    Ok,
    /// The record cannot take more; flush the module's table now.
    Full,
}

/// Static properties a module declares from `init`.
#[derive(Debug, Clone)]
pub struct ModuleInit {
    /// What packet shapes the module can consume.
    pub indesc: Metadesc,
    /// Size of one capture-side flow record.
    pub ca_record_size: usize,
    /// Size of one export-side record; zero when capture records are
    /// stored directly.
    pub ex_record_size: usize,
    /// Flush interval; zero falls back to the configured default.
    pub flush_ivl: Timestamp,
    /// When set, `action` may visit records out of insertion order;
    /// without it the walk is strictly insertion-ordered.
    pub flexible_flush: bool,
    /// When set, the export table is sorted with `compare` before each
    /// `action` walk (top-N style modules). Sorting reorders the walk, so
    /// this requires `flexible_flush`; declaring it alone is rejected at
    /// registration.
    pub sorted_export: bool,
}

/// Phases of query printing, mirroring the three ways the query engine
/// drives `print`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintPhase {
    /// Before the first record.
    Header,
    /// After the last record.
    Footer,
}

/// The callback table. Optional callbacks have defaults that make the
/// module behave like the simplest member of its family.
pub trait Module {
    /// Parses arguments and declares sizes, metadesc and intervals.
    fn init(&mut self, args: &HashMap<String, String>) -> Result<ModuleInit, ModuleError>;

    /// Early packet veto, after the filter and before the flow lookup.
    fn check(&self, _pkt: &PktView<'_>) -> bool {
        true
    }

    /// Flow key for the packet. Equal keys land in the same table bucket.
    fn hash(&self, _pkt: &PktView<'_>) -> u64 {
        0
    }

    /// True when the packet belongs to the flow held in `rec` (resolves
    /// hash collisions).
    fn matches(&self, _pkt: &PktView<'_>, _rec: &[u8]) -> bool {
        true
    }

    /// Folds one packet into its flow record. `is_new` is set when the
    /// record was freshly allocated (zeroed) for this packet.
    fn update(&mut self, pkt: &PktView<'_>, rec: &mut [u8], is_new: bool) -> UpdateResult;

    /// True when capture record `rec` merges into export record `ex`.
    /// Only consulted for modules with an export table.
    fn ematch(&self, _ex: &[u8], _rec: &[u8]) -> bool {
        true
    }

    /// Merges a capture record into its export record.
    fn export(&mut self, _ex: &mut [u8], _rec: &[u8], _is_new: bool) {}

    /// Orders two export records for the pre-`action` sort; consulted
    /// only when the module declares `sorted_export`.
    fn compare(&self, _a: &[u8], _b: &[u8]) -> std::cmp::Ordering {
        std::cmp::Ordering::Equal
    }

    /// Decides the fate of one export record. `count` is the record's
    /// position in the current walk.
    fn action(&mut self, _ex: &[u8], _ivl: Timestamp, _now: Timestamp, _count: usize) -> Action {
        Action::STORE | Action::DISCARD
    }

    /// Serializes one record (capture-side when no export table exists,
    /// export-side otherwise) into `buf`, network byte order.
    fn store(&mut self, rec: &[u8], buf: &mut BytesMut) -> Result<(), ModuleError>;

    /// Parses the head of `buf` as one stored record, returning its
    /// serialized length and timestamp.
    fn load(&self, buf: &[u8]) -> Result<(usize, Timestamp), ModuleError>;

    /// Renders the header or footer of a query response.
    fn print_phase(&mut self, _phase: PrintPhase, _args: &[String]) -> String {
        String::new()
    }

    /// Renders one stored record for a query response.
    fn print(&mut self, _rec: &[u8]) -> String {
        String::new()
    }

    /// Regenerates a packet stream from a stored record, for modules that
    /// support being replayed into other modules.
    fn replay(&self, _rec: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Factory function producing a fresh, uninitialized module instance.
pub type ModuleFactory = fn() -> Box<dyn Module>;

/// Registry of module implementations by kind name.
///
/// Every process hosting module callbacks (capture, export, query
/// workers) builds the same registry at startup; module state never
/// crosses a process boundary, records do.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        ModuleRegistry::default()
    }

    /// Registers a factory under a kind name.
    pub fn register(&mut self, kind: &str, factory: ModuleFactory) {
        let _ = self.factories.insert(kind.to_owned(), factory);
    }

    /// Instantiates a module by kind.
    pub fn build(&self, kind: &str) -> Result<Box<dyn Module>, Error> {
        self.factories
            .get(kind)
            .map(|f| f())
            .ok_or_else(|| Error::UnknownKind { kind: "module", name: kind.to_owned() })
    }

    /// Registered kind names.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Lifecycle status of a configured module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Configured but not yet initialized.
    Loading,
    /// Receiving packets.
    Active,
    /// Removed from delivery after an error or a supervisor command;
    /// state and streams remain queryable.
    Disabled,
}

/// A module as the engine carries it: instance, declared properties and
/// the canonicalized filter.
pub struct ModuleHandle {
    /// Dense module id (position in the configuration).
    pub id: u32,
    /// Configured name.
    pub name: String,
    /// Output stream name.
    pub output: String,
    /// The instance.
    pub module: Box<dyn Module>,
    /// Properties declared by `init`.
    pub init: ModuleInit,
    /// The packet filter, canonicalized.
    pub filter: Filter,
    /// Current status.
    pub status: ModuleStatus,
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("output", &self.output)
            .field("init", &self.init)
            .field("filter", &self.filter)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl ModuleHandle {
    /// Initializes a module instance from its configuration.
    ///
    /// The filter comes from the configuration when given, otherwise it is
    /// projected from the module's input metadesc; either way the engine
    /// keeps only the canonical parsed form.
    pub fn build(
        registry: &ModuleRegistry,
        id: u32,
        spec: &como_config::ModuleSpec,
        default_flush_ivl: Timestamp,
    ) -> Result<Self, Error> {
        let mut module = registry.build(spec.kind())?;
        let mut init = module
            .init(&spec.args)
            .map_err(|source| Error::Module { module: spec.name.clone(), source })?;
        if init.sorted_export && !init.flexible_flush {
            // a sorted walk reorders action calls, which only
            // flexible-flush modules are allowed to see
            return Err(Error::Module {
                module: spec.name.clone(),
                source: ModuleError::Contract(
                    "sorted_export requires flexible_flush".to_owned(),
                ),
            });
        }
        if init.flush_ivl == Timestamp::ZERO {
            init.flush_ivl = default_flush_ivl;
        }
        let filter = match &spec.filter {
            Some(text) => Filter::parse(text)?,
            None => init.indesc.to_filter(),
        };
        Ok(ModuleHandle {
            id,
            name: spec.name.clone(),
            output: spec.output().to_owned(),
            module,
            init,
            filter,
            status: ModuleStatus::Active,
        })
    }

    /// True when the module wants this packet: filter, then `check`.
    #[must_use]
    pub fn wants(&self, pkt: &PktView<'_>) -> bool {
        self.status == ModuleStatus::Active
            && self.filter.matches(pkt)
            && self.module.check(pkt)
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::*;
    use crate::testing::PktCountModule;

    fn registry() -> ModuleRegistry {
        let mut r = ModuleRegistry::new();
        r.register("pktcount", || Box::new(PktCountModule::default()));
        r
    }

    fn spec(yaml: &str) -> como_config::ModuleSpec {
        let cfg = como_config::Config::from_yaml(yaml).unwrap();
        cfg.modules[0].clone()
    }

    #[test]
    fn build_projects_filter_from_metadesc() {
        let spec = spec("storage:\n  basedir: /tmp\nmodules:\n  - name: pktcount\n");
        let h = ModuleHandle::build(&registry(), 0, &spec, Timestamp::from_secs(1)).unwrap();
        assert_eq!(h.filter.to_string(), "ip and tcp");
        assert_eq!(h.init.flush_ivl, Timestamp::from_secs(1));
    }

    #[test]
    fn configured_filter_wins() {
        let spec = spec(
            "storage:\n  basedir: /tmp\nmodules:\n  - name: pktcount\n    filter: ip and udp\n",
        );
        let h = ModuleHandle::build(&registry(), 0, &spec, Timestamp::from_secs(1)).unwrap();
        assert_eq!(h.filter.to_string(), "ip and udp");
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let spec = spec("storage:\n  basedir: /tmp\nmodules:\n  - name: nosuch\n");
        let err = ModuleHandle::build(&registry(), 0, &spec, Timestamp::ZERO).unwrap_err();
        assert!(matches!(err, Error::UnknownKind { kind: "module", .. }));
    }

    /// A sorted walk is a reordered walk, so it is only available to
    /// modules that declared flexible flushing.
    #[test]
    fn sorted_export_without_flexible_flush_is_rejected() {
        #[derive(Default)]
        struct SortedOnly;
        impl Module for SortedOnly {
            fn init(
                &mut self,
                _args: &HashMap<String, String>,
            ) -> Result<ModuleInit, ModuleError> {
                Ok(ModuleInit {
                    indesc: Metadesc::any(),
                    ca_record_size: 8,
                    ex_record_size: 8,
                    flush_ivl: Timestamp::ZERO,
                    flexible_flush: false,
                    sorted_export: true,
                })
            }
            fn update(
                &mut self,
                _pkt: &PktView<'_>,
                _rec: &mut [u8],
                _is_new: bool,
            ) -> UpdateResult {
                UpdateResult::Ok
            }
            fn store(&mut self, _rec: &[u8], _buf: &mut BytesMut) -> Result<(), ModuleError> {
                Ok(())
            }
            fn load(&self, _buf: &[u8]) -> Result<(usize, Timestamp), ModuleError> {
                Ok((0, Timestamp::ZERO))
            }
        }

        let mut registry = ModuleRegistry::new();
        registry.register("sortedonly", || Box::new(SortedOnly));
        let spec = spec("storage:\n  basedir: /tmp\nmodules:\n  - name: sortedonly\n");
        let err = ModuleHandle::build(&registry, 0, &spec, Timestamp::from_secs(1)).unwrap_err();
        assert!(
            matches!(err, Error::Module { source: ModuleError::Contract(_), .. }),
            "{err}"
        );
    }
}
