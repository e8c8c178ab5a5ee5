// SPDX-License-Identifier: BSD-3-Clause

//! Reference measurement modules.
//!
//! Three members of the family, covering the three shapes of the module
//! contract: `counter` (one record per interval, no export table),
//! `topports` (export-side aggregation with a sorted top-N walk) and
//! `trace` (variable-length per-packet records with replay).

pub mod counter;
pub mod topports;
pub mod trace;

use como_engine::ModuleRegistry;

/// Registers every built-in module kind.
pub fn register_builtins(registry: &mut ModuleRegistry) {
    registry.register("counter", || Box::new(counter::Counter::default()));
    registry.register("topports", || Box::new(topports::TopPorts::default()));
    registry.register("trace", || Box::new(trace::Trace::default()));
}

pub(crate) fn parse_arg<T: std::str::FromStr>(
    args: &std::collections::HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, como_engine::error::ModuleError> {
    match args.get(name) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| como_engine::error::ModuleError::BadArg {
            arg: name.to_owned(),
            reason: format!("`{v}` did not parse"),
        }),
    }
}
