// SPDX-License-Identifier: BSD-3-Clause

//! Semantic checks performed once after parsing.

use std::collections::HashSet;

use crate::error::Error;
use crate::model::Config;

const MIN_MEMORY: u64 = 1024 * 1024;
const MIN_SEGMENT: u64 = 4096;

impl Config {
    /// Rejects configurations that would fail at runtime anyway.
    pub fn validate(&self) -> Result<(), Error> {
        if self.memory < MIN_MEMORY {
            return Err(Error::Invalid {
                reason: format!("memory must be at least {MIN_MEMORY} bytes, got {}", self.memory),
            });
        }
        if self.memory > u32::MAX as u64 {
            return Err(Error::Invalid {
                reason: "memory larger than 4 GiB cannot be addressed by 32-bit offsets".to_owned(),
            });
        }
        if self.storage.segment_size < MIN_SEGMENT {
            return Err(Error::Invalid {
                reason: format!(
                    "segment_size must be at least {MIN_SEGMENT} bytes, got {}",
                    self.storage.segment_size
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.capture.client_share_threshold) {
            return Err(Error::Invalid {
                reason: "client_share_threshold must lie in [0, 1]".to_owned(),
            });
        }
        if !(0.0..=1.0).contains(&self.capture.module_quota) {
            return Err(Error::Invalid { reason: "module_quota must lie in [0, 1]".to_owned() });
        }
        if self.capture.batch_max_pkts == 0 {
            return Err(Error::Invalid { reason: "batch_max_pkts must be positive".to_owned() });
        }

        let mut seen = HashSet::new();
        for s in &self.sniffers {
            if !seen.insert(s.name.as_str()) {
                return Err(Error::DuplicateName { kind: "sniffer", name: s.name.clone() });
            }
        }
        let mut seen = HashSet::new();
        for m in &self.modules {
            if !seen.insert(m.name.as_str()) {
                return Err(Error::DuplicateName { kind: "module", name: m.name.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use crate::error::Error;
    use crate::model::Config;

    #[test]
    fn tiny_memory_is_rejected() {
        let err = Config::from_yaml("memory: 1024\nstorage:\n  basedir: /tmp\n").unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }));
    }

    #[test]
    fn duplicate_module_names_are_rejected() {
        let err = Config::from_yaml(
            "storage:\n  basedir: /tmp\nmodules:\n  - name: counter\n  - name: counter\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "module", .. }));
    }

    #[test]
    fn bad_share_threshold_is_rejected() {
        let err = Config::from_yaml(
            "storage:\n  basedir: /tmp\ncapture:\n  client_share_threshold: 1.5\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }));
    }
}
