//! Centralized configuration and builder for ObexDB.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - ObexConfig::from_env() reads OBX_* environment variables.
//! - Builder-style setters for programmatic use; Store consumes the config.
//!
//! Policy knobs that change observable behavior:
//! - iter_policy: what happens to an open extent/range iterator when a commit
//!   changes the index it is bound to. `Invalidate` makes the next call fail
//!   with a usage error; `Exhaust` makes the iterator behave as drained.
//! - evict_on_commit: move CLEAN handles to HOLLOW after a successful commit.
//! - retain_primitives: on eviction keep primitive field values, discard only
//!   reference fields.

use std::fmt;

/// Behavior of open iterators whose bound index was changed by a commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterPolicy {
    /// hasNext/next fail with a usage error ("invalidated by commit").
    Invalidate,
    /// The iterator silently behaves as exhausted.
    Exhaust,
}

#[derive(Clone, Debug)]
pub struct ObexConfig {
    /// fsync данных сегментов при записи страниц коммита.
    /// Env: OBX_DATA_FSYNC (default true — у стора нет WAL, durability на страницах+meta)
    pub data_fsync: bool,

    /// Политика итераторов при пересечении коммита.
    /// Env: OBX_ITER_POLICY = "invalidate" | "exhaust" (default invalidate)
    pub iter_policy: IterPolicy,

    /// Переводить CLEAN handle'ы в HOLLOW после commit.
    /// Env: OBX_EVICT_ON_COMMIT (default false)
    pub evict_on_commit: bool,

    /// При эвикции сохранять примитивные поля (сбрасываются только ссылки).
    /// Env: OBX_RETAIN_PRIMITIVES (default false)
    pub retain_primitives: bool,
}

impl Default for ObexConfig {
    fn default() -> Self {
        Self {
            data_fsync: true,
            iter_policy: IterPolicy::Invalidate,
            evict_on_commit: false,
            retain_primitives: false,
        }
    }
}

impl ObexConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("OBX_DATA_FSYNC") {
            cfg.data_fsync = parse_bool(&v).unwrap_or(cfg.data_fsync);
        }
        if let Ok(v) = std::env::var("OBX_ITER_POLICY") {
            match v.trim().to_ascii_lowercase().as_str() {
                "invalidate" => cfg.iter_policy = IterPolicy::Invalidate,
                "exhaust" => cfg.iter_policy = IterPolicy::Exhaust,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("OBX_EVICT_ON_COMMIT") {
            cfg.evict_on_commit = parse_bool(&v).unwrap_or(cfg.evict_on_commit);
        }
        if let Ok(v) = std::env::var("OBX_RETAIN_PRIMITIVES") {
            cfg.retain_primitives = parse_bool(&v).unwrap_or(cfg.retain_primitives);
        }

        cfg
    }

    pub fn data_fsync(mut self, on: bool) -> Self {
        self.data_fsync = on;
        self
    }

    pub fn iter_policy(mut self, p: IterPolicy) -> Self {
        self.iter_policy = p;
        self
    }

    pub fn evict_on_commit(mut self, on: bool) -> Self {
        self.evict_on_commit = on;
        self
    }

    pub fn retain_primitives(mut self, on: bool) -> Self {
        self.retain_primitives = on;
        self
    }
}

impl fmt::Display for ObexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObexConfig {{ data_fsync: {}, iter_policy: {:?}, evict_on_commit: {}, retain_primitives: {} }}",
            self.data_fsync, self.iter_policy, self.evict_on_commit, self.retain_primitives
        )
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = ObexConfig::default()
            .data_fsync(false)
            .iter_policy(IterPolicy::Exhaust)
            .evict_on_commit(true)
            .retain_primitives(true);
        assert!(!cfg.data_fsync);
        assert_eq!(cfg.iter_policy, IterPolicy::Exhaust);
        assert!(cfg.evict_on_commit);
        assert!(cfg.retain_primitives);
    }
}
