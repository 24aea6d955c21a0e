//! Dispatch configuration.
//!
//! One [`DispatchConfig`] is attached to every specialization table and is
//! shared by all nodes built from it. Values are resolved once, either from
//! code or from the environment, and are read without any per-call cost.

use std::env;

/// Default instance limit for specializations without an explicit limit.
pub const DEFAULT_LIMIT: usize = 3;

/// Default capacity of a node's packed state region, in bits.
pub const DEFAULT_STATE_CAPACITY_BITS: u32 = 256;

/// Default bound on consecutive rewrites within one `execute` call.
pub const DEFAULT_MAX_REWRITE_RETRIES: u32 = 16;

/// Configuration for specialization tables and the nodes built from them.
///
/// # Example
///
/// ```
/// use morph_core::DispatchConfig;
///
/// let config = DispatchConfig {
///     default_limit: 8,
///     ..Default::default()
/// };
/// assert_eq!(config.default_limit, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    // =========================================================================
    // Caching
    // =========================================================================
    /// Maximum cached instances per specialization when none is declared.
    ///
    /// Default: 3
    pub default_limit: usize,

    /// Maximum consecutive `rewrite_on` exclusions within a single call.
    ///
    /// A table whose rewrites chain longer than this is reported as
    /// `DispatchError::RewriteLimit` instead of looping.
    ///
    /// Default: 16
    pub max_rewrite_retries: u32,

    // =========================================================================
    // State Packing
    // =========================================================================
    /// Capacity of a node's packed state region in bits.
    ///
    /// Tables whose active/excluded bits plus inlined profile bits exceed
    /// this are rejected at build time.
    ///
    /// Default: 256
    pub state_capacity_bits: u32,

    /// Verify every masked state write keeps the provided bits.
    ///
    /// Default: enabled in debug builds
    pub verify_bits: bool,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Log every call-site state transition at `debug` level.
    ///
    /// Default: false
    pub trace_specialization: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            max_rewrite_retries: DEFAULT_MAX_REWRITE_RETRIES,
            state_capacity_bits: DEFAULT_STATE_CAPACITY_BITS,
            verify_bits: cfg!(debug_assertions),
            trace_specialization: false,
        }
    }
}

impl DispatchConfig {
    /// Configuration with every consistency check enabled.
    pub fn strict() -> Self {
        Self {
            verify_bits: true,
            trace_specialization: true,
            ..Default::default()
        }
    }

    /// Configuration for throughput: no write verification, no tracing.
    pub fn fast() -> Self {
        Self {
            verify_bits: false,
            trace_specialization: false,
            ..Default::default()
        }
    }

    /// Resolve configuration from the defaults overlaid with `MORPH_*`
    /// environment variables.
    ///
    /// - `MORPH_DEFAULT_LIMIT`: integer
    /// - `MORPH_STATE_BITS`: integer
    /// - `MORPH_VERIFY_BITS`: boolean
    /// - `MORPH_TRACE_SPECIALIZATION`: boolean
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(limit) = lookup("MORPH_DEFAULT_LIMIT").and_then(|v| parse_usize(&v)) {
            config.default_limit = limit.max(1);
        }
        if let Some(bits) = lookup("MORPH_STATE_BITS").and_then(|v| parse_usize(&v)) {
            config.state_capacity_bits = u32::try_from(bits).unwrap_or(u32::MAX);
        }
        if let Some(verify) = lookup("MORPH_VERIFY_BITS").and_then(|v| parse_bool(&v)) {
            config.verify_bits = verify;
        }
        if let Some(trace) = lookup("MORPH_TRACE_SPECIALIZATION").and_then(|v| parse_bool(&v)) {
            config.trace_specialization = trace;
        }

        config
    }
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse().ok()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" | "" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.default_limit, 3);
        assert_eq!(config.state_capacity_bits, 256);
        assert_eq!(config.verify_bits, cfg!(debug_assertions));
        assert!(!config.trace_specialization);
    }

    #[test]
    fn test_presets() {
        assert!(DispatchConfig::strict().verify_bits);
        assert!(!DispatchConfig::fast().verify_bits);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("MORPH_DEFAULT_LIMIT", "5"),
            ("MORPH_STATE_BITS", "64"),
            ("MORPH_VERIFY_BITS", "on"),
            ("MORPH_TRACE_SPECIALIZATION", "1"),
        ]));
        assert_eq!(config.default_limit, 5);
        assert_eq!(config.state_capacity_bits, 64);
        assert!(config.verify_bits);
        assert!(config.trace_specialization);
    }

    #[test]
    fn test_from_lookup_ignores_garbage() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("MORPH_DEFAULT_LIMIT", "many"),
            ("MORPH_VERIFY_BITS", "maybe"),
        ]));
        assert_eq!(config, DispatchConfig::default());
    }

    #[test]
    fn test_zero_limit_clamped() {
        let config = DispatchConfig::from_lookup(lookup(&[("MORPH_DEFAULT_LIMIT", "0")]));
        assert_eq!(config.default_limit, 1);
    }
}
