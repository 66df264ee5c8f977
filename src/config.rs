//! Context configuration.

use crate::error::{ContextError, Result};
use crate::query::{RecordClass, RecordType};

/// Default module pipeline, matching libunbound's default.
pub const DEFAULT_MODULE_CONFIG: &str = "validator iterator";

/// Largest query identifier handed out by default (non-negative `i32`).
#[allow(clippy::cast_sign_loss)]
pub const DEFAULT_MAX_QUERY_ID: u32 = i32::MAX as u32;

/// Default upper bound for one frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 65_535 + 1024;

/// How the background worker runs. Fixed once the context is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// The worker is a thread sharing the context's memory; callers drain
    /// the result channel themselves.
    #[default]
    ThreadBased,
    /// The worker is isolated and talks only through the channels; a
    /// dispatcher thread drains the result channel.
    ProcessBased,
}

/// One locally served record, answered before the resolver is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalData {
    /// Owner name.
    pub name: String,
    /// Record type.
    pub rtype: RecordType,
    /// Record class.
    pub class: RecordClass,
    /// Raw rdata.
    pub rdata: Vec<u8>,
}

/// Settings consumed at finalization.
///
/// # Example
///
/// ```
/// use resolver_context::{ConcurrencyMode, ContextConfig};
///
/// let config = ContextConfig::new()
///     .with_mode(ConcurrencyMode::ProcessBased)
///     .with_module_config("iterator");
///
/// assert_eq!(config.mode, ConcurrencyMode::ProcessBased);
/// assert_eq!(config.module_config, "iterator");
/// ```
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Worker concurrency mode.
    pub mode: ConcurrencyMode,

    /// Whitespace-separated module pipeline, e.g. `"validator iterator"`.
    pub module_config: String,

    /// Bytes reserved for the shared message cache.
    pub msg_cache_size: usize,

    /// Bytes reserved for the shared RRset cache.
    pub rrset_cache_size: usize,

    /// Largest query identifier; ids are drawn from `1..=max_query_id`.
    pub max_query_id: u32,

    /// Largest frame payload accepted on either channel. Read when the
    /// context is created, not at finalization.
    pub max_frame_len: usize,

    /// Locally served records.
    pub local_data: Vec<LocalData>,
}

impl ContextConfig {
    /// Creates a config with libunbound-like defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: ConcurrencyMode::default(),
            module_config: DEFAULT_MODULE_CONFIG.to_string(),
            msg_cache_size: 4 * 1024 * 1024,
            rrset_cache_size: 4 * 1024 * 1024,
            max_query_id: DEFAULT_MAX_QUERY_ID,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            local_data: Vec::new(),
        }
    }

    /// Overrides the concurrency mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Overrides the module pipeline.
    #[must_use]
    pub fn with_module_config(mut self, modules: impl Into<String>) -> Self {
        self.module_config = modules.into();
        self
    }

    /// Shrinks or grows the query identifier space.
    #[must_use]
    pub const fn with_max_query_id(mut self, max: u32) -> Self {
        self.max_query_id = max;
        self
    }

    /// Overrides the frame size limit.
    #[must_use]
    pub const fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Adds a locally served record.
    #[must_use]
    pub fn with_local_data(mut self, data: LocalData) -> Self {
        self.local_data.push(data);
        self
    }

    /// Applies a libunbound-style `key:` / value option.
    ///
    /// The trailing colon on the key is optional.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Syntax`] for unknown keys or unparsable values.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        let key = key.strip_suffix(':').unwrap_or(key);
        let value = value.trim();
        match key {
            "module-config" => value.clone_into(&mut self.module_config),
            "msg-cache-size" => self.msg_cache_size = parse_number(key, value)?,
            "rrset-cache-size" => self.rrset_cache_size = parse_number(key, value)?,
            "max-query-id" => {
                let max: u32 = parse_number(key, value)?;
                if max == 0 {
                    return Err(ContextError::Syntax("max-query-id must be positive".into()));
                }
                self.max_query_id = max;
            }
            "do-threads" => {
                self.mode = match value {
                    "yes" => ConcurrencyMode::ThreadBased,
                    "no" => ConcurrencyMode::ProcessBased,
                    other => {
                        return Err(ContextError::Syntax(format!(
                            "do-threads expects yes or no, got {other:?}"
                        )));
                    }
                };
            }
            other => return Err(ContextError::Syntax(format!("unknown option {other:?}"))),
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ContextError::Syntax(format!("{key}: not a number: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn new_sets_defaults() {
        let c = ContextConfig::new();
        assert_eq!(c.mode, ConcurrencyMode::ThreadBased);
        assert_eq!(c.module_config, "validator iterator");
        assert_eq!(c.max_query_id, 2_147_483_647);
        assert!(c.local_data.is_empty());
    }

    #[test]
    fn set_option_accepts_known_keys() {
        let mut c = ContextConfig::new();
        c.set_option("module-config:", "iterator").unwrap();
        c.set_option("msg-cache-size:", "1024").unwrap();
        c.set_option("max-query-id", "8").unwrap();
        c.set_option("do-threads:", "no").unwrap();

        assert_eq!(c.module_config, "iterator");
        assert_eq!(c.msg_cache_size, 1024);
        assert_eq!(c.max_query_id, 8);
        assert_eq!(c.mode, ConcurrencyMode::ProcessBased);
    }

    #[test]
    fn set_option_rejects_garbage() {
        let mut c = ContextConfig::new();
        let err = c.set_option("no-such-option:", "1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::SyntaxError);
        assert!(c.set_option("msg-cache-size:", "lots").is_err());
        assert!(c.set_option("max-query-id:", "0").is_err());
        assert!(c.set_option("do-threads:", "maybe").is_err());
        assert_eq!(c.msg_cache_size, 4 * 1024 * 1024);
    }
}
