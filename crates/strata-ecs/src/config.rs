//! Chunk sizing configuration shared by every archetype of a store.

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Pattern written over fresh chunks in debug builds so reads of
/// unconstructed component storage stand out.
pub const DEBUG_FILL_BYTE: u8 = 0xBA;

/// Configuration for chunk layout.
///
/// ```
/// use strata_ecs::config::StoreConfig;
///
/// let config = StoreConfig::from_json(r#"{ "chunk_bytes": 128 }"#).unwrap();
/// assert_eq!(config.chunk_bytes, 128);
/// assert_eq!(config.max_entities_per_chunk, StoreConfig::default().max_entities_per_chunk);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Target byte size of one chunk. A chunk always fits at least one row,
    /// even when that row is wider than this.
    pub chunk_bytes: usize,
    /// Upper bound on rows per chunk. Also the row count of archetypes whose
    /// rows are zero bytes wide.
    pub max_entities_per_chunk: usize,
    /// Byte written over every freshly allocated chunk, if any.
    pub debug_fill: Option<u8>,
}

impl Default for StoreConfig {
    /// 16 KiB chunks of at most 4096 rows; debug fill in debug builds only.
    fn default() -> Self {
        Self {
            chunk_bytes: 16 * 1024,
            max_entities_per_chunk: 4096,
            debug_fill: if cfg!(debug_assertions) {
                Some(DEBUG_FILL_BYTE)
            } else {
                None
            },
        }
    }
}

impl StoreConfig {
    /// Parse and validate a JSON configuration. Missing fields take their
    /// default values.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let config: Self = serde_json::from_str(json).map_err(|e| StoreError::InvalidConfig {
            details: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can describe a chunk at all.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.chunk_bytes == 0 {
            return Err(StoreError::InvalidConfig {
                details: "chunk_bytes must be positive".to_owned(),
            });
        }
        if self.max_entities_per_chunk == 0 {
            return Err(StoreError::InvalidConfig {
                details: "max_entities_per_chunk must be positive".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_bytes, 16 * 1024);
        assert_eq!(config.debug_fill.is_some(), cfg!(debug_assertions));
    }

    #[test]
    fn json_overrides_fields() {
        let config =
            StoreConfig::from_json(r#"{ "max_entities_per_chunk": 8, "debug_fill": null }"#)
                .unwrap();
        assert_eq!(config.max_entities_per_chunk, 8);
        assert_eq!(config.debug_fill, None);
        assert_eq!(config.chunk_bytes, 16 * 1024);
    }

    #[test]
    fn zero_chunk_bytes_rejected() {
        let err = StoreConfig::from_json(r#"{ "chunk_bytes": 0 }"#).unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig { .. }));
    }

    #[test]
    fn malformed_json_rejected() {
        let err = StoreConfig::from_json("{ chunk_bytes: ").unwrap_err();
        assert!(err.to_string().contains("invalid store configuration"));
    }
}
