//! Filters, pagination, and opaque cursors for listing operations.

use engram_core::{EngramError, EngramId, MetadataMap, NounType, Result, VerbType};
use serde::{Deserialize, Serialize};

/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Pagination parameters for a listing call.
#[derive(Debug, Clone, Default)]
pub struct Pagination {
    /// Maximum items in the page; defaults to [`DEFAULT_PAGE_LIMIT`].
    pub limit: Option<usize>,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
}

impl Pagination {
    pub fn first(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            cursor: None,
        }
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1)
    }
}

/// One page of results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Total matching count when it was cheap to produce; `None` when the
    /// listing would have to scan everything to know.
    pub total_count: Option<u64>,
}

/// Filter for noun listings. Empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct NounFilter {
    pub noun_types: Vec<NounType>,
    pub services: Vec<String>,
    /// key = value predicates over the metadata sidecar, all of which
    /// must hold.
    pub metadata: Vec<(String, serde_json::Value)>,
}

impl NounFilter {
    pub fn is_empty(&self) -> bool {
        self.noun_types.is_empty() && self.services.is_empty() && self.metadata.is_empty()
    }

    pub fn matches(&self, noun_type: NounType, service: &str, metadata: &MetadataMap) -> bool {
        if !self.noun_types.is_empty() && !self.noun_types.contains(&noun_type) {
            return false;
        }
        if !self.services.is_empty() && !self.services.iter().any(|s| s == service) {
            return false;
        }
        metadata_matches(&self.metadata, metadata)
    }
}

/// Filter for verb listings.
#[derive(Debug, Clone, Default)]
pub struct VerbFilter {
    pub verb_types: Vec<VerbType>,
    pub source_id: Option<EngramId>,
    pub target_id: Option<EngramId>,
    pub services: Vec<String>,
    pub metadata: Vec<(String, serde_json::Value)>,
}

impl VerbFilter {
    pub fn is_empty(&self) -> bool {
        self.verb_types.is_empty()
            && self.source_id.is_none()
            && self.target_id.is_none()
            && self.services.is_empty()
            && self.metadata.is_empty()
    }

    pub fn matches(
        &self,
        verb_type: VerbType,
        source_id: &EngramId,
        target_id: &EngramId,
        service: &str,
        metadata: &MetadataMap,
    ) -> bool {
        if !self.verb_types.is_empty() && !self.verb_types.contains(&verb_type) {
            return false;
        }
        if let Some(expected) = &self.source_id {
            if expected != source_id {
                return false;
            }
        }
        if let Some(expected) = &self.target_id {
            if expected != target_id {
                return false;
            }
        }
        if !self.services.is_empty() && !self.services.iter().any(|s| s == service) {
            return false;
        }
        metadata_matches(&self.metadata, metadata)
    }
}

fn metadata_matches(predicates: &[(String, serde_json::Value)], metadata: &MetadataMap) -> bool {
    predicates
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// Cursor payload: the last key served and the scan direction.
///
/// Serialized then hex-armored so callers treat it as opaque. Decoding a
/// cursor against an unchanged store resumes exactly after `last_key`;
/// under concurrent mutation the scan just restarts from the nearest key
/// ordered after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_key: String,
    pub direction: ScanDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanDirection {
    #[default]
    Ascending,
}

impl Cursor {
    pub fn after(last_key: impl Into<String>) -> Self {
        Self {
            last_key: last_key.into(),
            direction: ScanDirection::Ascending,
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex_encode(&json)
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = hex_decode(encoded)
            .ok_or_else(|| EngramError::storage(format!("malformed cursor: {encoded}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngramError::storage(format!("malformed cursor payload: {e}")))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = Cursor::after("nouns/abc.json");
        let encoded = cursor.encode();
        // Opaque: no raw key material visible.
        assert!(!encoded.contains("nouns"));
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(Cursor::decode("zz").is_err());
        assert!(Cursor::decode("abc").is_err());
        assert!(Cursor::decode("deadbeef").is_err());
    }

    #[test]
    fn test_noun_filter() {
        let mut metadata = MetadataMap::new();
        metadata.insert("lang".to_string(), json!("en"));

        let filter = NounFilter {
            noun_types: vec![NounType::Document],
            services: vec!["importer".to_string()],
            metadata: vec![("lang".to_string(), json!("en"))],
        };
        assert!(filter.matches(NounType::Document, "importer", &metadata));
        assert!(!filter.matches(NounType::Person, "importer", &metadata));
        assert!(!filter.matches(NounType::Document, "other", &metadata));
        assert!(!filter.matches(NounType::Document, "importer", &MetadataMap::new()));

        assert!(NounFilter::default().matches(NounType::Person, "x", &MetadataMap::new()));
    }

    #[test]
    fn test_verb_filter_endpoints() {
        let a = EngramId::new();
        let b = EngramId::new();
        let filter = VerbFilter {
            source_id: Some(a),
            ..Default::default()
        };
        assert!(filter.matches(VerbType::RelatedTo, &a, &b, "", &MetadataMap::new()));
        assert!(!filter.matches(VerbType::RelatedTo, &b, &a, "", &MetadataMap::new()));
    }
}
