//! Core types for the address resolution engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One raw input address with an optional caller-supplied identifier.
#[derive(Debug, Clone)]
pub struct RawAddress {
    pub id: Option<String>,
    pub text: String,
}

impl RawAddress {
    pub fn new(text: impl Into<String>) -> Self {
        Self { id: None, text: text.into() }
    }

    pub fn with_id(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: Some(id.into()), text: text.into() }
    }
}

/// Structured view of one input address.
///
/// Exactly one of the street parse (`street`/`number`) and the box parse
/// (`box_number`) carries data; `is_box` says which. Parsing never fails;
/// unparseable input yields empty fields, which the resolver treats as
/// "no local match possible" rather than an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAddress {
    pub street: String,
    pub number: String,
    pub postcode: String,
    pub locality: String,
    pub is_box: bool,
    pub box_number: String,
}

impl ParsedAddress {
    /// True when no local tier can possibly match: no street, no postcode,
    /// and not a box address.
    pub fn is_indeterminate(&self) -> bool {
        !self.is_box && self.street.is_empty() && self.postcode.is_empty()
    }
}

/// One row of the trusted municipal address registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRecord {
    pub street: String,
    pub number: String,
    pub postcode: String,
    pub locality: String,
    pub lat: f64,
    pub lon: f64,
}

/// Which strategy produced a resolution, ordered by expected accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Exact,
    Fuzzy,
    StreetCentroid,
    PostcodeCentroid,
    Box,
    External,
    Failed,
}

impl Confidence {
    /// All tiers in reporting order, for summary tallies.
    pub const ALL: [Confidence; 7] = [
        Confidence::Exact,
        Confidence::Fuzzy,
        Confidence::StreetCentroid,
        Confidence::PostcodeCentroid,
        Confidence::Box,
        Confidence::External,
        Confidence::Failed,
    ];
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Fuzzy => write!(f, "fuzzy"),
            Self::StreetCentroid => write!(f, "street-centroid"),
            Self::PostcodeCentroid => write!(f, "postcode-centroid"),
            Self::Box => write!(f, "box"),
            Self::External => write!(f, "external"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of resolving one address.
///
/// `lat`/`lon` are both present or both absent; absent coordinates always
/// carry `Confidence::Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub locality: String,
    pub confidence: Confidence,
    pub detail: String,
    pub original_address: String,
}

impl ResolutionResult {
    pub fn resolved(
        lat: f64,
        lon: f64,
        locality: impl Into<String>,
        confidence: Confidence,
        detail: impl Into<String>,
        original: impl Into<String>,
    ) -> Self {
        Self {
            lat: Some(lat),
            lon: Some(lon),
            locality: locality.into(),
            confidence,
            detail: detail.into(),
            original_address: original.into(),
        }
    }

    pub fn failed(detail: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            lat: None,
            lon: None,
            locality: String::new(),
            confidence: Confidence::Failed,
            detail: detail.into(),
            original_address: original.into(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.lat.is_some()
    }
}

/// Engine configuration shared by the resolver, external client, and batch
/// runner. Defaults match the Göteborg deployment; the CLI overrides fields
/// per flag.
#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    /// Fuzzy street acceptance threshold, 0–100.
    pub fuzzy_threshold: f64,
    /// Minimum wall-clock gap between external requests, system-wide.
    pub min_request_interval_ms: u64,
    /// Worker pool width for batch runs.
    pub workers: usize,
    /// Flush cache + write a partial snapshot every this many resolutions.
    pub checkpoint_interval: usize,
    /// Locality assumed when none can be extracted.
    pub default_locality: String,
    /// Country suffix appended to external queries.
    pub country_qualifier: String,
    /// Extra query variants tried by the external client after the
    /// country-qualified one (address-segment simplifications).
    pub extra_variants: Vec<String>,
    /// Durable cache location.
    pub cache_path: PathBuf,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 70.0,
            min_request_interval_ms: 1000,
            workers: 4,
            checkpoint_interval: 1000,
            default_locality: "Göteborg".into(),
            country_qualifier: "Sverige".into(),
            extra_variants: Vec::new(),
            cache_path: default_cache_path(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".adresspunkt")
        .join("cache.json")
}

/// Fatal engine errors.
///
/// Per-address failures (unparseable input, local misses, exhausted external
/// queries) are never errors; they become `Confidence::Failed` results. Only
/// conditions that make a batch run meaningless surface here.
#[derive(Debug)]
pub enum GeocodeError {
    Network(String),
    InvalidResponse(String),
    CacheStore(String),
    Input(String),
}

impl fmt::Display for GeocodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::InvalidResponse(msg) => write!(f, "Invalid API response: {}", msg),
            Self::CacheStore(msg) => write!(f, "Cache store error: {}", msg),
            Self::Input(msg) => write!(f, "Input error: {}", msg),
        }
    }
}

impl std::error::Error for GeocodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_display() {
        assert_eq!(Confidence::Exact.to_string(), "exact");
        assert_eq!(Confidence::StreetCentroid.to_string(), "street-centroid");
        assert_eq!(Confidence::Failed.to_string(), "failed");
    }

    #[test]
    fn test_failed_result_has_no_coords() {
        let r = ResolutionResult::failed("no match", "Nowhere 1");
        assert!(!r.is_resolved());
        assert_eq!(r.confidence, Confidence::Failed);
        assert!(r.lat.is_none() && r.lon.is_none());
    }

    #[test]
    fn test_indeterminate_parse() {
        let p = ParsedAddress::default();
        assert!(p.is_indeterminate());

        let with_street = ParsedAddress { street: "storgatan".into(), ..Default::default() };
        assert!(!with_street.is_indeterminate());

        let boxed = ParsedAddress { is_box: true, box_number: "45".into(), ..Default::default() };
        assert!(!boxed.is_indeterminate());
    }

    #[test]
    fn test_config_defaults() {
        let cfg = GeocoderConfig::default();
        assert_eq!(cfg.fuzzy_threshold, 70.0);
        assert_eq!(cfg.min_request_interval_ms, 1000);
        assert_eq!(cfg.default_locality, "Göteborg");
        assert_eq!(cfg.country_qualifier, "Sverige");
    }
}
