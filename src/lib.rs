//! Batch address resolution for Göteborg municipality data.
//!
//! Raw free-text addresses are normalized, matched against a trusted
//! municipal registry through a tiered fallback chain (exact → street
//! centroid → fuzzy → postcode centroid), and only escalated to a
//! rate-limited external geocoding service as last resort. Batch runs
//! deduplicate by cache key, run on a bounded worker pool, and checkpoint a
//! durable query cache so restarts never repeat network calls.

pub mod batch;
pub mod cache;
pub mod external;
pub mod index;
pub mod normalize;
pub mod resolver;
pub mod types;

pub use batch::{BatchOutcome, BatchRunner, BatchSummary, CancelFlag};
pub use cache::GeoCache;
pub use external::{ExternalClient, GeocodeService, NominatimService, RateLimiter};
pub use index::{AddressIndex, Centroid};
pub use normalize::{cache_key, parse_address, repair_encoding};
pub use resolver::TieredResolver;
pub use types::{
    AddressRecord, Confidence, GeocodeError, GeocoderConfig, ParsedAddress, RawAddress,
    ResolutionResult,
};
