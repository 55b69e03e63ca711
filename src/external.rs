//! Rate-limited, cached access to an external geocoding web service.
//!
//! The network sits behind the `GeocodeService` trait; `NominatimService` is
//! the production implementation, tests substitute call-counting stubs. All
//! callers share one minimum-interval gate; the upstream usage policy caps
//! request rate system-wide, so the gate must hold no matter how many batch
//! workers are waiting.

use crate::cache::GeoCache;
use crate::normalize::cache_key;
use crate::types::{GeocodeError, GeocoderConfig};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Wait after a transport error before the single retry of a query variant.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Attempts per query variant (initial call + one retry).
const MAX_ATTEMPTS: usize = 2;

/// A geocoding backend: free-text query in, best single match out.
pub trait GeocodeService: Send + Sync {
    fn lookup(&self, query: &str) -> Result<Option<(f64, f64)>, GeocodeError>;
}

// ─── Nominatim backend ──────────────────────────────────────────

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// OpenStreetMap Nominatim (or a compatible self-hosted endpoint).
pub struct NominatimService {
    endpoint: String,
    user_agent: String,
    country_codes: Option<String>,
    timeout: Duration,
}

impl NominatimService {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            user_agent: "adresspunkt/0.3 (batch-address-resolver)".into(),
            country_codes: Some("se".into()),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_country_codes(mut self, codes: Option<String>) -> Self {
        self.country_codes = codes;
        self
    }
}

impl GeocodeService for NominatimService {
    fn lookup(&self, query: &str) -> Result<Option<(f64, f64)>, GeocodeError> {
        let country_param = match &self.country_codes {
            Some(codes) => format!("&countrycodes={}", urlencode(codes)),
            None => String::new(),
        };
        let url = format!(
            "{}/search?q={}&format=json&limit=1{}",
            self.endpoint.trim_end_matches('/'),
            urlencode(query),
            country_param,
        );

        let response = ureq::get(&url)
            .set("User-Agent", &self.user_agent)
            .timeout(self.timeout)
            .call()
            .map_err(|e| GeocodeError::Network(e.to_string()))?;

        let results: Vec<NominatimPlace> = response
            .into_json()
            .map_err(|e| GeocodeError::InvalidResponse(e.to_string()))?;

        let Some(first) = results.first() else {
            return Ok(None);
        };
        let lat: f64 = first
            .lat
            .parse()
            .map_err(|_| GeocodeError::InvalidResponse(format!("bad lat '{}'", first.lat)))?;
        let lon: f64 = first
            .lon
            .parse()
            .map_err(|_| GeocodeError::InvalidResponse(format!("bad lon '{}'", first.lon)))?;
        Ok(Some((lat, lon)))
    }
}

/// Minimal percent-encoding for query strings.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '+' => out.push_str("%2B"),
            ',' => out.push_str("%2C"),
            _ if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') => out.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    out
}

// ─── Rate limiter ───────────────────────────────────────────────

/// System-wide minimum-interval gate for external calls.
///
/// The mutex is held across the wait, so concurrent callers queue behind the
/// gate and consecutive calls are never closer than `min_interval`; adding
/// workers cannot shorten the gap.
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Mutex::new(None) }
    }

    /// Block until the minimum interval since the previous call has elapsed,
    /// then claim the slot.
    pub fn acquire(&self) {
        let mut last = self.last.lock().expect("rate limiter poisoned");
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

// ─── Cached external client ─────────────────────────────────────

/// The external fallback resolver: durable cache in front of the throttled
/// service, with a country-qualified retry and caller-configured variants.
pub struct ExternalClient {
    service: Box<dyn GeocodeService>,
    limiter: RateLimiter,
    cache: Mutex<GeoCache>,
    country_qualifier: String,
    extra_variants: Vec<String>,
    retry_backoff: Duration,
    offline: bool,
}

impl ExternalClient {
    pub fn new(service: Box<dyn GeocodeService>, cache: GeoCache, config: &GeocoderConfig) -> Self {
        Self {
            service,
            limiter: RateLimiter::new(Duration::from_millis(config.min_request_interval_ms)),
            cache: Mutex::new(cache),
            country_qualifier: config.country_qualifier.clone(),
            extra_variants: config.extra_variants.clone(),
            retry_backoff: RETRY_BACKOFF,
            offline: false,
        }
    }

    /// Offline mode: cache hits still answer, everything else resolves to
    /// nothing without touching the network or the cache.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Shrink the retry backoff (tests only; a failing stub should not
    /// stall the suite).
    #[cfg(test)]
    pub(crate) fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Resolve a free-text query. Cache first (negative hits included); on a
    /// miss, each variant gets up to two throttled attempts. Exhaustion is
    /// recorded as a negative entry and answered with `None`; a dead query
    /// never aborts a batch.
    pub fn resolve(&self, query: &str) -> Option<(f64, f64)> {
        let key = cache_key(query);

        {
            let cache = self.cache.lock().expect("cache poisoned");
            if let Some(entry) = cache.get(&key) {
                debug!(key = %key, negative = entry.is_negative(), "external cache hit");
                return entry.coords();
            }
        }

        if self.offline {
            debug!(key = %key, "offline, skipping external lookup");
            return None;
        }

        for variant in self.variants(query) {
            if let Some((lat, lon)) = self.attempt(&variant) {
                debug!(query = %variant, lat, lon, "external hit");
                self.cache.lock().expect("cache poisoned").put(key, lat, lon);
                return Some((lat, lon));
            }
        }

        debug!(key = %key, "external exhausted, caching negative");
        self.cache.lock().expect("cache poisoned").put_negative(key);
        None
    }

    /// Query variants in order: as-is, country-qualified (unless already
    /// qualified), then the configured extra suffixes.
    fn variants(&self, query: &str) -> Vec<String> {
        let mut variants = vec![query.to_string()];
        if !query
            .to_lowercase()
            .contains(&self.country_qualifier.to_lowercase())
        {
            variants.push(format!("{}, {}", query, self.country_qualifier));
        }
        for extra in &self.extra_variants {
            variants.push(format!("{}, {}", query, extra));
        }
        variants
    }

    /// One variant: call, and on a transport error retry once after a short
    /// backoff. A clean "no result" is final for this variant.
    fn attempt(&self, variant: &str) -> Option<(f64, f64)> {
        for attempt in 0..MAX_ATTEMPTS {
            self.limiter.acquire();
            match self.service.lookup(variant) {
                Ok(result) => return result,
                Err(e) => {
                    warn!(query = %variant, attempt, error = %e, "external lookup error");
                    if attempt + 1 < MAX_ATTEMPTS {
                        std::thread::sleep(self.retry_backoff);
                    }
                }
            }
        }
        None
    }

    /// Flush the durable cache. Called by the batch orchestrator at
    /// checkpoints and at end of run; never from worker paths.
    pub fn flush_cache(&self) -> Result<(), GeocodeError> {
        self.cache.lock().expect("cache poisoned").flush()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().expect("cache poisoned").len()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{SharedStub, StubService};
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fast_config() -> GeocoderConfig {
        GeocoderConfig { min_request_interval_ms: 1, ..Default::default() }
    }

    fn client_with(
        service: Arc<StubService>,
        config: &GeocoderConfig,
        dir: &TempDir,
    ) -> ExternalClient {
        let cache = GeoCache::open(dir.path().join("cache.json")).unwrap();
        ExternalClient::new(Box::new(SharedStub(service)), cache, config)
            .with_retry_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_hit_is_cached() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(StubService::new(vec![("Storgatan 1", (57.7, 11.9))]));
        let client = client_with(service.clone(), &fast_config(), &dir);

        assert_eq!(client.resolve("Storgatan 1"), Some((57.7, 11.9)));
        assert_eq!(service.call_count(), 1);

        // Second resolve answers from cache; zero further calls.
        assert_eq!(client.resolve("Storgatan 1"), Some((57.7, 11.9)));
        assert_eq!(service.call_count(), 1);
    }

    #[test]
    fn test_negative_caching_stops_repeat_calls() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(StubService::new(vec![]));
        let client = client_with(service.clone(), &fast_config(), &dir);

        assert_eq!(client.resolve("Okänd Gata 99"), None);
        let first_round = service.call_count();
        assert!(first_round >= 1);

        assert_eq!(client.resolve("Okänd Gata 99"), None);
        assert_eq!(service.call_count(), first_round);
        assert_eq!(client.cache_len(), 1);
    }

    #[test]
    fn test_country_qualifier_variant() {
        let dir = TempDir::new().unwrap();
        // Only the country-qualified form matches.
        let service = Arc::new(StubService::new(vec![("Gata 1, Sverige", (1.0, 2.0))]));
        let client = client_with(service.clone(), &fast_config(), &dir);

        assert_eq!(client.resolve("Gata 1"), Some((1.0, 2.0)));
        assert_eq!(service.call_count(), 2);

        // Already-qualified queries are not qualified twice.
        let service2 = Arc::new(StubService::new(vec![]));
        let dir2 = TempDir::new().unwrap();
        let client2 = client_with(service2.clone(), &fast_config(), &dir2);
        client2.resolve("Gata 1, Sverige");
        assert_eq!(service2.call_count(), 1);
    }

    #[test]
    fn test_extra_variants_tried_last() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(StubService::new(vec![("Gata 1, Västsverige", (3.0, 4.0))]));
        let config = GeocoderConfig {
            extra_variants: vec!["Västsverige".into()],
            ..fast_config()
        };
        let client = client_with(service.clone(), &config, &dir);

        assert_eq!(client.resolve("Gata 1"), Some((3.0, 4.0)));
        // Plain, country-qualified, then the extra variant.
        assert_eq!(service.call_count(), 3);
    }

    #[test]
    fn test_transport_errors_become_negative() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(StubService::failing());
        let client = client_with(service.clone(), &fast_config(), &dir);

        assert_eq!(client.resolve("Gata 1"), None);
        // Two variants, two attempts each.
        assert_eq!(service.call_count(), 4);

        // The failure is a cached negative, not an error to propagate.
        assert_eq!(client.resolve("Gata 1"), None);
        assert_eq!(service.call_count(), 4);
    }

    #[test]
    fn test_offline_skips_network_and_cache() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(StubService::new(vec![("Gata 1", (1.0, 2.0))]));
        let mut client = client_with(service.clone(), &fast_config(), &dir);
        client.set_offline(true);

        assert_eq!(client.resolve("Gata 1"), None);
        assert_eq!(service.call_count(), 0);
        assert_eq!(client.cache_len(), 0);
    }

    #[test]
    fn test_rate_limiter_gap_under_concurrency() {
        let dir = TempDir::new().unwrap();
        let service = Arc::new(StubService::new(vec![
            ("a", (1.0, 1.0)),
            ("b", (2.0, 2.0)),
            ("c", (3.0, 3.0)),
            ("d", (4.0, 4.0)),
        ]));
        let config = GeocoderConfig { min_request_interval_ms: 100, ..Default::default() };
        let client = client_with(service.clone(), &config, &dir);

        std::thread::scope(|s| {
            for q in ["a", "b", "c", "d"] {
                let client = &client;
                s.spawn(move || {
                    client.resolve(q);
                });
            }
        });

        let mut instants = service.instants.lock().unwrap().clone();
        instants.sort();
        assert_eq!(instants.len(), 4);
        for pair in instants.windows(2) {
            // Small tolerance for scheduling jitter around the sleep.
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(90));
        }
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("Kungsgatan 12"), "Kungsgatan%2012");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
        assert_eq!(urlencode("Göteborg"), "G%C3%B6teborg");
    }
}
