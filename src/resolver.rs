//! Tiered address resolution; orchestrates the fallback chain.
//!
//! Tier order: box handling → exact `(street, number)` → street centroid →
//! fuzzy street match → postcode centroid → external service. The first tier
//! that produces coordinates wins; only complete exhaustion yields a
//! `Failed` result. Ordinary unresolvable input is never an error.

use crate::external::ExternalClient;
use crate::index::AddressIndex;
use crate::normalize::parse_address;
use crate::types::{Confidence, GeocoderConfig, ParsedAddress, RawAddress, ResolutionResult};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Streets shorter than this skip fuzzy matching; too little signal.
const FUZZY_MIN_STREET_LEN: usize = 3;

/// The tiered resolver. Read-only over the index; the per-run box cache is
/// the only mutable state and is shared across batch workers.
pub struct TieredResolver<'a> {
    index: &'a AddressIndex,
    external: &'a ExternalClient,
    config: &'a GeocoderConfig,
    /// Box query → outcome, per process run. Box addresses repeat heavily in
    /// directory exports; one external round-trip per distinct box is enough.
    box_cache: Mutex<HashMap<String, Option<(f64, f64)>>>,
}

impl<'a> TieredResolver<'a> {
    pub fn new(index: &'a AddressIndex, external: &'a ExternalClient, config: &'a GeocoderConfig) -> Self {
        Self {
            index,
            external,
            config,
            box_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one raw address through the full chain.
    pub fn resolve(&self, raw: &RawAddress) -> ResolutionResult {
        let parsed = parse_address(&raw.text, &self.config.default_locality);

        // Box addresses map to a postal facility, not a street; never
        // looked up locally.
        if parsed.is_box {
            return self.resolve_box(&parsed, &raw.text);
        }

        if !parsed.street.is_empty() {
            if self.index.has_street(&parsed.street) {
                if let Some(result) = self.resolve_on_street(&parsed.street, &parsed, &raw.text, None) {
                    return result;
                }
            } else if let Some((matched, score)) = self.best_street_match(&parsed.street) {
                debug!(street = %parsed.street, matched = %matched, score, "fuzzy street match");
                if let Some(result) =
                    self.resolve_on_street(&matched, &parsed, &raw.text, Some((&parsed.street, score)))
                {
                    return result;
                }
            }
        }

        if !parsed.postcode.is_empty() {
            if let Some(c) = self.index.postcode_centroid(&parsed.postcode) {
                return ResolutionResult::resolved(
                    c.lat,
                    c.lon,
                    c.locality,
                    Confidence::PostcodeCentroid,
                    format!("Postcode centroid: {} ({} addresses)", parsed.postcode, c.size),
                    &raw.text,
                );
            }
        }

        self.resolve_external(&parsed, &raw.text)
    }

    /// Tiers 2–3 against a known street: exact number first, else the street
    /// centroid. `fuzzy` carries the original query and similarity score when
    /// the street came out of the fuzzy matcher.
    fn resolve_on_street(
        &self,
        street: &str,
        parsed: &ParsedAddress,
        original: &str,
        fuzzy: Option<(&str, f64)>,
    ) -> Option<ResolutionResult> {
        if !parsed.number.is_empty() {
            if let Some(record) = self.index.lookup_exact(street, &parsed.number) {
                let (confidence, detail) = match fuzzy {
                    None => (
                        Confidence::Exact,
                        format!("Exact match: {} {}", record.street, record.number),
                    ),
                    Some((query, score)) => (
                        Confidence::Fuzzy,
                        format!(
                            "Fuzzy match: '{}' -> {} {} (score {:.0})",
                            query, record.street, record.number, score
                        ),
                    ),
                };
                return Some(ResolutionResult::resolved(
                    record.lat,
                    record.lon,
                    record.locality.clone(),
                    confidence,
                    detail,
                    original,
                ));
            }
        }

        let c = self.index.street_centroid(street)?;
        let detail = match fuzzy {
            None => format!("Street centroid: {} ({} addresses)", street, c.size),
            Some((query, score)) => format!(
                "Street centroid via fuzzy: '{}' -> {} ({} addresses, score {:.0})",
                query, street, c.size, score
            ),
        };
        Some(ResolutionResult::resolved(
            c.lat,
            c.lon,
            c.locality,
            Confidence::StreetCentroid,
            detail,
            original,
        ))
    }

    /// Closest known street by normalized edit-distance similarity, accepted
    /// at or above the configured threshold. Ties keep the earlier catalog
    /// entry.
    fn best_street_match(&self, street: &str) -> Option<(String, f64)> {
        let query = street.trim().to_lowercase();
        if query.chars().count() < FUZZY_MIN_STREET_LEN {
            return None;
        }

        let mut best: Option<(&String, f64)> = None;
        for candidate in self.index.street_names() {
            let score = similarity(&query, candidate);
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((candidate, score));
            }
        }

        best.filter(|(_, score)| *score >= self.config.fuzzy_threshold)
            .map(|(name, score)| (name.clone(), score))
    }

    fn resolve_box(&self, parsed: &ParsedAddress, original: &str) -> ResolutionResult {
        // Postal boxes live at post offices; compose the query the way the
        // postal service writes them.
        let query = format!(
            "Box {}, {} {}, {}",
            parsed.box_number, parsed.postcode, parsed.locality, self.config.country_qualifier
        );

        let outcome = {
            let cached = self.box_cache.lock().expect("box cache poisoned").get(&query).copied();
            match cached {
                Some(hit) => hit,
                None => {
                    let fresh = self.external.resolve(&query);
                    self.box_cache
                        .lock()
                        .expect("box cache poisoned")
                        .insert(query.clone(), fresh);
                    fresh
                }
            }
        };

        match outcome {
            Some((lat, lon)) => ResolutionResult::resolved(
                lat,
                lon,
                parsed.locality.clone(),
                Confidence::Box,
                format!("Box address: {}", query),
                original,
            ),
            None => ResolutionResult::failed(format!("Box address unresolved: {}", query), original),
        }
    }

    /// Tier 6: compose a query from the best available fields and delegate to
    /// the external client. A fully indeterminate parse still gets a minimal
    /// locality query, which the service is allowed to fail on.
    fn resolve_external(&self, parsed: &ParsedAddress, original: &str) -> ResolutionResult {
        let mut parts: Vec<String> = Vec::new();
        if !parsed.street.is_empty() {
            let street_line = if parsed.number.is_empty() {
                parsed.street.clone()
            } else {
                format!("{} {}", parsed.street, parsed.number)
            };
            parts.push(street_line);
        }
        match (parsed.postcode.is_empty(), parsed.locality.is_empty()) {
            (false, false) => parts.push(format!("{} {}", parsed.postcode, parsed.locality)),
            (false, true) => parts.push(parsed.postcode.clone()),
            (true, false) => parts.push(parsed.locality.clone()),
            (true, true) => {}
        }
        parts.push(self.config.country_qualifier.clone());
        let query = parts.join(", ");
        if parsed.is_indeterminate() {
            debug!(query = %query, "no local signal, minimal external query");
        }

        match self.external.resolve(&query) {
            Some((lat, lon)) => ResolutionResult::resolved(
                lat,
                lon,
                parsed.locality.clone(),
                Confidence::External,
                format!("External geocoding: {}", query),
                original,
            ),
            None => ResolutionResult::failed(format!("No match at any tier ({})", query), original),
        }
    }
}

/// Two-row Levenshtein edit distance.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());

    let mut prev = (0..=n).collect::<Vec<_>>();
    let mut curr = vec![0; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// Normalized similarity on a 0–100 scale: identical strings score 100.
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 100.0;
    }
    100.0 * (1.0 - edit_distance(a, b) as f64 / longest as f64)
}
