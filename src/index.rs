//! In-memory lookup structures over the trusted municipal address registry.
//!
//! Built once at startup, read-only afterwards; safe for unsynchronized
//! concurrent reads from the batch worker pool.

use crate::normalize::repair_encoding;
use crate::types::AddressRecord;
use std::collections::HashMap;

/// Arithmetic mean of a registry group, with its modal locality.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroid {
    pub lat: f64,
    pub lon: f64,
    pub locality: String,
    /// Number of registry rows behind this centroid.
    pub size: usize,
}

/// Fast lookups over the registry.
pub struct AddressIndex {
    records: Vec<AddressRecord>,
    /// (normalized street, number) → row. First-write-wins: duplicate
    /// registry rows keep the first occurrence, so exact results are
    /// reproducible for a fixed registry order.
    exact: HashMap<(String, String), usize>,
    by_street: HashMap<String, Vec<usize>>,
    by_postcode: HashMap<String, Vec<usize>>,
    /// Distinct normalized street names in first-encountered order; the
    /// candidate universe for fuzzy matching, iteration order is the
    /// tie-break order.
    street_names: Vec<String>,
}

impl AddressIndex {
    /// Build the index. Every field is encoding-repaired; street names are
    /// lower-cased and trimmed for keying.
    pub fn build(records: Vec<AddressRecord>) -> Self {
        let records: Vec<AddressRecord> = records
            .into_iter()
            .map(|r| AddressRecord {
                street: repair_encoding(&r.street),
                number: repair_encoding(&r.number),
                postcode: repair_encoding(&r.postcode),
                locality: repair_encoding(&r.locality),
                lat: r.lat,
                lon: r.lon,
            })
            .collect();

        let mut exact = HashMap::new();
        let mut by_street: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_postcode: HashMap<String, Vec<usize>> = HashMap::new();
        let mut street_names = Vec::new();

        for (i, record) in records.iter().enumerate() {
            let street = normalize_street(&record.street);
            if street.is_empty() {
                continue;
            }

            exact
                .entry((street.clone(), record.number.trim().to_string()))
                .or_insert(i);

            match by_street.entry(street.clone()) {
                std::collections::hash_map::Entry::Vacant(e) => {
                    street_names.push(street.clone());
                    e.insert(vec![i]);
                }
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    e.get_mut().push(i);
                }
            }

            if !record.postcode.trim().is_empty() {
                by_postcode
                    .entry(record.postcode.trim().to_string())
                    .or_default()
                    .push(i);
            }
        }

        Self { records, exact, by_street, by_postcode, street_names }
    }

    /// Exact `(street, number)` lookup.
    pub fn lookup_exact(&self, street: &str, number: &str) -> Option<&AddressRecord> {
        let key = (normalize_street(street), number.trim().to_string());
        self.exact.get(&key).map(|&i| &self.records[i])
    }

    pub fn has_street(&self, street: &str) -> bool {
        self.by_street.contains_key(&normalize_street(street))
    }

    /// All rows on a street.
    pub fn street_rows(&self, street: &str) -> Option<Vec<&AddressRecord>> {
        self.by_street
            .get(&normalize_street(street))
            .map(|idxs| idxs.iter().map(|&i| &self.records[i]).collect())
    }

    /// Centroid of all rows on a street, or None for unknown streets.
    pub fn street_centroid(&self, street: &str) -> Option<Centroid> {
        let idxs = self.by_street.get(&normalize_street(street))?;
        centroid(idxs.iter().map(|&i| &self.records[i]))
    }

    /// Centroid of all rows in a postcode, or None for unknown postcodes.
    pub fn postcode_centroid(&self, postcode: &str) -> Option<Centroid> {
        let idxs = self.by_postcode.get(postcode.trim())?;
        centroid(idxs.iter().map(|&i| &self.records[i]))
    }

    /// Distinct street names in tie-break order.
    pub fn street_names(&self) -> &[String] {
        &self.street_names
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn normalize_street(street: &str) -> String {
    street.trim().to_lowercase()
}

/// Mean latitude/longitude over a group plus its most frequent locality
/// (ties broken by first encounter). None for empty groups.
pub fn centroid<'a>(rows: impl Iterator<Item = &'a AddressRecord>) -> Option<Centroid> {
    let mut lat_sum = 0.0;
    let mut lon_sum = 0.0;
    let mut count = 0usize;
    // Locality tallies in encounter order so ties resolve deterministically.
    let mut order: Vec<String> = Vec::new();
    let mut tallies: HashMap<String, usize> = HashMap::new();

    for row in rows {
        lat_sum += row.lat;
        lon_sum += row.lon;
        count += 1;
        let entry = tallies.entry(row.locality.clone()).or_insert(0);
        if *entry == 0 {
            order.push(row.locality.clone());
        }
        *entry += 1;
    }

    if count == 0 {
        return None;
    }

    let mut best = order[0].clone();
    let mut best_count = tallies[&best];
    for locality in &order[1..] {
        let c = tallies[locality];
        if c > best_count {
            best = locality.clone();
            best_count = c;
        }
    }

    Some(Centroid {
        lat: lat_sum / count as f64,
        lon: lon_sum / count as f64,
        locality: best,
        size: count,
    })
}
