//! Batch orchestration: dedup, worker pool, checkpointing, summary.
//!
//! Inputs are deduplicated by cache key before any work is scheduled; each
//! distinct key is resolved once and the result broadcast back to every
//! input position sharing it. Workers run the full tiered pipeline; the
//! collecting thread is the sole writer of durable state (cache flushes and
//! partial snapshots), so concurrent file writes cannot race.

use crate::external::ExternalClient;
use crate::normalize::cache_key;
use crate::resolver::TieredResolver;
use crate::types::{Confidence, GeocodeError, GeocoderConfig, RawAddress, ResolutionResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{debug, info, warn};

/// Cooperative cancellation handle. Cancelling stops the pool from pulling
/// new work; in-flight resolutions finish normally and a final checkpoint
/// still runs.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One unresolvable input, surfaced in the summary rather than dropped.
#[derive(Debug, Clone, Serialize)]
pub struct FailedAddress {
    pub id: Option<String>,
    pub address: String,
    pub detail: String,
}

/// End-of-run report: per-tier tallies plus the identity of every failure.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub distinct: usize,
    pub tallies: Vec<(Confidence, usize)>,
    pub failed: Vec<FailedAddress>,
    pub cancelled: bool,
}

impl BatchSummary {
    fn from_run(inputs: &[RawAddress], results: &[ResolutionResult], distinct: usize, cancelled: bool) -> Self {
        let mut counts: HashMap<Confidence, usize> = HashMap::new();
        for r in results {
            *counts.entry(r.confidence).or_insert(0) += 1;
        }
        let tallies = Confidence::ALL
            .iter()
            .map(|&c| (c, counts.get(&c).copied().unwrap_or(0)))
            .collect();

        let failed = inputs
            .iter()
            .zip(results)
            .filter(|(_, r)| !r.is_resolved())
            .map(|(input, r)| FailedAddress {
                id: input.id.clone(),
                address: input.text.clone(),
                detail: r.detail.clone(),
            })
            .collect();

        Self { total: results.len(), distinct, tallies, failed, cancelled }
    }

    pub fn count(&self, confidence: Confidence) -> usize {
        self.tallies
            .iter()
            .find(|(c, _)| *c == confidence)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch summary: {} addresses, {} distinct", self.total, self.distinct)?;
        for (confidence, count) in &self.tallies {
            if *count > 0 {
                let pct = 100.0 * *count as f64 / self.total.max(1) as f64;
                writeln!(f, "  {}: {} ({:.1}%)", confidence, count, pct)?;
            }
        }
        if !self.failed.is_empty() {
            writeln!(f, "Failed addresses:")?;
            for fail in &self.failed {
                match &fail.id {
                    Some(id) => writeln!(f, "  [{}] '{}': {}", id, fail.address, fail.detail)?,
                    None => writeln!(f, "  '{}': {}", fail.address, fail.detail)?,
                }
            }
        }
        if self.cancelled {
            writeln!(f, "Run was cancelled before completion.")?;
        }
        Ok(())
    }
}

/// Results in input order plus the summary.
pub struct BatchOutcome {
    pub results: Vec<ResolutionResult>,
    pub summary: BatchSummary,
}

/// Drives resolution of a large address collection through a bounded worker
/// pool with crash-resilient checkpointing.
pub struct BatchRunner<'a> {
    resolver: &'a TieredResolver<'a>,
    external: &'a ExternalClient,
    config: &'a GeocoderConfig,
}

impl<'a> BatchRunner<'a> {
    pub fn new(resolver: &'a TieredResolver<'a>, external: &'a ExternalClient, config: &'a GeocoderConfig) -> Self {
        Self { resolver, external, config }
    }

    /// Resolve every input. `partial_out`, when given, receives a JSON
    /// snapshot of all keys resolved so far at each checkpoint.
    ///
    /// Per-address failures are data; only cache-store trouble aborts the
    /// run.
    pub fn run(
        &self,
        inputs: &[RawAddress],
        cancel: &CancelFlag,
        partial_out: Option<&Path>,
    ) -> Result<BatchOutcome, GeocodeError> {
        let keys: Vec<String> = inputs.iter().map(|a| cache_key(&a.text)).collect();

        // One job per distinct key; the first occurrence is the
        // representative the workers actually parse.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut jobs: Vec<(String, &RawAddress)> = Vec::new();
        for (input, key) in inputs.iter().zip(&keys) {
            if seen.insert(key.as_str()) {
                jobs.push((key.clone(), input));
            }
        }

        let workers = self.config.workers.max(1).min(jobs.len().max(1));
        info!(total = inputs.len(), distinct = jobs.len(), workers, "starting batch run");

        let mut resolved: HashMap<String, ResolutionResult> = HashMap::new();
        let mut run_error: Option<GeocodeError> = None;
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(String, ResolutionResult)>();

        std::thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let jobs = &jobs;
                s.spawn(move || loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    if i >= jobs.len() {
                        break;
                    }
                    let (key, raw) = &jobs[i];
                    let result = self.resolver.resolve(raw);
                    if tx.send((key.clone(), result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            let mut completed = 0usize;
            for (key, result) in rx {
                resolved.insert(key, result);
                completed += 1;
                if completed % 100 == 0 {
                    debug!(completed, of = jobs.len(), "batch progress");
                }
                if self.config.checkpoint_interval > 0
                    && completed % self.config.checkpoint_interval == 0
                {
                    match self.checkpoint(&resolved, partial_out) {
                        Ok(()) => {
                            info!(completed, cache_entries = self.external.cache_len(), "checkpoint")
                        }
                        Err(e) => {
                            warn!(error = %e, "checkpoint failed, aborting run");
                            run_error = Some(e);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });

        // Final flush runs even for cancelled batches.
        match self.checkpoint(&resolved, partial_out) {
            Ok(()) => {}
            Err(e) if run_error.is_none() => run_error = Some(e),
            Err(_) => {}
        }
        if let Some(e) = run_error {
            return Err(e);
        }

        // Broadcast back to original positions, each with its own raw text.
        let results: Vec<ResolutionResult> = inputs
            .iter()
            .zip(&keys)
            .map(|(input, key)| match resolved.get(key) {
                Some(r) => {
                    let mut r = r.clone();
                    r.original_address = input.text.clone();
                    r
                }
                None => ResolutionResult::failed("Cancelled before resolution", &input.text),
            })
            .collect();

        let summary = BatchSummary::from_run(inputs, &results, jobs.len(), cancel.is_cancelled());
        info!(
            total = summary.total,
            failed = summary.count(Confidence::Failed),
            cancelled = summary.cancelled,
            "batch run complete"
        );
        Ok(BatchOutcome { results, summary })
    }

    fn checkpoint(
        &self,
        resolved: &HashMap<String, ResolutionResult>,
        partial_out: Option<&Path>,
    ) -> Result<(), GeocodeError> {
        self.external.flush_cache()?;
        if let Some(path) = partial_out {
            let json = serde_json::to_string(resolved)
                .map_err(|e| GeocodeError::CacheStore(e.to_string()))?;
            std::fs::write(path, json).map_err(|e| {
                GeocodeError::CacheStore(format!("cannot write {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GeoCache;
    use crate::external::testutil::{SharedStub, StubService};
    use crate::index::AddressIndex;
    use crate::types::AddressRecord;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(street: &str, number: &str, postcode: &str, locality: &str, lat: f64, lon: f64) -> AddressRecord {
        AddressRecord {
            street: street.into(),
            number: number.into(),
            postcode: postcode.into(),
            locality: locality.into(),
            lat,
            lon,
        }
    }

    fn sample_index() -> AddressIndex {
        AddressIndex::build(vec![
            record("Kungsgatan", "12", "41119", "Göteborg", 57.704, 11.966),
            record("Avenyn", "1", "41136", "Göteborg", 57.697, 11.979),
        ])
    }

    struct Fixture {
        index: AddressIndex,
        client: ExternalClient,
        stub: Arc<StubService>,
        config: GeocoderConfig,
        cache_path: PathBuf,
        _dir: TempDir,
    }

    fn fixture(answers: Vec<(&str, (f64, f64))>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("cache.json");
        let config = GeocoderConfig {
            min_request_interval_ms: 1,
            workers: 3,
            checkpoint_interval: 2,
            ..Default::default()
        };
        let stub = Arc::new(StubService::new(answers));
        let cache = GeoCache::open(cache_path.clone()).unwrap();
        let client = ExternalClient::new(Box::new(SharedStub(stub.clone())), cache, &config);
        Fixture { index: sample_index(), client, stub, config, cache_path, _dir: dir }
    }

    fn run(f: &Fixture, inputs: &[RawAddress]) -> BatchOutcome {
        let resolver = TieredResolver::new(&f.index, &f.client, &f.config);
        let runner = BatchRunner::new(&resolver, &f.client, &f.config);
        runner.run(inputs, &CancelFlag::new(), None).unwrap()
    }

    #[test]
    fn test_results_in_input_order() {
        let f = fixture(vec![]);
        let inputs = vec![
            RawAddress::with_id("a", "Kungsgatan 12, 411 19 Göteborg"),
            RawAddress::with_id("b", "Avenyn 1, 411 36 Göteborg"),
        ];
        let outcome = run(&f, &inputs);

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].original_address, inputs[0].text);
        assert_eq!(outcome.results[1].original_address, inputs[1].text);
        assert_eq!(outcome.results[0].confidence, Confidence::Exact);
    }

    #[test]
    fn test_dedup_schedules_each_key_once() {
        let f = fixture(vec![("Fjärrgatan", (10.0, 20.0))]);
        // Nine inputs, two distinct keys: case/spacing variants collapse to
        // one key, number 11 is a second. Both only resolve externally.
        let mut inputs = Vec::new();
        for _ in 0..4 {
            inputs.push(RawAddress::new("Fjärrgatan 9, 999 99 Fjärrort"));
            inputs.push(RawAddress::new("FJÄRRGATAN 9,  999 99  FJÄRRORT"));
        }
        inputs.push(RawAddress::new("Fjärrgatan 11, 999 99 Fjärrort"));
        let outcome = run(&f, &inputs);

        assert_eq!(outcome.summary.total, 9);
        assert_eq!(outcome.summary.distinct, 2);
        // Both spellings resolve; each position carries its own text.
        for (input, result) in inputs.iter().zip(&outcome.results) {
            assert_eq!(result.original_address, input.text);
            assert_eq!(result.confidence, Confidence::External);
        }
        // One external query per distinct key, not per input.
        assert_eq!(f.stub.call_count(), 2);
    }

    #[test]
    fn test_summary_tallies_and_failures() {
        let f = fixture(vec![]);
        let inputs = vec![
            RawAddress::with_id("1", "Kungsgatan 12, 411 19 Göteborg"),
            RawAddress::with_id("2", "Helt Okänd Väg 7"),
        ];
        let outcome = run(&f, &inputs);

        assert_eq!(outcome.summary.count(Confidence::Exact), 1);
        assert_eq!(outcome.summary.count(Confidence::Failed), 1);
        assert_eq!(outcome.summary.failed.len(), 1);
        assert_eq!(outcome.summary.failed[0].id.as_deref(), Some("2"));
        assert_eq!(outcome.summary.failed[0].address, "Helt Okänd Väg 7");

        let rendered = outcome.summary.to_string();
        assert!(rendered.contains("exact: 1"));
        assert!(rendered.contains("Failed addresses:"));
    }

    #[test]
    fn test_checkpoint_resume_issues_no_repeat_calls() {
        let f = fixture(vec![("Fjärrgatan 9", (10.0, 20.0))]);
        let inputs = vec![
            RawAddress::new("Fjärrgatan 9, 999 99 Fjärrort"),
            RawAddress::new("Annan Okänd Gata 1"),
        ];
        run(&f, &inputs);
        let first_round = f.stub.call_count();
        assert!(first_round >= 1);

        // Simulate a process restart: same durable cache, fresh client.
        let config = f.config.clone();
        let cache = GeoCache::open(f.cache_path.clone()).unwrap();
        let client = ExternalClient::new(Box::new(SharedStub(f.stub.clone())), cache, &config);
        let resolver = TieredResolver::new(&f.index, &client, &config);
        let runner = BatchRunner::new(&resolver, &client, &config);
        let outcome = runner.run(&inputs, &CancelFlag::new(), None).unwrap();

        // Positive and negative entries both answer from the cache.
        assert_eq!(f.stub.call_count(), first_round);
        assert_eq!(outcome.results[0].confidence, Confidence::External);
        assert_eq!(outcome.results[1].confidence, Confidence::Failed);
    }

    #[test]
    fn test_partial_snapshot_written() {
        let f = fixture(vec![]);
        let partial = f._dir.path().join("partial.json");
        let inputs: Vec<RawAddress> = (0..5)
            .map(|i| RawAddress::new(format!("Kungsgatan 12, lgh {}, 411 19, Göteborg", i)))
            .collect();

        let resolver = TieredResolver::new(&f.index, &f.client, &f.config);
        let runner = BatchRunner::new(&resolver, &f.client, &f.config);
        runner.run(&inputs, &CancelFlag::new(), Some(&partial)).unwrap();

        let data = std::fs::read_to_string(&partial).unwrap();
        let snapshot: HashMap<String, ResolutionResult> = serde_json::from_str(&data).unwrap();
        assert_eq!(snapshot.len(), 5);
    }

    #[test]
    fn test_cancelled_run_marks_unscheduled_failed() {
        let f = fixture(vec![]);
        let inputs = vec![
            RawAddress::new("Kungsgatan 12, 411 19 Göteborg"),
            RawAddress::new("Avenyn 1, 411 36 Göteborg"),
        ];

        let cancel = CancelFlag::new();
        cancel.cancel();

        let resolver = TieredResolver::new(&f.index, &f.client, &f.config);
        let runner = BatchRunner::new(&resolver, &f.client, &f.config);
        let outcome = runner.run(&inputs, &cancel, None).unwrap();

        assert!(outcome.summary.cancelled);
        assert_eq!(outcome.summary.count(Confidence::Failed), 2);
        assert!(outcome.results.iter().all(|r| r.detail.contains("Cancelled")));
        assert_eq!(f.stub.call_count(), 0);
    }

    #[test]
    fn test_durable_cache_flushed_at_end() {
        let f = fixture(vec![("Fjärrgatan 9", (10.0, 20.0))]);
        let inputs = vec![RawAddress::new("Fjärrgatan 9, 999 99 Fjärrort")];
        run(&f, &inputs);

        // The on-disk store is readable by a later run.
        let reloaded = GeoCache::open(f.cache_path.clone()).unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
