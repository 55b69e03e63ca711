use adresspunkt::{
    AddressIndex, AddressRecord, BatchRunner, CancelFlag, ExternalClient, GeoCache,
    GeocoderConfig, NominatimService, RawAddress, TieredResolver,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Batch address resolution against municipal registry data.
///
/// Reads one address per line (optionally `id<TAB>address`), resolves each
/// through the local registry with an external geocoding fallback, and
/// writes confidence-tagged results as JSON.
///
/// Examples:
///   adresspunkt --registry registry.json --input addresses.txt --output results.json
///   adresspunkt --registry registry.json --input addresses.txt --output results.json --offline
///   RUST_LOG=debug adresspunkt --registry registry.json --input a.txt --output r.json --workers 8
#[derive(Parser)]
#[command(name = "adresspunkt", version, about, long_about = None)]
struct Cli {
    /// Trusted registry: JSON array of {street, number, postcode, locality, lat, lon}.
    #[arg(long)]
    registry: PathBuf,

    /// Input addresses, one per line; a leading `id<TAB>` is kept as the id.
    #[arg(long)]
    input: PathBuf,

    /// Output file for the JSON result array.
    #[arg(long)]
    output: PathBuf,

    /// Durable query cache location. Defaults to ~/.adresspunkt/cache.json.
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Worker pool width.
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Minimum gap between external requests, in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Fuzzy street acceptance threshold (0-100).
    #[arg(long)]
    threshold: Option<f64>,

    /// Flush cache and write a partial snapshot every N resolutions.
    #[arg(long)]
    checkpoint: Option<usize>,

    /// Locality assumed when none can be extracted.
    #[arg(long)]
    default_locality: Option<String>,

    /// Country suffix appended to external queries.
    #[arg(long)]
    country: Option<String>,

    /// Geocoding endpoint (Nominatim-compatible).
    #[arg(long, default_value = "https://nominatim.openstreetmap.org")]
    endpoint: String,

    /// Offline mode: local tiers and cache hits only, no network calls.
    #[arg(long)]
    offline: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GeocoderConfig::default();
    if let Some(w) = cli.workers {
        config.workers = w;
    }
    if let Some(ms) = cli.interval_ms {
        config.min_request_interval_ms = ms;
    }
    if let Some(t) = cli.threshold {
        config.fuzzy_threshold = t;
    }
    if let Some(n) = cli.checkpoint {
        config.checkpoint_interval = n;
    }
    if let Some(ref locality) = cli.default_locality {
        config.default_locality = locality.clone();
    }
    if let Some(ref country) = cli.country {
        config.country_qualifier = country.clone();
    }
    if let Some(ref path) = cli.cache {
        config.cache_path = path.clone();
    }

    // ── Load registry and inputs ────────────────────────────────

    let registry_json = std::fs::read_to_string(&cli.registry)
        .map_err(|e| format!("cannot read registry {}: {}", cli.registry.display(), e))?;
    let records: Vec<AddressRecord> = serde_json::from_str(&registry_json)
        .map_err(|e| format!("bad registry {}: {}", cli.registry.display(), e))?;
    let index = AddressIndex::build(records);
    info!(records = index.len(), streets = index.street_names().len(), "registry indexed");

    let input_text = std::fs::read_to_string(&cli.input)
        .map_err(|e| format!("cannot read input {}: {}", cli.input.display(), e))?;
    let inputs: Vec<RawAddress> = input_text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once('\t') {
            Some((id, text)) => RawAddress::with_id(id.trim(), text.trim()),
            None => RawAddress::new(line.trim()),
        })
        .collect();
    info!(addresses = inputs.len(), "input loaded");

    // ── Wire up the engine ──────────────────────────────────────

    let cache = GeoCache::open(config.cache_path.clone())?;
    info!(entries = cache.len(), path = %config.cache_path.display(), "cache opened");

    let service = NominatimService::new(cli.endpoint.clone());
    let mut client = ExternalClient::new(Box::new(service), cache, &config);
    client.set_offline(cli.offline);

    let resolver = TieredResolver::new(&index, &client, &config);
    let runner = BatchRunner::new(&resolver, &client, &config);

    // ── Run and report ──────────────────────────────────────────

    let partial = cli.output.with_extension("partial.json");
    let cancel = CancelFlag::new();
    let outcome = runner.run(&inputs, &cancel, Some(&partial))?;

    let results_json = serde_json::to_string_pretty(&outcome.results)?;
    std::fs::write(&cli.output, results_json)
        .map_err(|e| format!("cannot write output {}: {}", cli.output.display(), e))?;
    info!(path = %cli.output.display(), "results written");

    // Human-readable report to stderr, machine-readable summary to stdout.
    eprint!("{}", outcome.summary);
    println!("{}", serde_json::to_string_pretty(&outcome.summary)?);

    Ok(())
}
