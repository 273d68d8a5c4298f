//! parkwatch: live parking availability service.
//!
//! Single-binary Tokio application that:
//! 1. Registers configured facilities in the record store
//! 2. Serves nearby listings through a two-tier cache over Overpass mirrors
//! 3. Forecasts short-horizon availability from recorded history
//! 4. Drifts and broadcasts facility availability on a fixed period

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};

use availability::{
    seeded_rng, BroadcastScheduler, FacilityService, MemoryStore, PredictionEngine, RecordStore,
    SubscriptionRegistry, TieredCache, WILDCARD_TOPIC,
};
use common::{NewFacility, ServiceConfig};
use overpass_client::MirrorClient;

/// Parking availability service
#[derive(Parser)]
#[command(name = "parkwatch", about = "Live parking availability service")]
struct Cli {
    /// Query the mirrors once for facilities near --lat/--lng, print them, and exit.
    #[arg(long)]
    check_upstream: bool,

    #[arg(long, allow_hyphen_values = true)]
    lat: Option<f64>,

    #[arg(long, allow_hyphen_values = true)]
    lng: Option<f64>,

    /// Search radius in meters (defaults to listing.default_radius_m).
    #[arg(long)]
    radius: Option<u32>,

    /// Run a single broadcast cycle and exit.
    #[arg(long)]
    once: bool,

    /// Seed every random source for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
const LOG_CHANNEL: &str = "event-log";

// Distinct RNG streams per component.
const PREDICTION_STREAM: u64 = 1;
const BROADCAST_STREAM: u64 = 2;

async fn seed_facilities(service: &FacilityService, cfg: &ServiceConfig) {
    for seed in &cfg.facilities {
        let new = NewFacility {
            id: Some(seed.id.clone()),
            name: seed.name.clone(),
            total_spots: seed.total_spots,
            available_spots: seed.available_spots,
            location: seed.location(),
        };
        if let Err(e) = service.create_facility(new).await {
            warn!("Skipping configured facility {}: {}", seed.id, e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "parkwatch=info,overpass_client=info,availability=info".into()
            }),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    info!("parkwatch starting up...");

    // Load configuration.
    let mut cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if cli.seed.is_some() {
        cfg.rng_seed = cli.seed;
    }

    info!(
        "Upstream: attempts={}, timeout={}ms, backoff_base={}ms",
        cfg.upstream.attempts, cfg.upstream.attempt_timeout_ms, cfg.upstream.backoff_base_ms
    );
    info!(
        "Cache: area_ttl={}s, entity_ttl={}s; broadcast every {}s ({:?})",
        cfg.cache.area_ttl_secs,
        cfg.cache.entity_ttl_secs,
        cfg.broadcast.interval_secs,
        cfg.broadcast.fan_out
    );
    match cfg.rng_seed {
        Some(seed) => info!("Random sources seeded with {}", seed),
        None => debug!("Random sources seeded from entropy"),
    }

    // ── Shared state ─────────────────────────────────────────────────
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let cache = Arc::new(TieredCache::from_config(&cfg.cache));
    let registry = Arc::new(SubscriptionRegistry::new());
    let client = MirrorClient::http(&cfg.upstream).context("building Overpass client")?;
    info!("Overpass mirrors: {}", client.mirrors().join(", "));
    let engine = Arc::new(PredictionEngine::new(
        Arc::clone(&store),
        cfg.prediction.clone(),
        seeded_rng(cfg.rng_seed, PREDICTION_STREAM),
    ));

    let service = FacilityService::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        client,
        engine,
        registry.clone(),
        cfg.clone(),
    );
    seed_facilities(&service, &cfg).await;

    let scheduler = BroadcastScheduler::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        registry.clone(),
        cfg.broadcast.clone(),
        seeded_rng(cfg.rng_seed, BROADCAST_STREAM),
    );

    // ── Check-upstream mode ──────────────────────────────────────────
    if cli.check_upstream {
        let (Some(lat), Some(lng)) = (cli.lat, cli.lng) else {
            anyhow::bail!("--check-upstream requires --lat and --lng");
        };
        let facilities = service
            .list_nearby(lat, lng, cli.radius)
            .await
            .context("nearby listing failed")?;
        info!("Found {} facilities", facilities.len());
        println!("{}", serde_json::to_string_pretty(&facilities)?);
        return Ok(());
    }

    // ── Single-cycle mode ────────────────────────────────────────────
    if cli.once {
        match scheduler.run_cycle().await {
            Some(report) => info!(
                "Cycle: updated={} recorded={} failed={}",
                report.updated, report.recorded, report.failed
            ),
            None => warn!("Cycle skipped"),
        }
        let stats = service.stats().await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    // ── Spawn tasks ──────────────────────────────────────────────────
    let mut events = registry.connect(LOG_CHANNEL);
    registry.subscribe(LOG_CHANNEL, WILDCARD_TOPIC);
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(
                "{} {} available={} at {}",
                common::AVAILABILITY_EVENT,
                event.facility_id,
                event.available_spots,
                event.timestamp
            );
        }
    });

    if cfg.broadcast.enabled {
        scheduler.start();
    } else {
        info!("Broadcast job disabled");
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                match service.stats().await {
                    Ok(stats) => info!(
                        "HEARTBEAT: facilities={} spots={} available={} occupancy={:.1}% channels={} cached={}",
                        stats.count,
                        stats.total_spots,
                        stats.total_available,
                        stats.avg_occupancy,
                        registry.connected_count(),
                        cache.entity_len()
                    ),
                    Err(e) => warn!("Heartbeat stats failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    scheduler.stop().await;
    registry.disconnect(LOG_CHANNEL);
    event_log.abort();
    info!("parkwatch stopped");
    Ok(())
}
