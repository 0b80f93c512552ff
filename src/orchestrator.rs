//! Process-wide lifecycle
//!
//! Startup order: worker pool → checkpoint store → listing store → proxy
//! refresh (blocks until the live pool reaches the minimum) → scorer seed →
//! rotator supervisor → per-site dispatchers. Shutdown runs strictly in
//! reverse, each step bounded by a timeout. SIGINT/SIGTERM set the shared
//! shutdown signal; in-flight checkpoint saves finish before children are
//! terminated.
//!
//! Escalations that reach here end the run: pool exhaustion the refresh
//! cannot repair, a rotator crash beyond its restart budget, a corrupt
//! checkpoint.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::checkpoint::CheckpointStore;
use crate::config::HarvestConfig;
use crate::dispatch::{DispatchEvent, DispatcherDeps, SiteDispatcher, SiteSummary};
use crate::enrich::{ListingEnricher, NoopEnricher};
use crate::error::HarvestError;
use crate::fetch::{FetchLayer, StealthFetcher, stealth::StealthConfig};
use crate::jobs::WorkerPool;
use crate::metrics::SessionMetrics;
use crate::proxy::{
    ProxyScorer, ProxyValidator, RefreshConfig, RefreshPipeline, RotatorConfig, RotatorSupervisor,
    ScorerConfig, SupervisorEvent, ValidatorConfig,
};
use crate::resilience::{CircuitBreaker, LimiterSettings, RateLimiter, ResponseValidator};
use crate::shutdown::ShutdownSignal;
use crate::sites::StrategyRegistry;
use crate::store::ListingStore;

/// How the run ended, mapped to an exit code by the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All dispatchers drained cleanly
    Clean,
    /// Startup failed before any dispatcher ran
    StartupFailure,
    /// A mid-run escalation forced a shutdown
    MidRunFailure,
    /// SIGINT/SIGTERM observed
    Signalled,
}

impl RunOutcome {
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::StartupFailure => 1,
            Self::MidRunFailure => 2,
            Self::Signalled => 130,
        }
    }
}

/// Top-level coordinator owning every subsystem
pub struct Orchestrator {
    config: HarvestConfig,
    shutdown: ShutdownSignal,
    enricher: Arc<dyn ListingEnricher>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: HarvestConfig) -> Self {
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            enricher: Arc::new(NoopEnricher),
        }
    }

    /// Swap in an enrichment backend
    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn ListingEnricher>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Run the whole pipeline to completion, signal, or fatal error
    pub async fn run(&self) -> RunOutcome {
        let metrics = Arc::new(SessionMetrics::default());

        let outcome = match self.run_inner(Arc::clone(&metrics)).await {
            Ok(outcome) => outcome,
            Err(e) if self.shutdown.is_triggered() => {
                warn!("Startup interrupted by signal: {e:#}");
                RunOutcome::Signalled
            }
            Err(e) => {
                error!("Fatal: {e:#}");
                RunOutcome::StartupFailure
            }
        };

        // The session report goes out regardless of how the run ended
        let report = metrics.report();
        match serde_json::to_string_pretty(&report) {
            Ok(json) => info!("Session report:\n{json}"),
            Err(e) => warn!("Failed to render session report: {e}"),
        }
        info!("Run outcome: {outcome:?} (health: {:?})", report.health);

        outcome
    }

    async fn run_inner(&self, metrics: Arc<SessionMetrics>) -> Result<RunOutcome> {
        let config = &self.config;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .context("Failed to create data directory")?;

        self.install_signal_handlers();

        // --- worker pool ---
        let pool = WorkerPool::start(config.worker_parallelism, 256, self.shutdown.clone());

        // --- checkpoint + listing stores ---
        let checkpoints = CheckpointStore::open_dir(config.checkpoint_dir()).await?;
        let store = Arc::new(ListingStore::open(&config.db_path()).await?);

        // --- shared store connection (optional) ---
        let shared_conn = match (&config.shared_store_url, config.use_shared_store) {
            (Some(url), true) => {
                let client = redis::Client::open(url.as_str()).context("Invalid shared-store URL")?;
                Some(
                    client
                        .get_connection_manager()
                        .await
                        .context("Failed to connect to shared store")?,
                )
            }
            _ => None,
        };

        // --- scorer, seeded from file ---
        let scorer = Arc::new(ProxyScorer::new(ScorerConfig {
            endpoint_file: config.endpoint_file(),
            score_file: config.score_file(),
        }));
        scorer.seed_from_files().context("Failed to seed scorer")?;

        // --- refresh pipeline (blocks until the live pool is sufficient) ---
        let refresh = RefreshPipeline::new(
            RefreshConfig {
                scraper_binary: config.endpoint_scraper_binary.clone(),
                raw_output_path: config.raw_feed_path(),
                endpoint_file: config.endpoint_file(),
                chunk_size: config.validation_chunk_size,
                per_chunk_budget: config.per_chunk_budget,
                timeout_floor: Duration::from_secs(120),
                min_live: config.min_live_pool,
                zero_progress_window: config.zero_progress_window,
            },
            ProxyValidator::new(ValidatorConfig {
                rotator_binary: config.rotator_binary.clone(),
                judge_url: config.judge_url.clone(),
                ip_echo_url: config.ip_echo_url.clone(),
                reference_url: config.reference_url.clone(),
                probe_timeout: Duration::from_secs(10),
                real_ip: detect_real_ip(&config.ip_echo_url).await,
            }),
            Arc::clone(&pool),
            shared_conn.clone(),
            self.shutdown.clone(),
        );

        if scorer.len() < config.min_live_pool {
            info!(
                "Live pool below minimum ({}/{}), refreshing",
                scorer.len(),
                config.min_live_pool
            );
            refresh.run(&scorer).await.context("Initial proxy refresh failed")?;
        }

        // --- rotator supervisor ---
        let (supervisor_tx, mut supervisor_rx) = mpsc::channel::<SupervisorEvent>(4);
        let supervisor = RotatorSupervisor::new(
            RotatorConfig {
                binary: config.rotator_binary.clone(),
                listen_addr: config.rotator_listen_addr.clone(),
                endpoint_file: config.endpoint_file(),
                upstream_timeout: Duration::from_secs(30),
                max_errors: 3,
                grace: crate::utils::DEFAULT_CHILD_GRACE,
                restart_window: crate::utils::DEFAULT_RESTART_WINDOW,
                health_url: config.rotator_health_url.clone(),
                quiescence: crate::utils::DEFAULT_QUIESCENCE_DELAY,
            },
            supervisor_tx,
            self.shutdown.clone(),
        );
        supervisor.start().await.context("Failed to start rotator")?;
        // Let the rotator finish loading the endpoint list we may have just
        // written during refresh
        supervisor.quiesce().await;

        // --- fetch layer ---
        let stealth = StealthFetcher::new(StealthConfig {
            rotator_url: supervisor.proxy_url(),
            data_dir: config.browser_data_dir(),
            chrome_executable: config.chrome_executable.clone(),
        });
        let fetch = Arc::new(
            FetchLayer::new(
                &supervisor.proxy_url(),
                Arc::clone(&scorer),
                Arc::clone(&metrics),
                stealth,
            )
            .context("Failed to build fetch layer")?,
        );

        // --- resilience primitives ---
        let mut limiter_settings = LimiterSettings::default();
        for (name, site) in config.enabled_sites() {
            for seed in &site.seed_urls {
                if let Ok(domain) = crate::utils::extract_domain(seed) {
                    limiter_settings.per_domain.insert(domain, site.bucket());
                } else {
                    warn!("Site {name} has an unparseable seed URL: {seed}");
                }
            }
        }
        let limiter = Arc::new(match (&config.shared_store_url, config.use_shared_store) {
            (Some(url), true) => RateLimiter::shared(url, limiter_settings)
                .await
                .context("Failed to build shared rate limiter")?,
            _ => RateLimiter::local(limiter_settings),
        });
        let breaker = Arc::new(match (&config.shared_store_url, config.use_shared_store) {
            (Some(url), true) => CircuitBreaker::shared(url, config.breaker)
                .await
                .context("Failed to build shared circuit breaker")?,
            _ => CircuitBreaker::local(config.breaker),
        });

        // --- dispatchers ---
        let registry = StrategyRegistry::from_config(&config.sites)
            .context("Failed to build site strategies")?;
        let (events_tx, mut events_rx) = mpsc::channel::<DispatchEvent>(16);

        let deps = Arc::new(DispatcherDeps {
            fetch: Arc::clone(&fetch),
            limiter,
            breaker,
            validator: ResponseValidator::new(),
            retry: config.retry,
            store: Arc::clone(&store),
            checkpoints,
            metrics: Arc::clone(&metrics),
            enricher: Arc::clone(&self.enricher),
            shutdown: self.shutdown.clone(),
            events: events_tx,
        });

        let mut workers = Vec::new();
        for (name, site_config) in config.enabled_sites() {
            let Some(strategy) = registry.get(name) else {
                warn!("No strategy for enabled site {name}, skipping");
                continue;
            };
            let dispatcher = SiteDispatcher::new(
                name.clone(),
                site_config.clone(),
                strategy,
                Arc::clone(&deps),
            );
            workers.push(tokio::spawn(async move { dispatcher.run().await }));
        }
        info!("{} site dispatchers running", workers.len());

        // --- supervise until done, signalled, or escalated ---
        let mut outcome = RunOutcome::Clean;
        let mut summaries: Vec<SiteSummary> = Vec::new();
        let mut workers_done = false;
        let mut supervisor_alive = true;
        let mut dispatch_events_alive = true;

        while !workers_done {
            tokio::select! {
                () = self.shutdown.wait() => {
                    outcome = RunOutcome::Signalled;
                    break;
                }
                event = supervisor_rx.recv(), if supervisor_alive => {
                    match event {
                        Some(SupervisorEvent::CrashedBeyondBudget(reason)) => {
                            error!("Rotator crashed beyond budget: {reason}");
                            outcome = RunOutcome::MidRunFailure;
                            self.shutdown.trigger();
                            break;
                        }
                        None => supervisor_alive = false,
                    }
                }
                event = events_rx.recv(), if dispatch_events_alive => {
                    match event {
                        Some(DispatchEvent::PoolExhausted { site }) => {
                            warn!("Pool exhausted (reported by {site}), refreshing");
                            metrics.record_pool_exhaustion();
                            match refresh.run(&scorer).await {
                                Ok(count) => {
                                    supervisor.quiesce().await;
                                    info!("Pool restored with {count} forwards");
                                }
                                Err(e) => {
                                    error!("Refresh could not restore the pool: {e}");
                                    outcome = RunOutcome::MidRunFailure;
                                    self.shutdown.trigger();
                                    break;
                                }
                            }
                        }
                        None => dispatch_events_alive = false,
                    }
                }
                () = async {
                    // Poll worker completion without consuming the handles
                    loop {
                        if workers.iter().all(|worker| worker.is_finished()) {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                } => {
                    workers_done = true;
                }
            }
        }

        // --- collect dispatcher results ---
        for worker in workers {
            match tokio::time::timeout(Duration::from_secs(30), worker).await {
                Ok(Ok(Ok(summary))) => summaries.push(summary),
                Ok(Ok(Err(HarvestError::CheckpointCorrupt { path, reason }))) => {
                    error!("Corrupt checkpoint at {}: {reason}", path.display());
                    outcome = RunOutcome::MidRunFailure;
                }
                Ok(Ok(Err(e))) => {
                    error!("Dispatcher failed: {e}");
                    if outcome == RunOutcome::Clean {
                        outcome = RunOutcome::MidRunFailure;
                    }
                }
                Ok(Err(e)) => {
                    error!("Dispatcher task panicked: {e}");
                    outcome = RunOutcome::MidRunFailure;
                }
                Err(_) => {
                    warn!("Dispatcher did not finish within the shutdown timeout");
                    if outcome == RunOutcome::Clean {
                        outcome = RunOutcome::Signalled;
                    }
                }
            }
        }

        for summary in &summaries {
            info!(
                "Site {}: {} processed, {} succeeded, {} failed",
                summary.site, summary.processed, summary.succeeded, summary.failed
            );
        }

        // --- shutdown in reverse order, each step bounded ---
        fetch.shutdown_stealth().await;
        supervisor.stop().await;
        pool.stop().await;
        store.close().await;

        Ok(outcome)
    }

    /// SIGINT/SIGTERM set the shutdown signal observed at suspension points
    fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => info!("SIGINT received, shutting down"),
                    _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                info!("Ctrl-C received, shutting down");
            }
            shutdown.trigger();
        });
    }
}

/// Best-effort detection of the machine's real egress IP
///
/// Used by the proxy validator's transparency and /24 checks; validation
/// still runs (without those checks) when detection fails.
async fn detect_real_ip(ip_echo_url: &str) -> Option<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;
    let body = client.get(ip_echo_url).send().await.ok()?.text().await.ok()?;
    body.trim().parse().ok()
}
