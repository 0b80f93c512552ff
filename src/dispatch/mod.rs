//! Scrape dispatch: one worker per enabled site
//!
//! Each site worker restores its checkpoint (or issues the strategy's seed
//! set) and drains the pending queue: rate-limiter acquire, breaker check,
//! fetch under the retry engine, response validation, parse, enrich, upsert
//! through the change detector, checkpoint advance. Discovered pagination
//! and detail links append to the pending queue. Work across sites runs in
//! parallel; within a site strictly sequentially unless the site config
//! opts out.
//!
//! A URL whose retry cycle fails recoverably goes to the back of the queue
//! with its attempt counter bumped; once it exceeds the site's pass budget
//! (or fails non-recoverably) it moves to `failed_urls` and processing
//! continues. Failed URLs stay in the checkpoint for the next run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::checkpoint::{CheckpointSnapshot, CheckpointStore, FailureRecord, PendingUrl};
use crate::config::SiteConfig;
use crate::enrich::ListingEnricher;
use crate::error::HarvestError;
use crate::fetch::{FetchLayer, FetchRequest};
use crate::metrics::SessionMetrics;
use crate::resilience::classify::{ErrorKind, FetchFailure, RecoveryAction};
use crate::resilience::{
    CircuitBreaker, RateLimiter, ResponseValidator, RetryOutcome, RetryPolicy, Validation,
};
use crate::shutdown::ShutdownSignal;
use crate::sites::SiteStrategy;
use crate::store::ListingStore;
use crate::utils::extract_domain;

/// Escalations a site worker sends to the orchestrator
#[derive(Debug)]
pub enum DispatchEvent {
    /// The fetch layer found zero live forwards; a refresh is needed
    PoolExhausted { site: String },
}

/// Shared collaborators every site worker uses
pub struct DispatcherDeps {
    pub fetch: Arc<FetchLayer>,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub validator: ResponseValidator,
    pub retry: RetryPolicy,
    pub store: Arc<ListingStore>,
    pub checkpoints: CheckpointStore,
    pub metrics: Arc<SessionMetrics>,
    pub enricher: Arc<dyn ListingEnricher>,
    pub shutdown: ShutdownSignal,
    pub events: mpsc::Sender<DispatchEvent>,
}

/// Final tallies for one site's run
#[derive(Debug, Clone, Default)]
pub struct SiteSummary {
    pub site: String,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// True when the run drained every pending URL without interruption
    pub clean: bool,
}

/// One site's sequential worker
pub struct SiteDispatcher {
    site: String,
    config: SiteConfig,
    strategy: Arc<dyn SiteStrategy>,
    deps: Arc<DispatcherDeps>,
}

enum UrlOutcome {
    Completed,
    /// Recoverable failure; requeue if the pass budget allows
    Requeue(ErrorKind),
    /// Terminal failure
    Failed(ErrorKind),
    Cancelled,
}

impl SiteDispatcher {
    #[must_use]
    pub fn new(
        site: String,
        config: SiteConfig,
        strategy: Arc<dyn SiteStrategy>,
        deps: Arc<DispatcherDeps>,
    ) -> Self {
        Self {
            site,
            config,
            strategy,
            deps,
        }
    }

    /// Run the site to completion or shutdown
    pub async fn run(&self) -> Result<SiteSummary, HarvestError> {
        let handle = self.deps.checkpoints.open(&self.site);
        let mut snapshot = match self.deps.checkpoints.restore(&self.site).await? {
            Some(snapshot) => {
                info!(
                    "{}: resuming from checkpoint ({} pending)",
                    self.site,
                    snapshot.pending_urls.len()
                );
                snapshot
            }
            None => CheckpointSnapshot::new(&self.site, self.strategy.seed_urls()),
        };

        let run_id = uuid::Uuid::new_v4().to_string();
        let history_id = self
            .deps
            .store
            .record_run_start(&run_id, &self.site)
            .await
            .map_err(HarvestError::Other)?;

        let mut queue: VecDeque<PendingUrl> = snapshot.pending_urls.drain(..).collect();
        let mut summary = SiteSummary {
            site: self.site.clone(),
            ..SiteSummary::default()
        };
        let mut since_checkpoint = 0usize;
        let mut since_progress = 0usize;

        // Within-site politeness: one URL at a time unless the site config
        // opts into parallel processing
        let batch_size = if self.config.parallel { 4 } else { 1 };

        'site: while !queue.is_empty() {
            if self.deps.shutdown.is_triggered() {
                break;
            }
            if let Some(limit) = self.config.limit
                && summary.processed >= limit as u64
            {
                info!("{}: reached limit of {limit} URLs", self.site);
                break;
            }

            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                let Some(item) = queue.pop_front() else { break };
                batch.push(item);
            }

            let results =
                futures::future::join_all(batch.iter().map(|item| self.process_url(item))).await;

            let mut interrupted = false;
            for (mut item, (outcome, discovered)) in batch.into_iter().zip(results) {
                match outcome {
                    UrlOutcome::Completed => {
                        summary.processed += 1;
                        summary.succeeded += 1;
                        snapshot.completed_urls.insert(item.url.clone());
                        since_checkpoint += 1;
                        since_progress += 1;
                    }
                    UrlOutcome::Requeue(kind) => {
                        summary.processed += 1;
                        item.attempts += 1;
                        item.last_error_kind = Some(kind);
                        if item.attempts >= self.config.max_url_passes {
                            summary.failed += 1;
                            snapshot.failed_urls.insert(
                                item.url.clone(),
                                FailureRecord {
                                    attempts: item.attempts,
                                    last_error_kind: kind,
                                },
                            );
                        } else {
                            debug!(
                                "{}: requeueing {} (pass {}/{})",
                                self.site, item.url, item.attempts, self.config.max_url_passes
                            );
                            queue.push_back(item);
                        }
                    }
                    UrlOutcome::Failed(kind) => {
                        summary.processed += 1;
                        summary.failed += 1;
                        snapshot.failed_urls.insert(
                            item.url.clone(),
                            FailureRecord {
                                attempts: item.attempts + 1,
                                last_error_kind: kind,
                            },
                        );
                        since_checkpoint += 1;
                    }
                    UrlOutcome::Cancelled => {
                        // Back to the front: this URL was never attempted
                        // to completion
                        queue.push_front(item);
                        interrupted = true;
                        continue;
                    }
                }

                // Discovered URLs join the pending set unless already issued
                let issued = snapshot.issued();
                for url in discovered {
                    let known =
                        issued.contains(&url) || queue.iter().any(|p| p.url == url);
                    if !known {
                        queue.push_back(PendingUrl::new(url));
                    }
                }
            }

            if since_checkpoint >= self.config.checkpoint_every {
                since_checkpoint = 0;
                self.save_checkpoint(&handle, &mut snapshot, &queue).await;
            }
            if since_progress >= self.config.progress_every {
                since_progress = 0;
                info!(
                    "{}: {} processed, {} succeeded, {} failed, {} pending",
                    self.site,
                    summary.processed,
                    summary.succeeded,
                    summary.failed,
                    queue.len()
                );
            }

            if interrupted {
                break 'site;
            }
        }

        summary.clean = queue.is_empty() && !self.deps.shutdown.is_triggered();

        // Failed URLs stay checkpointed for the next run; a fully clean run
        // destroys the file
        if summary.clean && snapshot.failed_urls.is_empty() {
            self.deps
                .checkpoints
                .close(handle, true)
                .await
                .map_err(HarvestError::Other)?;
        } else {
            self.save_checkpoint(&handle, &mut snapshot, &queue).await;
            self.deps
                .checkpoints
                .close(handle, false)
                .await
                .map_err(HarvestError::Other)?;
        }

        self.deps
            .store
            .record_run_finish(history_id, summary.processed, summary.succeeded, summary.failed)
            .await
            .map_err(HarvestError::Other)?;

        info!(
            "{}: run finished ({} processed, {} succeeded, {} failed, clean={})",
            self.site, summary.processed, summary.succeeded, summary.failed, summary.clean
        );
        Ok(summary)
    }

    async fn save_checkpoint(
        &self,
        handle: &crate::checkpoint::CheckpointHandle,
        snapshot: &mut CheckpointSnapshot,
        queue: &VecDeque<PendingUrl>,
    ) {
        snapshot.pending_urls = queue.iter().cloned().collect();
        if let Err(e) = self.deps.checkpoints.save(handle, snapshot).await {
            warn!("{}: checkpoint save failed: {e:#}", self.site);
        }
    }

    /// Process one URL end to end
    ///
    /// Returns the outcome plus any URLs discovered during parsing; the run
    /// loop owns queue and checkpoint bookkeeping.
    async fn process_url(&self, item: &PendingUrl) -> (UrlOutcome, Vec<String>) {
        let url = &item.url;
        let domain = match extract_domain(url) {
            Ok(domain) => domain,
            Err(e) => {
                warn!("{}: dropping unparseable URL {url}: {e}", self.site);
                return (UrlOutcome::Failed(ErrorKind::Unknown), Vec::new());
            }
        };

        // Admission: token bucket, then breaker
        match self.deps.limiter.acquire(&domain, &self.deps.shutdown).await {
            Ok(waited) if waited > Duration::from_millis(50) => {
                self.deps.metrics.record_rate_limit_event();
            }
            Ok(_) => {}
            Err(HarvestError::Cancelled) => return (UrlOutcome::Cancelled, Vec::new()),
            Err(e) => {
                warn!("{}: limiter failed for {domain}: {e}", self.site);
                return (UrlOutcome::Requeue(ErrorKind::Unknown), Vec::new());
            }
        }

        if let Err(HarvestError::CircuitOpen { retry_in, .. }) =
            self.deps.breaker.check(&domain).await
        {
            debug!("{}: circuit open for {domain}, parking {url}", self.site);
            // Park briefly so the queue does not spin on an open circuit
            tokio::select! {
                () = tokio::time::sleep(retry_in.min(Duration::from_secs(10))) => {}
                () = self.deps.shutdown.wait() => return (UrlOutcome::Cancelled, Vec::new()),
            }
            return (UrlOutcome::Requeue(ErrorKind::Blocked), Vec::new());
        }

        let page_class = self.strategy.classify_page(url);
        let request = FetchRequest {
            url: url.clone(),
            mode: page_class.mode,
            timeout: self.config.fetch_timeout(),
        };

        // Fetch + validate under the retry engine; validation failures are
        // classified like any other failure so Blocked responses burn their
        // two retries and then count against the breaker
        let outcome = self
            .deps
            .retry
            .execute(&self.deps.shutdown, |ctx| {
                let request = request.clone();
                let domain = domain.clone();
                async move {
                    let exclude = if ctx.rotate_proxy { ctx.excluded_index } else { None };
                    let response = self.deps.fetch.fetch(&request, &domain, exclude).await?;

                    match self.deps.validator.validate(
                        &request.url,
                        response.status,
                        &response.body,
                        response.retry_after,
                        page_class.expectations,
                        self.strategy.count_results(&response.body) == 0,
                    ) {
                        Validation::Ok => Ok(response),
                        Validation::Blocked { reason } => Err(FetchFailure::from_error(
                            anyhow::anyhow!("soft block: {reason}"),
                        )
                        .with_status(response.status)
                        .with_body_snippet(crate::utils::clip_snippet(&response.body, 1024))),
                        Validation::RetryAfter(wait) => {
                            let mut failure = FetchFailure::from_error(anyhow::anyhow!(
                                "rate limited with Retry-After {wait:?}"
                            ))
                            .with_status(429);
                            failure.retry_after = Some(wait);
                            Err(failure)
                        }
                    }
                }
            })
            .await;

        let response = match outcome {
            RetryOutcome::Success(response) => {
                self.deps.breaker.record_success(&domain).await;
                response
            }
            RetryOutcome::Cancelled => return (UrlOutcome::Cancelled, Vec::new()),
            RetryOutcome::GaveUp { failure, plan, .. } => {
                // Blocked and ServerError count toward the breaker;
                // RateLimit is absorbed by the limiter
                if matches!(plan.kind, ErrorKind::Blocked | ErrorKind::ServerError)
                    && self.deps.breaker.record_failure(&domain).await
                {
                    self.deps.metrics.record_breaker_trip();
                }

                if plan.kind == ErrorKind::ProxyError
                    && self.deps.fetch_pool_is_empty()
                {
                    let _ = self
                        .deps
                        .events
                        .send(DispatchEvent::PoolExhausted {
                            site: self.site.clone(),
                        })
                        .await;
                    // Pause until the orchestrator's refresh restores the
                    // pool; spinning here would burn the retry budget of
                    // every remaining URL against an empty pool
                    while self.deps.fetch_pool_is_empty() {
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_secs(2)) => {}
                            () = self.deps.shutdown.wait() => {
                                return (UrlOutcome::Cancelled, Vec::new());
                            }
                        }
                    }
                    return (UrlOutcome::Requeue(plan.kind), Vec::new());
                }

                debug!("{}: {url} gave up: {}", self.site, failure.error);
                let outcome = match plan.action {
                    RecoveryAction::Skip | RecoveryAction::ManualReview => {
                        if plan.action == RecoveryAction::ManualReview {
                            warn!(
                                "{}: manual review needed for {url}: {:#}",
                                self.site, failure.error
                            );
                        }
                        UrlOutcome::Failed(plan.kind)
                    }
                    _ => UrlOutcome::Requeue(plan.kind),
                };
                return (outcome, Vec::new());
            }
        };

        // Parse, enrich, upsert
        match self.strategy.extract_listing(&response.body, url) {
            Ok(Some(mut record)) => {
                if let Err(e) = self.deps.enricher.enrich(&mut record).await {
                    warn!("{}: enrichment failed for {url}: {e:#}", self.site);
                }
                if let Err(e) = self.deps.store.upsert_listing(&record).await {
                    warn!("{}: upsert failed for {url}: {e:#}", self.site);
                    return (UrlOutcome::Requeue(ErrorKind::Unknown), Vec::new());
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{}: parse error on {url}: {e:#}", self.site);
                return (UrlOutcome::Failed(ErrorKind::ParseError), Vec::new());
            }
        }

        let discovered = self
            .strategy
            .extract_pagination(&response.body, url)
            .into_iter()
            .filter(|candidate| candidate != url)
            .collect();

        (UrlOutcome::Completed, discovered)
    }
}

impl DispatcherDeps {
    /// Whether the fetch layer's pool has run dry
    fn fetch_pool_is_empty(&self) -> bool {
        self.fetch.pool_is_empty()
    }
}
