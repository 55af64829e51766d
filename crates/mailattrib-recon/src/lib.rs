//! Order-to-profile reconciliation engine: bulk import of storefront orders
//! and attribution of in-window orders to mailed profiles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailattrib_core::{Campaign, MatchFilter, Order, OrderDraft, OrderProfile, Profile, User};
use mailattrib_shopify::{FetchError, ShopifyClient, DEFAULT_API_VERSION};
use mailattrib_storage::{RepoError, Repository, DEFAULT_ORDER_BATCH_SIZE};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mailattrib-recon";

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub api_version: String,
    pub order_batch_size: usize,
    pub http_timeout: Duration,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            order_batch_size: DEFAULT_ORDER_BATCH_SIZE,
            http_timeout: Duration::from_secs(20),
        }
    }
}

impl ReconConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_version: std::env::var("SHOPIFY_API_VERSION")
                .unwrap_or(defaults.api_version),
            order_batch_size: std::env::var("MAILATTRIB_ORDER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.order_batch_size),
            http_timeout: std::env::var("MAILATTRIB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("{failed} of {total} order batches failed: {first}")]
    PartialImport {
        failed: usize,
        total: usize,
        first: String,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImportSummary {
    pub batches: usize,
    pub inserted: usize,
    pub refund_adjusted: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileSummary {
    pub orders_scanned: usize,
    pub campaigns: usize,
    pub links_created: usize,
    pub placeholder_links: usize,
}

/// What one finished bulk export turned into.
#[derive(Debug, Clone, Serialize)]
pub struct ReconRunSummary {
    pub user_id: Uuid,
    pub operation_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub export_lines_skipped: usize,
    pub import: ImportSummary,
    pub reconcile: ReconcileSummary,
}

enum MatchOutcome {
    Linked(usize),
    PlaceholderLinked(usize),
    NoMatch,
}

/// Webhook-driven pipeline: trigger bulk export, then on completion read the
/// export, upsert orders, and attribute them to mailed profiles campaign by
/// campaign.
pub struct Reconciler {
    repo: Arc<dyn Repository>,
    shopify: ShopifyClient,
    order_batch_size: usize,
    user_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(repo: Arc<dyn Repository>, shopify: ShopifyClient, config: &ReconConfig) -> Self {
        Self {
            repo,
            shopify,
            order_batch_size: config.order_batch_size.max(1),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    async fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        self.user_locks
            .lock()
            .await
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn require_user(&self, user_id: Uuid) -> Result<User, ReconError> {
        self.repo
            .user(user_id)
            .await?
            .ok_or(ReconError::UserNotFound(user_id))
    }

    /// Ask the storefront to export the last year of orders. Completion is
    /// asynchronous; the webhook drives the rest.
    pub async fn trigger_bulk_export(&self, user_id: Uuid) -> Result<String, ReconError> {
        let user = self.require_user(user_id).await?;
        let operation_id = self.shopify.start_order_export(&user).await?;
        info!(%user_id, operation_id, "bulk order export started");
        Ok(operation_id)
    }

    /// Full pipeline for one finished export: resolve result url, stream and
    /// decode, store orders, reconcile against every campaign of the user.
    /// Safe to re-run with the same operation id.
    pub async fn on_bulk_export_finished(
        &self,
        user_id: Uuid,
        operation_id: &str,
    ) -> Result<ReconRunSummary, ReconError> {
        // Existence-check-then-insert is only safe while a single
        // reconciliation runs per user, so deliveries for the same user
        // serialize here rather than trusting the webhook sender.
        let lock = self.user_lock(user_id).await;
        let _serialized = lock.lock().await;

        let started_at = Utc::now();
        let user = self.require_user(user_id).await?;
        let url = self.shopify.resolve_export_url(&user, operation_id).await?;
        let export = self.shopify.download_export(&url).await?;
        let import = self.upsert_orders(user_id, export.orders).await?;
        let reconcile = self.reconcile_user(user_id).await?;

        let summary = ReconRunSummary {
            user_id,
            operation_id: operation_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            export_lines_skipped: export.skipped_lines,
            import,
            reconcile,
        };
        info!(
            %user_id,
            operation_id,
            inserted = import.inserted,
            deleted = import.deleted,
            links_created = reconcile.links_created,
            "bulk export reconciled"
        );
        Ok(summary)
    }

    /// Store one export's orders in fixed-size batches. Batches run as
    /// independent concurrent transactions; a failed batch never rolls back
    /// its siblings, and the call errors only after every batch settled.
    pub async fn upsert_orders(
        &self,
        user_id: Uuid,
        drafts: Vec<OrderDraft>,
    ) -> Result<ImportSummary, ReconError> {
        let mut set = JoinSet::new();
        let mut total = 0usize;
        for chunk in drafts.chunks(self.order_batch_size) {
            total += 1;
            let repo = Arc::clone(&self.repo);
            let batch = chunk.to_vec();
            set.spawn(async move { repo.import_order_batch(user_id, batch).await });
        }

        let mut summary = ImportSummary {
            batches: total,
            ..Default::default()
        };
        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    summary.inserted += outcome.inserted;
                    summary.refund_adjusted += outcome.refund_adjusted;
                    summary.deleted += outcome.deleted;
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "order batch failed");
                    failures.push(err.to_string());
                }
                Err(join_err) => {
                    warn!(error = %join_err, "order batch task aborted");
                    failures.push(join_err.to_string());
                }
            }
        }
        match failures.first() {
            Some(first) => Err(ReconError::PartialImport {
                failed: failures.len(),
                total,
                first: first.clone(),
            }),
            None => Ok(summary),
        }
    }

    /// Evaluate every stored order against every campaign window. Campaigns
    /// are independent, so one order may attribute into several overlapping
    /// windows.
    pub async fn reconcile_user(&self, user_id: Uuid) -> Result<ReconcileSummary, ReconError> {
        let campaigns = self.repo.campaigns_for_user(user_id).await?;
        let orders = self.repo.orders_for_user(user_id).await?;
        let mut summary = ReconcileSummary {
            orders_scanned: orders.len(),
            campaigns: campaigns.len(),
            ..Default::default()
        };
        for order in &orders {
            for campaign in &campaigns {
                if !campaign.window().contains(order.created_at) {
                    continue;
                }
                match self.match_order(order, campaign).await? {
                    MatchOutcome::Linked(created) => summary.links_created += created,
                    MatchOutcome::PlaceholderLinked(created) => {
                        summary.links_created += created;
                        summary.placeholder_links += created;
                    }
                    MatchOutcome::NoMatch => {}
                }
            }
        }
        Ok(summary)
    }

    /// One (order, campaign) evaluation: mailed-profile matches first, then
    /// the discount-code fallback onto the campaign's placeholder profile.
    async fn match_order(
        &self,
        order: &Order,
        campaign: &Campaign,
    ) -> Result<MatchOutcome, ReconError> {
        let filter = MatchFilter::new(campaign, &order.identity);
        let profiles = self.repo.matching_profiles(&filter).await?;
        if !profiles.is_empty() {
            let mut created = 0usize;
            for profile in &profiles {
                if self.link(order.id, &profile.id).await? {
                    created += 1;
                }
            }
            return Ok(MatchOutcome::Linked(created));
        }

        if campaign.has_discount_code_overlap(&order.discount_codes) {
            let placeholder = match self.repo.placeholder_profile(campaign.id).await? {
                Some(profile) => profile,
                None => {
                    let profile = Profile::placeholder_for(campaign);
                    self.repo.insert_profile(profile.clone()).await?;
                    profile
                }
            };
            let created = self.link(order.id, &placeholder.id).await?;
            return Ok(MatchOutcome::PlaceholderLinked(usize::from(created)));
        }

        Ok(MatchOutcome::NoMatch)
    }

    /// Existence-checked insert into the association ledger. Returns whether
    /// a new link was written.
    async fn link(&self, order_id: Uuid, profile_id: &str) -> Result<bool, ReconError> {
        if self.repo.association_exists(order_id, profile_id).await? {
            return Ok(false);
        }
        self.repo
            .insert_association(OrderProfile::new(order_id, profile_id))
            .await?;
        Ok(true)
    }
}
