//! Repository abstraction over the mailattrib persistence model, with an
//! in-memory implementation for tests/standalone use and a Postgres
//! implementation backed by sqlx.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use mailattrib_core::{
    plan_order_batch, Campaign, CampaignStatus, MatchFilter, Order, OrderDraft, OrderIdentity,
    OrderProfile, Profile, ProfileKind, Segment, User,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mailattrib-storage";

/// Orders per transactional import batch.
pub const DEFAULT_ORDER_BATCH_SIZE: usize = 1000;

/// Upper bound on one batch transaction; an elapsed timeout aborts that
/// batch only.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("transaction timed out after {0:?}")]
    TransactionTimeout(Duration),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Per-batch mutation counts reported by `import_order_batch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub refund_adjusted: usize,
    pub deleted: usize,
}

/// Narrow persistence surface the reconciliation engine is written against.
/// `import_order_batch` is transactional as a whole: fetch existing, plan,
/// insert/adjust/delete, all-or-nothing per batch.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_user(&self, user: User) -> Result<(), RepoError>;
    async fn user(&self, user_id: Uuid) -> Result<Option<User>, RepoError>;

    async fn insert_segment(&self, segment: Segment) -> Result<(), RepoError>;
    async fn insert_campaign(&self, campaign: Campaign) -> Result<(), RepoError>;
    async fn campaigns_for_user(&self, user_id: Uuid) -> Result<Vec<Campaign>, RepoError>;

    /// Idempotent: an existing profile with the same id is left untouched.
    async fn insert_profile(&self, profile: Profile) -> Result<(), RepoError>;
    async fn matching_profiles(&self, filter: &MatchFilter) -> Result<Vec<Profile>, RepoError>;
    async fn placeholder_profile(&self, campaign_id: Uuid) -> Result<Option<Profile>, RepoError>;

    async fn import_order_batch(
        &self,
        user_id: Uuid,
        batch: Vec<OrderDraft>,
    ) -> Result<BatchOutcome, RepoError>;
    async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, RepoError>;
    async fn order_by_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Order>, RepoError>;

    async fn association_exists(
        &self,
        order_id: Uuid,
        profile_id: &str,
    ) -> Result<bool, RepoError>;
    /// Idempotent: an existing (order, profile) pair is left untouched.
    async fn insert_association(&self, link: OrderProfile) -> Result<(), RepoError>;
    async fn associations_for_order(&self, order_id: Uuid) -> Result<Vec<OrderProfile>, RepoError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    segments: HashMap<Uuid, Segment>,
    campaigns: HashMap<Uuid, Campaign>,
    profiles: HashMap<String, Profile>,
    orders: HashMap<Uuid, Order>,
    associations: HashMap<(Uuid, String), OrderProfile>,
}

/// Tokio-mutex-guarded tables. Every operation holds the lock for its whole
/// duration, so each repository call is atomic.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_user(&self, user: User) -> Result<(), RepoError> {
        self.tables.lock().await.users.insert(user.id, user);
        Ok(())
    }

    async fn user(&self, user_id: Uuid) -> Result<Option<User>, RepoError> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn insert_segment(&self, segment: Segment) -> Result<(), RepoError> {
        self.tables.lock().await.segments.insert(segment.id, segment);
        Ok(())
    }

    async fn insert_campaign(&self, campaign: Campaign) -> Result<(), RepoError> {
        self.tables.lock().await.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn campaigns_for_user(&self, user_id: Uuid) -> Result<Vec<Campaign>, RepoError> {
        let tables = self.tables.lock().await;
        let mut campaigns: Vec<Campaign> = tables
            .campaigns
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| c.start_date);
        Ok(campaigns)
    }

    async fn insert_profile(&self, profile: Profile) -> Result<(), RepoError> {
        self.tables
            .lock()
            .await
            .profiles
            .entry(profile.id.clone())
            .or_insert(profile);
        Ok(())
    }

    async fn matching_profiles(&self, filter: &MatchFilter) -> Result<Vec<Profile>, RepoError> {
        let tables = self.tables.lock().await;
        let mut matched: Vec<Profile> = tables
            .profiles
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn placeholder_profile(&self, campaign_id: Uuid) -> Result<Option<Profile>, RepoError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .profiles
            .values()
            .find(|p| p.kind == ProfileKind::Placeholder { campaign_id })
            .cloned())
    }

    async fn import_order_batch(
        &self,
        user_id: Uuid,
        batch: Vec<OrderDraft>,
    ) -> Result<BatchOutcome, RepoError> {
        let apply = async {
            let mut tables = self.tables.lock().await;
            let batch_ids: HashSet<&str> = batch.iter().map(|d| d.external_id.as_str()).collect();
            let existing: Vec<Order> = tables
                .orders
                .values()
                .filter(|o| o.user_id == user_id && batch_ids.contains(o.external_id.as_str()))
                .cloned()
                .collect();

            let plan = plan_order_batch(user_id, &existing, &batch);
            let outcome = BatchOutcome {
                inserted: plan.inserts.len(),
                refund_adjusted: plan.amount_updates.len(),
                deleted: plan.deletions.len(),
            };

            for order in plan.inserts {
                tables.orders.insert(order.id, order);
            }
            for (order_id, amount) in plan.amount_updates {
                if let Some(order) = tables.orders.get_mut(&order_id) {
                    order.amount = amount;
                }
            }
            if !plan.deletions.is_empty() {
                for order_id in &plan.deletions {
                    tables.orders.remove(order_id);
                }
                tables
                    .associations
                    .retain(|(order_id, _), _| !plan.deletions.contains(order_id));
            }
            Ok(outcome)
        };
        match timeout(TRANSACTION_TIMEOUT, apply).await {
            Ok(result) => result,
            Err(_) => Err(RepoError::TransactionTimeout(TRANSACTION_TIMEOUT)),
        }
    }

    async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, RepoError> {
        let tables = self.tables.lock().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(orders)
    }

    async fn order_by_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Order>, RepoError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .values()
            .find(|o| o.user_id == user_id && o.external_id == external_id)
            .cloned())
    }

    async fn association_exists(
        &self,
        order_id: Uuid,
        profile_id: &str,
    ) -> Result<bool, RepoError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .associations
            .contains_key(&(order_id, profile_id.to_string())))
    }

    async fn insert_association(&self, link: OrderProfile) -> Result<(), RepoError> {
        self.tables
            .lock()
            .await
            .associations
            .entry((link.order_id, link.profile_id.clone()))
            .or_insert(link);
        Ok(())
    }

    async fn associations_for_order(&self, order_id: Uuid) -> Result<Vec<OrderProfile>, RepoError> {
        let tables = self.tables.lock().await;
        let mut links: Vec<OrderProfile> = tables
            .associations
            .values()
            .filter(|l| l.order_id == order_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        Ok(links)
    }
}

/// Postgres-backed repository. Queries are built at runtime so the crate
/// compiles without a live database.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> Result<Self, RepoError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), RepoError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const ORDER_COLUMNS: &str =
    "id, user_id, external_id, created_at, amount, discount_codes, first_name, last_name, email, address, zip";
const PROFILE_COLUMNS: &str = "id, segment_id, kind, placeholder_campaign_id, first_name, last_name, email, address, zip_code, city, country, letter_sent, letter_sent_at, in_robinson, custom_variable, demo";

fn order_from_row(row: &PgRow) -> Result<Order, RepoError> {
    Ok(Order {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
        amount: row.try_get("amount")?,
        discount_codes: row.try_get("discount_codes")?,
        identity: OrderIdentity {
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            email: row.try_get("email")?,
            address: row.try_get("address")?,
            zip: row.try_get("zip")?,
        },
    })
}

fn profile_from_row(row: &PgRow) -> Result<Profile, RepoError> {
    let kind_tag: String = row.try_get("kind")?;
    let kind = match kind_tag.as_str() {
        "real" => ProfileKind::Real,
        "placeholder" => {
            let campaign_id: Option<Uuid> = row.try_get("placeholder_campaign_id")?;
            let campaign_id = campaign_id.ok_or_else(|| {
                RepoError::Corrupt("placeholder profile without campaign id".to_string())
            })?;
            ProfileKind::Placeholder { campaign_id }
        }
        other => return Err(RepoError::Corrupt(format!("unknown profile kind {other}"))),
    };
    Ok(Profile {
        id: row.try_get("id")?,
        segment_id: row.try_get("segment_id")?,
        kind,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        address: row.try_get("address")?,
        zip_code: row.try_get("zip_code")?,
        city: row.try_get("city")?,
        country: row.try_get("country")?,
        letter_sent: row.try_get("letter_sent")?,
        letter_sent_at: row.try_get("letter_sent_at")?,
        in_robinson: row.try_get("in_robinson")?,
        custom_variable: row.try_get("custom_variable")?,
        demo: row.try_get("demo")?,
    })
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign, RepoError> {
    let status_tag: String = row.try_get("status")?;
    let status = CampaignStatus::parse(&status_tag)
        .ok_or_else(|| RepoError::Corrupt(format!("unknown campaign status {status_tag}")))?;
    Ok(Campaign {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        segment_id: row.try_get("segment_id")?,
        discount_codes: row.try_get("discount_codes")?,
        start_date: row.try_get("start_date")?,
        status,
        demo: row.try_get("demo")?,
        design_id: row.try_get("design_id")?,
    })
}

fn profile_kind_columns(profile: &Profile) -> (&'static str, Option<Uuid>) {
    match profile.kind {
        ProfileKind::Real => ("real", None),
        ProfileKind::Placeholder { campaign_id } => ("placeholder", Some(campaign_id)),
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn insert_user(&self, user: User) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO users (id, shop_domain, access_token) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(user.id)
        .bind(&user.shop_domain)
        .bind(&user.access_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user(&self, user_id: Uuid) -> Result<Option<User>, RepoError> {
        let row = sqlx::query("SELECT id, shop_domain, access_token FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(User {
                id: row.try_get("id")?,
                shop_domain: row.try_get("shop_domain")?,
                access_token: row.try_get("access_token")?,
            })
        })
        .transpose()
    }

    async fn insert_segment(&self, segment: Segment) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO segments (id, user_id, name) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(segment.id)
        .bind(segment.user_id)
        .bind(&segment.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_campaign(&self, campaign: Campaign) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO campaigns (id, user_id, segment_id, discount_codes, start_date, status, demo, design_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(campaign.id)
        .bind(campaign.user_id)
        .bind(campaign.segment_id)
        .bind(&campaign.discount_codes)
        .bind(campaign.start_date)
        .bind(campaign.status.as_str())
        .bind(campaign.demo)
        .bind(campaign.design_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn campaigns_for_user(&self, user_id: Uuid) -> Result<Vec<Campaign>, RepoError> {
        let rows = sqlx::query(
            "SELECT id, user_id, segment_id, discount_codes, start_date, status, demo, design_id
               FROM campaigns
              WHERE user_id = $1
              ORDER BY start_date",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn insert_profile(&self, profile: Profile) -> Result<(), RepoError> {
        let (kind_tag, placeholder_campaign_id) = profile_kind_columns(&profile);
        sqlx::query(&format!(
            "INSERT INTO profiles ({PROFILE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT (id) DO NOTHING"
        ))
        .bind(&profile.id)
        .bind(profile.segment_id)
        .bind(kind_tag)
        .bind(placeholder_campaign_id)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.email)
        .bind(&profile.address)
        .bind(&profile.zip_code)
        .bind(&profile.city)
        .bind(&profile.country)
        .bind(profile.letter_sent)
        .bind(profile.letter_sent_at)
        .bind(profile.in_robinson)
        .bind(&profile.custom_variable)
        .bind(profile.demo)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn matching_profiles(&self, filter: &MatchFilter) -> Result<Vec<Profile>, RepoError> {
        // SQL prefilters to a superset; MatchFilter::matches stays the
        // authoritative predicate.
        let rows = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS}
               FROM profiles
              WHERE segment_id = $1
                AND letter_sent
                AND demo = $2
                AND ((email <> '' AND LOWER(TRIM(email)) = $3)
                  OR (LOWER(TRIM(zip_code)) = $4 AND LOWER(address) LIKE '%' || $5 || '%'))
              ORDER BY id"
        ))
        .bind(filter.segment_id)
        .bind(filter.demo)
        .bind(&filter.email)
        .bind(&filter.zip)
        .bind(&filter.street_prefix)
        .fetch_all(&self.pool)
        .await?;
        let profiles = rows
            .iter()
            .map(profile_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles.into_iter().filter(|p| filter.matches(p)).collect())
    }

    async fn placeholder_profile(&self, campaign_id: Uuid) -> Result<Option<Profile>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS}
               FROM profiles
              WHERE kind = 'placeholder' AND placeholder_campaign_id = $1"
        ))
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn import_order_batch(
        &self,
        user_id: Uuid,
        batch: Vec<OrderDraft>,
    ) -> Result<BatchOutcome, RepoError> {
        let apply = async {
            let batch_ids: Vec<String> = batch.iter().map(|d| d.external_id.clone()).collect();
            let mut tx = self.pool.begin().await?;

            let rows = sqlx::query(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 AND external_id = ANY($2)"
            ))
            .bind(user_id)
            .bind(&batch_ids)
            .fetch_all(&mut *tx)
            .await?;
            let existing = rows
                .iter()
                .map(order_from_row)
                .collect::<Result<Vec<_>, _>>()?;

            let plan = plan_order_batch(user_id, &existing, &batch);
            let outcome = BatchOutcome {
                inserted: plan.inserts.len(),
                refund_adjusted: plan.amount_updates.len(),
                deleted: plan.deletions.len(),
            };

            for order in &plan.inserts {
                sqlx::query(&format!(
                    "INSERT INTO orders ({ORDER_COLUMNS})
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
                ))
                .bind(order.id)
                .bind(order.user_id)
                .bind(&order.external_id)
                .bind(order.created_at)
                .bind(order.amount)
                .bind(&order.discount_codes)
                .bind(&order.identity.first_name)
                .bind(&order.identity.last_name)
                .bind(&order.identity.email)
                .bind(&order.identity.address)
                .bind(&order.identity.zip)
                .execute(&mut *tx)
                .await?;
            }
            for (order_id, amount) in &plan.amount_updates {
                sqlx::query("UPDATE orders SET amount = $2 WHERE id = $1")
                    .bind(order_id)
                    .bind(amount)
                    .execute(&mut *tx)
                    .await?;
            }
            if !plan.deletions.is_empty() {
                // order_profiles rows go with their order via ON DELETE CASCADE
                sqlx::query("DELETE FROM orders WHERE id = ANY($1)")
                    .bind(&plan.deletions)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            debug!(
                inserted = outcome.inserted,
                refund_adjusted = outcome.refund_adjusted,
                deleted = outcome.deleted,
                "order batch committed"
            );
            Ok(outcome)
        };
        match timeout(TRANSACTION_TIMEOUT, apply).await {
            Ok(result) => result,
            Err(_) => Err(RepoError::TransactionTimeout(TRANSACTION_TIMEOUT)),
        }
    }

    async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, RepoError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY external_id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn order_by_external_id(
        &self,
        user_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Order>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 AND external_id = $2"
        ))
        .bind(user_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn association_exists(
        &self,
        order_id: Uuid,
        profile_id: &str,
    ) -> Result<bool, RepoError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM order_profiles WHERE order_id = $1 AND profile_id = $2)",
        )
        .bind(order_id)
        .bind(profile_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get(0)?)
    }

    async fn insert_association(&self, link: OrderProfile) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO order_profiles (order_id, profile_id, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (order_id, profile_id) DO NOTHING",
        )
        .bind(link.order_id)
        .bind(&link.profile_id)
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn associations_for_order(&self, order_id: Uuid) -> Result<Vec<OrderProfile>, RepoError> {
        let rows = sqlx::query(
            "SELECT order_id, profile_id, created_at FROM order_profiles
              WHERE order_id = $1 ORDER BY profile_id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(OrderProfile {
                    order_id: row.try_get("order_id")?,
                    profile_id: row.try_get("profile_id")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
