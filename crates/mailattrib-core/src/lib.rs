//! Core domain model and identity-matching primitives for mailattrib.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mailattrib-core";

/// Days after a campaign's start date during which an order can still be
/// attributed to it.
pub const ENROLLMENT_WINDOW_DAYS: i64 = 60;

/// Shared comparison normalization: trimmed, lower-cased.
pub fn fold(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Leading house-number-bearing prefix of a street address: everything up to
/// and including the first run of digits. "Bredgade 19, 1.tv." and
/// "Bredgade 19D" both reduce to "Bredgade 19". An address without digits is
/// returned unchanged.
pub fn street_prefix(address: &str) -> &str {
    let mut end = None;
    for (i, c) in address.char_indices() {
        if c.is_ascii_digit() {
            end = Some(i + c.len_utf8());
        } else if end.is_some() {
            break;
        }
    }
    match end {
        Some(e) => &address[..e],
        None => address,
    }
}

/// Last whitespace-separated token of a name, tolerant of middle names.
pub fn last_token(name: &str) -> &str {
    name.split_whitespace().last().unwrap_or("")
}

/// Customer identity carried on a stored order, normalized at write time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIdentity {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub address: String,
    pub zip: String,
}

/// Persisted order entity. The (user_id, external_id) pair is the dedup key;
/// amount only ever moves downward via refunds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
    pub amount: f64,
    pub discount_codes: Vec<String>,
    pub identity: OrderIdentity,
}

/// One refund line item from the storefront export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefundEntry {
    pub subtotal: f64,
    pub total_tax: f64,
}

/// Decoded-but-unnormalized order record handed from the export reader to
/// the order store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub external_id: String,
    pub created_at: DateTime<Utc>,
    pub amount: f64,
    pub discount_codes: Vec<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub address1: Option<String>,
    pub zip: Option<String>,
    pub refunds: Vec<RefundEntry>,
}

impl OrderDraft {
    /// Total refunded to date, summed over every refund line item.
    pub fn refund_total(&self) -> f64 {
        self.refunds.iter().map(|r| r.subtotal + r.total_tax).sum()
    }
}

/// Write-time normalization: identity fields lower-cased, missing fields
/// defaulting to empty strings.
pub fn format_order(user_id: Uuid, draft: &OrderDraft) -> Order {
    Order {
        id: Uuid::new_v4(),
        user_id,
        external_id: draft.external_id.clone(),
        created_at: draft.created_at,
        amount: draft.amount,
        discount_codes: draft.discount_codes.clone(),
        identity: OrderIdentity {
            first_name: fold(draft.first_name.as_deref().unwrap_or_default()),
            last_name: fold(draft.last_name.as_deref().unwrap_or_default()),
            email: fold(draft.email.as_deref().unwrap_or_default()),
            address: fold(draft.address1.as_deref().unwrap_or_default()),
            zip: fold(draft.zip.as_deref().unwrap_or_default()),
        },
    }
}

/// Mutation set for one order batch, computed inside the batch transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBatchPlan {
    pub inserts: Vec<Order>,
    pub amount_updates: Vec<(Uuid, f64)>,
    pub deletions: Vec<Uuid>,
}

impl OrderBatchPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.amount_updates.is_empty() && self.deletions.is_empty()
    }
}

/// Partition one incoming batch against the already-stored orders: unseen
/// external ids become inserts; stored orders whose incoming record carries
/// refund entries get a downward amount adjustment, or are deleted outright
/// when the refund total consumes the full amount. Stored orders without
/// refund entries are never touched.
pub fn plan_order_batch(
    user_id: Uuid,
    existing: &[Order],
    incoming: &[OrderDraft],
) -> OrderBatchPlan {
    let by_external_id: HashMap<&str, &Order> = existing
        .iter()
        .map(|order| (order.external_id.as_str(), order))
        .collect();

    let mut plan = OrderBatchPlan::default();
    let mut seen = HashSet::new();
    for draft in incoming {
        if !seen.insert(draft.external_id.as_str()) {
            continue;
        }
        match by_external_id.get(draft.external_id.as_str()) {
            None => plan.inserts.push(format_order(user_id, draft)),
            Some(order) => {
                if draft.refunds.is_empty() {
                    continue;
                }
                let adjusted = order.amount - draft.refund_total();
                if adjusted <= 0.0 {
                    plan.deletions.push(order.id);
                } else {
                    plan.amount_updates.push((order.id, adjusted));
                }
            }
        }
    }
    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Scheduled,
    Active,
    Paused,
}

impl CampaignStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "scheduled" => Some(Self::Scheduled),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// Mail campaign. Reconciliation reads only start_date, discount_codes,
/// segment_id and the demo flag; status transitions are driven elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub user_id: Uuid,
    pub segment_id: Uuid,
    pub discount_codes: Vec<String>,
    pub start_date: DateTime<Utc>,
    pub status: CampaignStatus,
    pub demo: bool,
    pub design_id: Option<Uuid>,
}

impl Campaign {
    pub fn window(&self) -> EnrollmentWindow {
        EnrollmentWindow {
            start: self.start_date,
            end: self.start_date + Duration::days(ENROLLMENT_WINDOW_DAYS),
        }
    }

    /// Stable id of this campaign's placeholder profile.
    pub fn placeholder_profile_id(&self) -> String {
        format!("additional-revenue-{}", self.id)
    }

    /// True when any of the given codes appears in the campaign's discount
    /// code list. Storefront discount codes compare case-insensitively.
    pub fn has_discount_code_overlap(&self, codes: &[String]) -> bool {
        codes.iter().any(|code| {
            self.discount_codes
                .iter()
                .any(|own| own.eq_ignore_ascii_case(code))
        })
    }
}

/// Closed interval [start, end] during which orders enroll into a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EnrollmentWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Real profiles were mailed to a person; placeholder profiles absorb
/// discount-coded revenue that matched nobody, one per campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileKind {
    Real,
    Placeholder { campaign_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub segment_id: Uuid,
    pub kind: ProfileKind,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub address: String,
    pub zip_code: String,
    pub city: String,
    pub country: String,
    pub letter_sent: bool,
    pub letter_sent_at: Option<DateTime<Utc>>,
    pub in_robinson: bool,
    pub custom_variable: Option<String>,
    pub demo: bool,
}

impl Profile {
    /// Lazily-created per-campaign revenue sink. letter_sent is set so the
    /// placeholder passes the same mailed-profiles scoping as real matches.
    pub fn placeholder_for(campaign: &Campaign) -> Self {
        Self {
            id: campaign.placeholder_profile_id(),
            segment_id: campaign.segment_id,
            kind: ProfileKind::Placeholder {
                campaign_id: campaign.id,
            },
            first_name: "additional".to_string(),
            last_name: "revenue".to_string(),
            email: String::new(),
            address: String::new(),
            zip_code: String::new(),
            city: String::new(),
            country: String::new(),
            letter_sent: true,
            letter_sent_at: None,
            in_robinson: false,
            custom_variable: None,
            demo: campaign.demo,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, ProfileKind::Placeholder { .. })
    }
}

/// Order-to-profile attribution link. At most one row per
/// (order_id, profile_id) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderProfile {
    pub order_id: Uuid,
    pub profile_id: String,
    pub created_at: DateTime<Utc>,
}

impl OrderProfile {
    pub fn new(order_id: Uuid, profile_id: impl Into<String>) -> Self {
        Self {
            order_id,
            profile_id: profile_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Named group of mail recipients, owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub shop_domain: String,
    pub access_token: String,
}

/// Disjunctive profile-match predicate derived from one order's identity and
/// one campaign's scope: exact email, or street-prefix containment plus
/// equal zip, first name, and last-name last token. All comparisons folded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFilter {
    pub segment_id: Uuid,
    pub demo: bool,
    pub email: String,
    pub street_prefix: String,
    pub zip: String,
    pub first_name: String,
    pub last_name_token: String,
}

impl MatchFilter {
    pub fn new(campaign: &Campaign, identity: &OrderIdentity) -> Self {
        Self {
            segment_id: campaign.segment_id,
            demo: campaign.demo,
            email: identity.email.clone(),
            street_prefix: street_prefix(&identity.address).to_string(),
            zip: identity.zip.clone(),
            first_name: identity.first_name.clone(),
            last_name_token: last_token(&identity.last_name).to_string(),
        }
    }

    pub fn matches(&self, profile: &Profile) -> bool {
        if profile.segment_id != self.segment_id
            || !profile.letter_sent
            || profile.demo != self.demo
        {
            return false;
        }
        if !self.email.is_empty() && fold(&profile.email) == self.email {
            return true;
        }
        // Orders without a usable postal identity never match on address.
        if self.zip.is_empty() || self.last_name_token.is_empty() {
            return false;
        }
        fold(&profile.address).contains(&self.street_prefix)
            && fold(&profile.zip_code) == self.zip
            && fold(&profile.first_name) == self.first_name
            && fold(last_token(&profile.last_name)) == self.last_name_token
    }
}
