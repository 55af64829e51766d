//! End-to-end reconciliation scenarios over the in-memory repository.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use mailattrib_core::{
    Campaign, CampaignStatus, OrderDraft, Profile, ProfileKind, RefundEntry, Segment, User,
};
use mailattrib_recon::{ReconConfig, Reconciler};
use mailattrib_shopify::{build_http_client, LineDecoder, ShopifyClient};
use mailattrib_storage::{MemoryRepository, Repository};
use uuid::Uuid;

fn campaign_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
}

struct Fixture {
    repo: Arc<MemoryRepository>,
    reconciler: Reconciler,
    user_id: Uuid,
    campaign: Campaign,
}

async fn fixture() -> Fixture {
    let repo = Arc::new(MemoryRepository::new());
    let user_id = Uuid::new_v4();
    let segment_id = Uuid::new_v4();
    let campaign = Campaign {
        id: Uuid::new_v4(),
        user_id,
        segment_id,
        discount_codes: vec!["SAVE10".to_string()],
        start_date: campaign_start(),
        status: CampaignStatus::Active,
        demo: false,
        design_id: None,
    };

    repo.insert_user(User {
        id: user_id,
        shop_domain: "demo-shop.myshopify.com".to_string(),
        access_token: "shpat_test".to_string(),
    })
    .await
    .unwrap();
    repo.insert_segment(Segment {
        id: segment_id,
        user_id,
        name: "spring mailing".to_string(),
    })
    .await
    .unwrap();
    repo.insert_campaign(campaign.clone()).await.unwrap();

    let config = ReconConfig::default();
    let http = build_http_client(config.http_timeout).unwrap();
    let reconciler = Reconciler::new(
        repo.clone(),
        ShopifyClient::new(http, config.api_version.clone()),
        &config,
    );
    Fixture {
        repo,
        reconciler,
        user_id,
        campaign,
    }
}

fn anna_profile(segment_id: Uuid) -> Profile {
    Profile {
        id: "profile-anna".to_string(),
        segment_id,
        kind: ProfileKind::Real,
        first_name: "anna".to_string(),
        last_name: "berg".to_string(),
        email: String::new(),
        address: "nygade 12b".to_string(),
        zip_code: "8000".to_string(),
        city: "aarhus".to_string(),
        country: "DK".to_string(),
        letter_sent: true,
        letter_sent_at: Some(campaign_start()),
        in_robinson: false,
        custom_variable: None,
        demo: false,
    }
}

fn anna_order(external_id: &str, days_after_start: i64) -> OrderDraft {
    OrderDraft {
        external_id: external_id.to_string(),
        created_at: campaign_start() + Duration::days(days_after_start),
        amount: 450.0,
        discount_codes: vec![],
        first_name: Some("Anna".to_string()),
        last_name: Some("Berg".to_string()),
        email: Some("anna@x.dk".to_string()),
        address1: Some("Nygade 12".to_string()),
        zip: Some("8000".to_string()),
        refunds: vec![],
    }
}

fn stranger_order(external_id: &str, days_after_start: i64) -> OrderDraft {
    OrderDraft {
        external_id: external_id.to_string(),
        created_at: campaign_start() + Duration::days(days_after_start),
        amount: 120.0,
        discount_codes: vec![],
        first_name: Some("Ole".to_string()),
        last_name: Some("Hansen".to_string()),
        email: Some("ole@elsewhere.dk".to_string()),
        address1: Some("Fjordvej 3".to_string()),
        zip: Some("5000".to_string()),
        refunds: vec![],
    }
}

#[tokio::test]
async fn out_of_window_orders_attribute_nothing() {
    let f = fixture().await;
    f.repo
        .insert_profile(anna_profile(f.campaign.segment_id))
        .await
        .unwrap();

    let mut early = anna_order("1000", -1);
    early.discount_codes = vec!["SAVE10".to_string()];
    let mut late = anna_order("1001", 61);
    late.discount_codes = vec!["SAVE10".to_string()];
    f.reconciler
        .upsert_orders(f.user_id, vec![early, late])
        .await
        .unwrap();

    let summary = f.reconciler.reconcile_user(f.user_id).await.unwrap();
    assert_eq!(summary.links_created, 0);
    // out-of-window also skips the discount fallback entirely
    assert!(f
        .repo
        .placeholder_profile(f.campaign.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn in_window_order_links_to_the_matching_mailed_profile_once() {
    let f = fixture().await;
    f.repo
        .insert_profile(anna_profile(f.campaign.segment_id))
        .await
        .unwrap();
    f.reconciler
        .upsert_orders(f.user_id, vec![anna_order("1001", 5)])
        .await
        .unwrap();

    let first = f.reconciler.reconcile_user(f.user_id).await.unwrap();
    assert_eq!(first.links_created, 1);
    assert_eq!(first.placeholder_links, 0);

    // replaying the reconciliation must not duplicate the link
    let second = f.reconciler.reconcile_user(f.user_id).await.unwrap();
    assert_eq!(second.links_created, 0);

    let order = f
        .repo
        .order_by_external_id(f.user_id, "1001")
        .await
        .unwrap()
        .unwrap();
    let links = f.repo.associations_for_order(order.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].profile_id, "profile-anna");
}

#[tokio::test]
async fn discount_coded_order_without_profile_match_uses_the_placeholder_once() {
    let f = fixture().await;
    let mut order = stranger_order("1001", 5);
    order.discount_codes = vec!["SAVE10".to_string()];
    f.reconciler
        .upsert_orders(f.user_id, vec![order])
        .await
        .unwrap();

    f.reconciler.reconcile_user(f.user_id).await.unwrap();
    let second = f.reconciler.reconcile_user(f.user_id).await.unwrap();
    assert_eq!(second.links_created, 0);

    let placeholder = f
        .repo
        .placeholder_profile(f.campaign.id)
        .await
        .unwrap()
        .expect("placeholder created lazily");
    assert_eq!(placeholder.id, f.campaign.placeholder_profile_id());
    assert!(placeholder.letter_sent);

    let order = f
        .repo
        .order_by_external_id(f.user_id, "1001")
        .await
        .unwrap()
        .unwrap();
    let links = f.repo.associations_for_order(order.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].profile_id, placeholder.id);
}

#[tokio::test]
async fn unmatched_uncoded_order_contributes_nothing() {
    let f = fixture().await;
    f.repo
        .insert_profile(anna_profile(f.campaign.segment_id))
        .await
        .unwrap();
    f.reconciler
        .upsert_orders(f.user_id, vec![stranger_order("1001", 5)])
        .await
        .unwrap();

    let summary = f.reconciler.reconcile_user(f.user_id).await.unwrap();
    assert_eq!(summary.links_created, 0);
    assert!(f
        .repo
        .placeholder_profile(f.campaign.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn full_refund_erases_the_order_and_its_attribution() {
    let f = fixture().await;
    f.repo
        .insert_profile(anna_profile(f.campaign.segment_id))
        .await
        .unwrap();
    f.reconciler
        .upsert_orders(f.user_id, vec![anna_order("1001", 5)])
        .await
        .unwrap();
    f.reconciler.reconcile_user(f.user_id).await.unwrap();

    let order = f
        .repo
        .order_by_external_id(f.user_id, "1001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.repo.associations_for_order(order.id).await.unwrap().len(), 1);

    let mut refunded = anna_order("1001", 5);
    refunded.refunds = vec![
        RefundEntry {
            subtotal: 400.0,
            total_tax: 0.0,
        },
        RefundEntry {
            subtotal: 50.0,
            total_tax: 0.0,
        },
    ];
    let summary = f
        .reconciler
        .upsert_orders(f.user_id, vec![refunded])
        .await
        .unwrap();
    assert_eq!(summary.deleted, 1);

    assert!(f
        .repo
        .order_by_external_id(f.user_id, "1001")
        .await
        .unwrap()
        .is_none());
    assert!(f.repo.associations_for_order(order.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn reimporting_an_identical_export_inserts_zero_new_orders() {
    let f = fixture().await;
    let drafts = vec![anna_order("1001", 5), stranger_order("1002", 6)];
    let first = f
        .reconciler
        .upsert_orders(f.user_id, drafts.clone())
        .await
        .unwrap();
    assert_eq!(first.inserted, 2);

    let second = f.reconciler.upsert_orders(f.user_id, drafts).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.refund_adjusted, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(f.repo.orders_for_user(f.user_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn overlapping_campaign_windows_attribute_independently() {
    let f = fixture().await;
    let other_segment = Uuid::new_v4();
    f.repo
        .insert_segment(Segment {
            id: other_segment,
            user_id: f.user_id,
            name: "reactivation mailing".to_string(),
        })
        .await
        .unwrap();
    let other_campaign = Campaign {
        id: Uuid::new_v4(),
        segment_id: other_segment,
        start_date: campaign_start() - Duration::days(10),
        ..f.campaign.clone()
    };
    f.repo.insert_campaign(other_campaign.clone()).await.unwrap();

    f.repo
        .insert_profile(anna_profile(f.campaign.segment_id))
        .await
        .unwrap();
    let mut second_profile = anna_profile(other_segment);
    second_profile.id = "profile-anna-reactivation".to_string();
    f.repo.insert_profile(second_profile).await.unwrap();

    f.reconciler
        .upsert_orders(f.user_id, vec![anna_order("1001", 5)])
        .await
        .unwrap();
    let summary = f.reconciler.reconcile_user(f.user_id).await.unwrap();
    assert_eq!(summary.links_created, 2);

    let order = f
        .repo
        .order_by_external_id(f.user_id, "1001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(f.repo.associations_for_order(order.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_export_lines_do_not_block_their_neighbors() {
    let f = fixture().await;
    let valid = |id: &str| {
        serde_json::json!({
            "id": id,
            "createdAt": "2026-03-06T12:00:00Z",
            "totalPriceSet": { "shopMoney": { "amount": "450.00" } },
            "customer": {
                "firstName": "Anna",
                "lastName": "Berg",
                "email": "anna@x.dk",
                "addresses": [{ "address1": "Nygade 12", "zip": "8000" }]
            }
        })
        .to_string()
    };
    let export = format!("{}\nnot json\n{}\n", valid("1001"), valid("1002"));

    let mut decoder = LineDecoder::default();
    decoder.feed(export.as_bytes());
    let batch = decoder.finish();
    assert_eq!(batch.skipped_lines, 1);

    let summary = f
        .reconciler
        .upsert_orders(f.user_id, batch.orders)
        .await
        .unwrap();
    assert_eq!(summary.inserted, 2);
    assert!(f
        .repo
        .order_by_external_id(f.user_id, "1001")
        .await
        .unwrap()
        .is_some());
    assert!(f
        .repo
        .order_by_external_id(f.user_id, "1002")
        .await
        .unwrap()
        .is_some());
}
