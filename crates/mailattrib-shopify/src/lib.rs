//! Shopify Admin API integration: bulk order export trigger/resolution and
//! streaming decode of the newline-delimited JSON export file.

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use mailattrib_core::{OrderDraft, RefundEntry, User};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mailattrib-shopify";

pub const DEFAULT_API_VERSION: &str = "2024-01";

/// Orders younger than this are included in a bulk export.
pub const EXPORT_LOOKBACK_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty export body from {url}")]
    EmptyBody { url: String },
    #[error("bulk export rejected: {0}")]
    Rejected(String),
    #[error("bulk operation {0} has no result url yet")]
    NoResultUrl(String),
}

/// Line-level decode failure. Malformed lines are dropped from the batch,
/// never fatal to the whole import.
#[derive(Debug, Error)]
pub enum ExportLineError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unparseable money amount {0:?}")]
    Amount(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneyBag {
    pub shop_money: Money,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub address1: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub addresses: Vec<AddressRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundLineItemRecord {
    pub subtotal_set: MoneyBag,
    pub total_tax_set: MoneyBag,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRecord {
    #[serde(default)]
    pub refund_line_items: Vec<RefundLineItemRecord>,
}

/// One line of the bulk export file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub total_price_set: MoneyBag,
    #[serde(default)]
    pub discount_codes: Vec<String>,
    pub customer: Option<CustomerRecord>,
    #[serde(default)]
    pub refunds: Vec<RefundRecord>,
}

fn parse_amount(raw: &str) -> Result<f64, ExportLineError> {
    raw.trim()
        .parse()
        .map_err(|_| ExportLineError::Amount(raw.to_string()))
}

impl OrderRecord {
    /// Flatten the wire shape into the order store's handoff record: money
    /// strings parsed, refund line items collected across all refunds, first
    /// address entry's street/zip extracted.
    pub fn into_draft(self) -> Result<OrderDraft, ExportLineError> {
        let amount = parse_amount(&self.total_price_set.shop_money.amount)?;
        let mut refunds = Vec::new();
        for refund in &self.refunds {
            for item in &refund.refund_line_items {
                refunds.push(RefundEntry {
                    subtotal: parse_amount(&item.subtotal_set.shop_money.amount)?,
                    total_tax: parse_amount(&item.total_tax_set.shop_money.amount)?,
                });
            }
        }
        let customer = self.customer.unwrap_or_default();
        let first_address = customer.addresses.into_iter().next().unwrap_or_default();
        Ok(OrderDraft {
            external_id: self.id,
            created_at: self.created_at,
            amount,
            discount_codes: self.discount_codes,
            first_name: customer.first_name,
            last_name: customer.last_name,
            email: customer.email,
            address1: first_address.address1,
            zip: first_address.zip,
            refunds,
        })
    }
}

/// Decoded export file: orders plus the count of lines that were dropped.
#[derive(Debug, Clone, Default)]
pub struct ExportBatch {
    pub orders: Vec<OrderDraft>,
    pub skipped_lines: usize,
}

/// Incremental newline-delimited JSON decoder. Only fully received lines are
/// decoded; a trailing line without a final newline is flushed at end of
/// stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    orders: Vec<OrderDraft>,
    skipped_lines: usize,
}

impl LineDecoder {
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line[..line.len() - 1]);
        }
    }

    pub fn finish(mut self) -> ExportBatch {
        let trailing = std::mem::take(&mut self.buffer);
        self.decode_line(&trailing);
        ExportBatch {
            orders: self.orders,
            skipped_lines: self.skipped_lines,
        }
    }

    fn decode_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let decoded = serde_json::from_str::<OrderRecord>(text)
            .map_err(ExportLineError::from)
            .and_then(OrderRecord::into_draft);
        match decoded {
            Ok(draft) => self.orders.push(draft),
            Err(err) => {
                warn!(error = %err, "skipping malformed export line");
                self.skipped_lines += 1;
            }
        }
    }
}

/// Stream the export file at `url` and decode it line by line. Non-OK
/// responses and zero-byte bodies fail the whole read; malformed lines are
/// skipped and counted.
pub async fn read_export(http: &reqwest::Client, url: &str) -> Result<ExportBatch, FetchError> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let mut decoder = LineDecoder::default();
    let mut total_bytes = 0usize;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        total_bytes += chunk.len();
        decoder.feed(&chunk);
    }
    if total_bytes == 0 {
        return Err(FetchError::EmptyBody {
            url: url.to_string(),
        });
    }

    let batch = decoder.finish();
    debug!(
        orders = batch.orders.len(),
        skipped = batch.skipped_lines,
        "export decoded"
    );
    Ok(batch)
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct BulkRunData {
    #[serde(rename = "bulkOperationRunQuery")]
    bulk_operation_run_query: BulkRunPayload,
}

#[derive(Debug, Deserialize)]
struct BulkRunPayload {
    #[serde(rename = "bulkOperation")]
    bulk_operation: Option<BulkOperationNode>,
    #[serde(rename = "userErrors", default)]
    user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
struct UserError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct BulkOperationNode {
    id: String,
    #[allow(dead_code)]
    status: Option<String>,
    url: Option<String>,
    #[serde(rename = "partialDataUrl")]
    partial_data_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeData {
    node: Option<BulkOperationNode>,
}

const NODE_QUERY: &str = r#"query($id: ID!) {
  node(id: $id) {
    ... on BulkOperation { id status url partialDataUrl }
  }
}"#;

fn bulk_export_mutation(created_since: &str) -> String {
    format!(
        r#"mutation {{
  bulkOperationRunQuery(
    query: """
    {{
      orders(query: "created_at:>={created_since}") {{
        edges {{
          node {{
            id
            createdAt
            discountCodes
            totalPriceSet {{ shopMoney {{ amount }} }}
            customer {{
              firstName
              lastName
              email
              addresses {{ address1 zip }}
            }}
            refunds {{
              refundLineItems {{
                subtotalSet {{ shopMoney {{ amount }} }}
                totalTaxSet {{ shopMoney {{ amount }} }}
              }}
            }}
          }}
        }}
      }}
    }}
    """
  ) {{
    bulkOperation {{ id status }}
    userErrors {{ field message }}
  }}
}}"#
    )
}

/// One shared reqwest client per process, constructed in the wiring layer
/// and passed down explicitly.
pub fn build_http_client(timeout: std::time::Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout)
        .build()
        .map_err(FetchError::from)
}

/// Thin Admin GraphQL client scoped to the bulk-export flow. One shared
/// reqwest client is passed in at construction.
#[derive(Debug, Clone)]
pub struct ShopifyClient {
    http: reqwest::Client,
    api_version: String,
}

impl ShopifyClient {
    pub fn new(http: reqwest::Client, api_version: impl Into<String>) -> Self {
        Self {
            http,
            api_version: api_version.into(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn endpoint(&self, shop_domain: &str) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            shop_domain, self.api_version
        )
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        user: &User,
        body: serde_json::Value,
    ) -> Result<T, FetchError> {
        let url = self.endpoint(&user.shop_domain);
        let response = self
            .http
            .post(&url)
            .header("X-Shopify-Access-Token", &user.access_token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let envelope: GraphQlResponse<T> = response.json().await?;
        if let Some(err) = envelope.errors.first() {
            return Err(FetchError::Rejected(err.message.clone()));
        }
        envelope
            .data
            .ok_or_else(|| FetchError::Rejected("response without data".to_string()))
    }

    /// Issue the bulk-operation-run mutation covering the last 365 days of
    /// orders. Completion arrives later via webhook; nothing is recorded
    /// locally.
    pub async fn start_order_export(&self, user: &User) -> Result<String, FetchError> {
        let since = (Utc::now() - Duration::days(EXPORT_LOOKBACK_DAYS))
            .format("%Y-%m-%d")
            .to_string();
        let data: BulkRunData = self
            .graphql(user, json!({ "query": bulk_export_mutation(&since) }))
            .await?;
        let payload = data.bulk_operation_run_query;
        if let Some(user_error) = payload.user_errors.first() {
            return Err(FetchError::Rejected(user_error.message.clone()));
        }
        payload
            .bulk_operation
            .map(|op| op.id)
            .ok_or_else(|| FetchError::Rejected("mutation returned no bulk operation".to_string()))
    }

    /// Resolve a finished bulk operation to its downloadable result url,
    /// falling back to the partial-data url when the full one is absent.
    pub async fn resolve_export_url(
        &self,
        user: &User,
        operation_id: &str,
    ) -> Result<String, FetchError> {
        let data: NodeData = self
            .graphql(
                user,
                json!({ "query": NODE_QUERY, "variables": { "id": operation_id } }),
            )
            .await?;
        let node = data
            .node
            .ok_or_else(|| FetchError::NoResultUrl(operation_id.to_string()))?;
        node.url
            .or(node.partial_data_url)
            .ok_or_else(|| FetchError::NoResultUrl(operation_id.to_string()))
    }

    pub async fn download_export(&self, url: &str) -> Result<ExportBatch, FetchError> {
        read_export(&self.http, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_line(id: &str) -> String {
        format!(
            r#"{{"id":"gid://shopify/Order/{id}","createdAt":"2026-03-10T12:00:00Z","totalPriceSet":{{"shopMoney":{{"amount":"450.00"}}}},"discountCodes":["SAVE10"],"customer":{{"firstName":"Anna","lastName":"Berg","email":"anna@x.dk","addresses":[{{"address1":"Nygade 12","zip":"8000"}},{{"address1":"Other 1","zip":"9999"}}]}},"refunds":[{{"refundLineItems":[{{"subtotalSet":{{"shopMoney":{{"amount":"100.00"}}}},"totalTaxSet":{{"shopMoney":{{"amount":"25.00"}}}}}}]}}]}}"#
        )
    }

    #[test]
    fn record_flattens_into_a_draft() {
        let record: OrderRecord = serde_json::from_str(&order_line("1001")).unwrap();
        let draft = record.into_draft().unwrap();
        assert_eq!(draft.external_id, "gid://shopify/Order/1001");
        assert_eq!(draft.amount, 450.0);
        assert_eq!(draft.discount_codes, vec!["SAVE10".to_string()]);
        assert_eq!(draft.address1.as_deref(), Some("Nygade 12"));
        assert_eq!(draft.zip.as_deref(), Some("8000"));
        assert_eq!(
            draft.refunds,
            vec![RefundEntry {
                subtotal: 100.0,
                total_tax: 25.0,
            }]
        );
        assert_eq!(draft.refund_total(), 125.0);
    }

    #[test]
    fn record_without_customer_still_decodes() {
        let line = r#"{"id":"gid://shopify/Order/2","createdAt":"2026-03-10T12:00:00Z","totalPriceSet":{"shopMoney":{"amount":"10.00"}}}"#;
        let record: OrderRecord = serde_json::from_str(line).unwrap();
        let draft = record.into_draft().unwrap();
        assert!(draft.first_name.is_none());
        assert!(draft.address1.is_none());
        assert!(draft.refunds.is_empty());
    }

    #[test]
    fn unparseable_amount_is_a_line_error() {
        let line = r#"{"id":"gid://shopify/Order/3","createdAt":"2026-03-10T12:00:00Z","totalPriceSet":{"shopMoney":{"amount":"four-fifty"}}}"#;
        let record: OrderRecord = serde_json::from_str(line).unwrap();
        assert!(matches!(
            record.into_draft(),
            Err(ExportLineError::Amount(_))
        ));
    }

    #[test]
    fn decoder_skips_malformed_lines_and_keeps_their_neighbors() {
        let text = format!("{}\nnot json\n\n{}\n", order_line("1"), order_line("2"));
        let mut decoder = LineDecoder::default();
        decoder.feed(text.as_bytes());
        let batch = decoder.finish();
        assert_eq!(batch.orders.len(), 2);
        assert_eq!(batch.skipped_lines, 1);
    }

    #[test]
    fn decoder_flushes_a_complete_trailing_line_without_newline() {
        let text = format!("{}\n{}", order_line("1"), order_line("2"));
        let mut decoder = LineDecoder::default();
        decoder.feed(text.as_bytes());
        let batch = decoder.finish();
        assert_eq!(batch.orders.len(), 2);
        assert_eq!(batch.skipped_lines, 0);
    }

    #[test]
    fn decoder_waits_for_split_lines_to_complete() {
        let line = order_line("1");
        let (head, tail) = line.split_at(40);
        let mut decoder = LineDecoder::default();
        decoder.feed(head.as_bytes());
        decoder.feed(tail.as_bytes());
        decoder.feed(b"\n");
        let batch = decoder.finish();
        assert_eq!(batch.orders.len(), 1);
        assert_eq!(batch.skipped_lines, 0);
    }

    #[test]
    fn mutation_scopes_orders_to_the_lookback_window() {
        let mutation = bulk_export_mutation("2025-08-08");
        assert!(mutation.contains("bulkOperationRunQuery"));
        assert!(mutation.contains(r#"created_at:>=2025-08-08"#));
        assert!(mutation.contains("refundLineItems"));
    }
}
