//! Exchange interface and the production Kalshi client.
//!
//! The core consumes the narrow `ExchangeApi` trait; tests substitute mocks.
//! The real client signs every request with RSA-PSS, honors the exchange
//! rate limit through a token bucket, and classifies failures into the four
//! behavioral kinds the pipeline understands: transient, auth, rejected,
//! unavailable.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy, Retryable};
use crate::types::{Action, Cents, Event, Market, MarketStatus, Quote, Side};

/// Behavioral error surface of the exchange adapter.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Worth retrying: network drop, timeout, 5xx.
    #[error("transient exchange error: {0}")]
    Transient(String),
    /// Request signature or credentials no longer accepted.
    #[error("exchange authentication expired: {0}")]
    AuthExpired(String),
    /// The exchange understood and refused (invalid limit, insufficient
    /// funds, market closed). Never retried.
    #[error("exchange rejected request: {0}")]
    Rejected(String),
    /// Persistent unavailability after retries.
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
    /// Throttled; retry no sooner than the server asks.
    #[error("exchange rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },
}

impl Retryable for ExchangeError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient(_)
                | ExchangeError::Unavailable(_)
                | ExchangeError::RateLimited { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// Limit order submission. `client_order_id` is the idempotency key: the
/// exchange deduplicates resubmissions carrying the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub ticker: String,
    pub action: Action,
    pub side: Side,
    pub count: i64,
    pub limit_price_cents: Cents,
    /// Unix seconds; the exchange cancels the order itself past this.
    pub expiration_ts: i64,
    pub client_order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Resting,
    Filled,
    Canceled,
    Expired,
}

/// Point-in-time order status. Queries are idempotent.
#[derive(Debug, Clone)]
pub struct OrderStatusView {
    pub state: OrderState,
    pub filled_count: i64,
    pub avg_fill_price_cents: Option<Cents>,
    pub fees_paid_cents: Cents,
}

#[derive(Debug, Clone)]
pub struct MarketsPage {
    pub markets: Vec<Market>,
    pub next_cursor: Option<String>,
}

/// Best bid/ask with visible size on both sides, in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderbookTop {
    pub yes_bid: Cents,
    pub yes_bid_depth: i64,
    pub yes_ask: Cents,
    pub yes_ask_depth: i64,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub ticker: String,
    pub net_contracts: i64,
    pub avg_price_cents: Cents,
}

/// The narrow surface the core requires from an exchange.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn list_open_markets(&self, cursor: Option<String>) -> Result<MarketsPage, ExchangeError>;
    async fn get_orderbook(&self, ticker: &str) -> Result<OrderbookTop, ExchangeError>;
    async fn list_events(&self) -> Result<Vec<Event>, ExchangeError>;
    async fn get_event(&self, event_ticker: &str) -> Result<Event, ExchangeError>;
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;
    async fn get_order(&self, order_id: &str) -> Result<OrderStatusView, ExchangeError>;
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;
    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;
    async fn get_balance(&self) -> Result<Cents, ExchangeError>;
}

/// Drain market pagination into one snapshot.
pub async fn fetch_all_open_markets<E: ExchangeApi + ?Sized>(
    exchange: &E,
) -> Result<Vec<Market>, ExchangeError> {
    let mut all = Vec::new();
    let mut cursor = None;
    loop {
        let page = exchange.list_open_markets(cursor).await?;
        all.extend(page.markets);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    Ok(all)
}

// =============================================================================
// KALSHI CLIENT
// =============================================================================

const DEFAULT_BASE_URL: &str = "https://api.elections.kalshi.com";
const API_PREFIX: &str = "/trade-api/v2";
/// Kalshi allows 10 req/s on the basic tier.
const REQUESTS_PER_SECOND: u32 = 10;

/// RSA-PSS credentials. Kalshi requires three headers per request:
/// KALSHI-ACCESS-KEY, KALSHI-ACCESS-TIMESTAMP, and a base64 signature of
/// `{timestamp_ms}{METHOD}{path}` with query parameters stripped.
pub struct KalshiAuth {
    api_key_id: String,
    signing_key: BlindedSigningKey<Sha256>,
}

impl std::fmt::Debug for KalshiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiAuth")
            .field("api_key_id", &self.api_key_id)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl KalshiAuth {
    /// Parse a PEM private key (PKCS#1 or PKCS#8). Env-sourced keys often
    /// carry literal `\n`; both forms are normalised.
    pub fn new(api_key_id: &str, pem: &str) -> Result<Self, ExchangeError> {
        let pem = pem.replace("\\n", "\n");
        let pem = pem.trim();
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| ExchangeError::AuthExpired(format!("bad RSA private key: {e}")))?;
        Ok(Self {
            api_key_id: api_key_id.to_string(),
            signing_key: BlindedSigningKey::<Sha256>::new(private_key),
        })
    }

    pub fn from_env() -> Result<Self, ExchangeError> {
        let key_id = std::env::var("KALSHI_API_KEY_ID")
            .map_err(|_| ExchangeError::AuthExpired("KALSHI_API_KEY_ID not set".into()))?;
        let pem = std::env::var("KALSHI_RSA_PRIVATE_KEY")
            .map_err(|_| ExchangeError::AuthExpired("KALSHI_RSA_PRIVATE_KEY not set".into()))?;
        Self::new(&key_id, &pem)
    }

    /// Sign `method path`, returning (timestamp_ms, base64 signature).
    fn sign(&self, method: &str, path: &str) -> (String, String) {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let path_without_query = path.split('?').next().unwrap_or(path);
        let message = format!("{timestamp}{method}{path_without_query}");
        let signature = self
            .signing_key
            .sign_with_rng(&mut rand::thread_rng(), message.as_bytes());
        let encoded = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());
        (timestamp, encoded)
    }

    fn headers(&self, method: &str, path: &str) -> reqwest::header::HeaderMap {
        let (timestamp, signature) = self.sign(method, path);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("KALSHI-ACCESS-KEY", self.api_key_id.parse().expect("key header"));
        headers.insert("KALSHI-ACCESS-TIMESTAMP", timestamp.parse().expect("ts header"));
        headers.insert("KALSHI-ACCESS-SIGNATURE", signature.parse().expect("sig header"));
        headers
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Authenticated, rate-limited Kalshi REST client.
pub struct KalshiClient {
    http: reqwest::Client,
    auth: KalshiAuth,
    base_url: String,
    limiter: DirectLimiter,
    retry: RetryPolicy,
}

impl KalshiClient {
    pub fn new(auth: KalshiAuth, base_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .expect("reqwest client");
        let quota = Quota::per_second(NonZeroU32::new(REQUESTS_PER_SECOND).expect("nonzero"));
        Self {
            http,
            auth,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            limiter: RateLimiter::direct(quota),
            retry: RetryPolicy::from_env(),
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        self.limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let headers = self.auth.headers(method.as_str(), path);
        let mut request = self.http.request(method, &url).headers(headers);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ExchangeError::Transient(format!("bad response body: {e}")));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body_text = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), retry_after, body_text))
    }

    async fn request_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        op_name: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        retry_async(&self.retry, op_name, || {
            self.request::<T>(method.clone(), path, body.clone(), query)
        })
        .await
    }
}

/// Map an HTTP failure to the behavioral error kinds.
fn classify_status(status: u16, retry_after: Option<u64>, body: String) -> ExchangeError {
    match status {
        401 | 403 => ExchangeError::AuthExpired(body),
        429 => ExchangeError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(1),
        },
        400..=499 => ExchangeError::Rejected(body),
        _ => ExchangeError::Unavailable(format!("HTTP {status}: {body}")),
    }
}

// ── Wire DTOs ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<MarketDto>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarketDto {
    ticker: String,
    #[serde(default)]
    event_ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    yes_bid: Cents,
    #[serde(default)]
    yes_ask: Cents,
    #[serde(default)]
    no_bid: Cents,
    #[serde(default)]
    no_ask: Cents,
    /// Open interest stands in for top-of-book depth on the markets feed.
    #[serde(default)]
    open_interest: i64,
    #[serde(default)]
    rules_primary: String,
    #[serde(default)]
    close_time: Option<chrono::DateTime<Utc>>,
}

impl MarketDto {
    fn into_market(self) -> Market {
        let status = match self.status.as_str() {
            "open" | "active" => MarketStatus::Open,
            "settled" | "finalized" => MarketStatus::Settled,
            _ => MarketStatus::Closed,
        };
        Market {
            ticker: self.ticker,
            event_ticker: self.event_ticker,
            title: self.title,
            subtitle: self.subtitle,
            status,
            quote: Quote {
                yes_bid: self.yes_bid,
                yes_ask: self.yes_ask,
                no_bid: self.no_bid,
                no_ask: self.no_ask,
            },
            yes_depth: self.open_interest,
            no_depth: self.open_interest,
            rules: self.rules_primary,
            close_time: self.close_time,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<EventDto>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventDto {
    event_ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    markets: Vec<EventMarketDto>,
}

#[derive(Debug, Deserialize)]
struct EventMarketDto {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    orderbook: OrderbookDto,
}

/// Kalshi publishes resting YES and NO bids as [price, size] levels; the
/// YES ask is the complement of the best NO bid.
#[derive(Debug, Deserialize)]
struct OrderbookDto {
    #[serde(default)]
    yes: Option<Vec<(Cents, i64)>>,
    #[serde(default)]
    no: Option<Vec<(Cents, i64)>>,
}

impl OrderbookDto {
    fn into_top(self) -> OrderbookTop {
        let best = |levels: Option<Vec<(Cents, i64)>>| {
            levels
                .unwrap_or_default()
                .into_iter()
                .max_by_key(|&(price, _)| price)
        };
        let yes = best(self.yes);
        let no = best(self.no);
        OrderbookTop {
            yes_bid: yes.map_or(0, |(p, _)| p),
            yes_bid_depth: yes.map_or(0, |(_, q)| q),
            yes_ask: no.map_or(100, |(p, _)| 100 - p),
            yes_ask_depth: no.map_or(0, |(_, q)| q),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    event: EventDto,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order: OrderDto,
}

#[derive(Debug, Deserialize)]
struct OrderDto {
    order_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    taker_fill_count: Option<i64>,
    #[serde(default)]
    maker_fill_count: Option<i64>,
    #[serde(default)]
    taker_fill_cost: Option<Cents>,
    #[serde(default)]
    maker_fill_cost: Option<Cents>,
    #[serde(default)]
    taker_fees: Option<Cents>,
    #[serde(default)]
    maker_fees: Option<Cents>,
}

impl OrderDto {
    fn filled_count(&self) -> i64 {
        self.taker_fill_count.unwrap_or(0) + self.maker_fill_count.unwrap_or(0)
    }

    fn into_status_view(self) -> OrderStatusView {
        let filled = self.filled_count();
        let cost = self.taker_fill_cost.unwrap_or(0) + self.maker_fill_cost.unwrap_or(0);
        let fees = self.taker_fees.unwrap_or(0) + self.maker_fees.unwrap_or(0);
        let state = match self.status.as_str() {
            "executed" | "filled" => OrderState::Filled,
            "canceled" | "cancelled" => OrderState::Canceled,
            "expired" => OrderState::Expired,
            _ => OrderState::Resting,
        };
        OrderStatusView {
            state,
            filled_count: filled,
            avg_fill_price_cents: (filled > 0).then(|| cost / filled),
            fees_paid_cents: fees,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Cents,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    market_positions: Vec<PositionDto>,
}

#[derive(Debug, Deserialize)]
struct PositionDto {
    ticker: String,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    market_exposure: Cents,
}

#[async_trait]
impl ExchangeApi for KalshiClient {
    async fn list_open_markets(&self, cursor: Option<String>) -> Result<MarketsPage, ExchangeError> {
        let mut query = vec![
            ("status", "open".to_string()),
            ("limit", "1000".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let path = format!("{API_PREFIX}/markets");
        let response: MarketsResponse = self
            .request_with_retry("list_open_markets", reqwest::Method::GET, &path, None, &query)
            .await?;
        debug!("fetched {} markets", response.markets.len());
        Ok(MarketsPage {
            markets: response.markets.into_iter().map(MarketDto::into_market).collect(),
            next_cursor: response.cursor,
        })
    }

    async fn get_orderbook(&self, ticker: &str) -> Result<OrderbookTop, ExchangeError> {
        let path = format!("{API_PREFIX}/markets/{ticker}/orderbook");
        let query = [("depth", "1".to_string())];
        let response: OrderbookResponse = self
            .request_with_retry("get_orderbook", reqwest::Method::GET, &path, None, &query)
            .await?;
        Ok(response.orderbook.into_top())
    }

    async fn list_events(&self) -> Result<Vec<Event>, ExchangeError> {
        let path = format!("{API_PREFIX}/events");
        let mut events = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("status", "open".to_string()),
                ("limit", "200".to_string()),
                ("with_nested_markets", "true".to_string()),
            ];
            if let Some(c) = cursor.take() {
                query.push(("cursor", c));
            }
            let response: EventsResponse = self
                .request_with_retry("list_events", reqwest::Method::GET, &path, None, &query)
                .await?;
            events.extend(response.events.into_iter().map(|e| Event {
                event_ticker: e.event_ticker,
                title: e.title,
                market_tickers: e.markets.into_iter().map(|m| m.ticker).collect(),
            }));
            match response.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(events)
    }

    async fn get_event(&self, event_ticker: &str) -> Result<Event, ExchangeError> {
        let path = format!("{API_PREFIX}/events/{event_ticker}");
        let query = [("with_nested_markets", "true".to_string())];
        let response: EventResponse = self
            .request_with_retry("get_event", reqwest::Method::GET, &path, None, &query)
            .await?;
        Ok(Event {
            event_ticker: response.event.event_ticker,
            title: response.event.title,
            market_tickers: response.event.markets.into_iter().map(|m| m.ticker).collect(),
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let path = format!("{API_PREFIX}/portfolio/orders");
        let body = serde_json::json!({
            "ticker": request.ticker,
            "client_order_id": request.client_order_id,
            "action": request.action.to_string(),
            "side": request.side.to_string(),
            "type": "limit",
            "count": request.count,
            "yes_price": request.limit_price_cents,
            "expiration_ts": request.expiration_ts,
        });
        let response: OrderResponse = self
            .request_with_retry("place_order", reqwest::Method::POST, &path, Some(body), &[])
            .await?;
        Ok(OrderAck {
            order_id: response.order.order_id,
        })
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderStatusView, ExchangeError> {
        let path = format!("{API_PREFIX}/portfolio/orders/{order_id}");
        let response: OrderResponse = self
            .request_with_retry("get_order", reqwest::Method::GET, &path, None, &[])
            .await?;
        Ok(response.order.into_status_view())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let path = format!("{API_PREFIX}/portfolio/orders/{order_id}");
        let _: serde_json::Value = self
            .request_with_retry("cancel_order", reqwest::Method::DELETE, &path, None, &[])
            .await?;
        Ok(())
    }

    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let path = format!("{API_PREFIX}/portfolio/positions");
        let response: PositionsResponse = self
            .request_with_retry("list_positions", reqwest::Method::GET, &path, None, &[])
            .await?;
        Ok(response
            .market_positions
            .into_iter()
            .map(|p| ExchangePosition {
                avg_price_cents: if p.position != 0 {
                    (p.market_exposure / p.position).abs()
                } else {
                    0
                },
                ticker: p.ticker,
                net_contracts: p.position,
            })
            .collect())
    }

    async fn get_balance(&self) -> Result<Cents, ExchangeError> {
        let path = format!("{API_PREFIX}/portfolio/balance");
        let response: BalanceResponse = self
            .request_with_retry("get_balance", reqwest::Method::GET, &path, None, &[])
            .await?;
        Ok(response.balance)
    }
}
