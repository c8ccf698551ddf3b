//! Exchange Client (C1): authenticated REST operations against Kraken,
//! fronted by a shared rate limiter and retry policy.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ExchangeError;
use crate::signing::{sign_request, NonceGenerator};

const KRAKEN_REST_BASE: &str = "https://api.kraken.com";

#[derive(Debug, Clone)]
pub struct PairInfo {
    pub base: String,
    pub quote: String,
    pub pair_symbol: String,
    pub minimum_order_size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Open,
    Closed,
    Canceled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub pair_symbol: String,
    pub state: OrderState,
    pub volume_requested: Decimal,
    pub volume_executed: Decimal,
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub pair_symbol: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub cost: Decimal,
    pub fee: Decimal,
}

/// The operations the Liquidation Engine and Status Surface depend on.
/// Kept as a trait (mirroring the teacher's `ExchangeClient`) so tests can
/// substitute an in-memory double instead of a live Kraken connection.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn list_pairs(&self) -> Result<Vec<PairInfo>, ExchangeError>;
    async fn get_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError>;
    async fn submit_market_sell(&self, pair_symbol: &str, volume: Decimal) -> Result<String, ExchangeError>;
    async fn query_order(&self, order_id: &str) -> Result<Order, ExchangeError>;
    async fn query_trades(&self, trade_ids: &[String]) -> Result<Vec<Trade>, ExchangeError>;
    async fn obtain_feed_token(&self) -> Result<String, ExchangeError>;
}

/// Sliding-window admission control plus linear-backoff retry, shared by
/// every call the client makes. A single policy object configured once on
/// the client, rather than a per-call closure the way the teacher's code
/// guards individual endpoints ad hoc.
struct RequestPolicy {
    window: Mutex<Vec<Instant>>,
    capacity_per_sec: usize,
    min_spacing: Duration,
    last_call: Mutex<Option<Instant>>,
    max_attempts: u32,
    base_delay: Duration,
}

impl RequestPolicy {
    fn new() -> Self {
        Self {
            window: Mutex::new(Vec::new()),
            capacity_per_sec: 15,
            min_spacing: Duration::from_millis(100),
            last_call: Mutex::new(None),
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }

    async fn admit(&self) {
        loop {
            let now = Instant::now();
            let wait = {
                let mut window = self.window.lock().expect("request policy window mutex poisoned");
                window.retain(|t| now.duration_since(*t) < Duration::from_secs(1));

                let mut last_call = self.last_call.lock().expect("request policy last-call mutex poisoned");
                let spacing_wait = last_call.and_then(|t| self.min_spacing.checked_sub(now.duration_since(t)));

                if window.len() < self.capacity_per_sec && spacing_wait.is_none() {
                    window.push(now);
                    *last_call = Some(now);
                    None
                } else {
                    Some(spacing_wait.unwrap_or(Duration::from_millis(10)))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Runs `op` under admission control, retrying retryable failures with
    /// linear backoff (`attempt * base_delay`).
    async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.admit().await;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    log::warn!("retrying exchange call (attempt {attempt}/{}): {e}", self.max_attempts);
                    tokio::time::sleep(self.base_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct KrakenClient {
    http: reqwest::Client,
    api_key: String,
    api_secret: Vec<u8>,
    nonce: NonceGenerator,
    policy: RequestPolicy,
    base_url: String,
}

impl KrakenClient {
    pub fn new(api_key: String, api_secret: Vec<u8>, sandbox: bool) -> Self {
        let base_url = if sandbox {
            "https://demo-futures.kraken.com".to_string()
        } else {
            KRAKEN_REST_BASE.to_string()
        };
        Self {
            http: reqwest::Client::new(),
            api_key,
            api_secret,
            nonce: NonceGenerator::new(),
            policy: RequestPolicy::new(),
            base_url,
        }
    }

    async fn private_call(&self, endpoint: &str, mut params: Vec<(String, String)>) -> Result<serde_json::Value, ExchangeError> {
        let path = format!("/0/private/{endpoint}");
        let nonce = self.nonce.next();
        params.push(("nonce".to_string(), nonce.to_string()));
        let postdata = serde_urlencoded::to_string(&params).map_err(|e| ExchangeError::Decode(e.to_string()))?;
        let signature = sign_request(&self.api_secret, &path, nonce, &postdata);

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(ExchangeError::Transient(format!("HTTP {status}")));
        }
        let body: serde_json::Value = resp.json().await?;
        check_kraken_errors(&body)?;
        Ok(body)
    }

    async fn public_call(&self, endpoint: &str) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}/0/public/{endpoint}", self.base_url);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(ExchangeError::Transient(format!("HTTP {status}")));
        }
        let body: serde_json::Value = resp.json().await?;
        check_kraken_errors(&body)?;
        Ok(body)
    }
}

/// Kraken wraps both success and failure in `{"error": [...], "result": ...}`.
/// This classifies the first error string into our taxonomy so the retry
/// policy can decide on retryability without string-matching at every call site.
fn check_kraken_errors(body: &serde_json::Value) -> Result<(), ExchangeError> {
    let errors = body.get("error").and_then(|e| e.as_array());
    let Some(errors) = errors else { return Ok(()) };
    let Some(first) = errors.first().and_then(|e| e.as_str()) else { return Ok(()) };

    let lower = first.to_ascii_lowercase();
    if lower.contains("invalid nonce") {
        return Err(ExchangeError::BusinessRejection(first.to_string()));
    }
    if lower.contains("invalid key") || lower.contains("invalid signature") || lower.contains("permission denied") {
        return Err(ExchangeError::Authentication(first.to_string()));
    }
    if lower.contains("insufficient funds") || lower.contains("minimum not met") || lower.contains("unknown asset pair") {
        return Err(ExchangeError::BusinessRejection(first.to_string()));
    }
    if lower.contains("rate limit") || lower.contains("busy") || lower.contains("temporary") {
        return Err(ExchangeError::Transient(first.to_string()));
    }
    Err(ExchangeError::Validation(first.to_string()))
}

#[derive(Deserialize)]
struct KrakenPairEntry {
    base: String,
    quote: String,
    #[serde(default)]
    ordermin: Option<String>,
}

#[async_trait]
impl ExchangeClient for KrakenClient {
    async fn list_pairs(&self) -> Result<Vec<PairInfo>, ExchangeError> {
        let body = self.policy.run(|| self.public_call("AssetPairs")).await?;
        let result = body
            .get("result")
            .and_then(|r| r.as_object())
            .ok_or_else(|| ExchangeError::Decode("AssetPairs response missing result".into()))?;

        let mut pairs = Vec::new();
        for (symbol, entry) in result {
            let entry: KrakenPairEntry = serde_json::from_value(entry.clone())
                .map_err(|e| ExchangeError::Decode(format!("AssetPairs entry {symbol}: {e}")))?;
            let minimum_order_size = entry
                .ordermin
                .as_deref()
                .and_then(|s| s.parse::<Decimal>().ok())
                .unwrap_or(Decimal::ZERO);
            pairs.push(PairInfo {
                base: entry.base,
                quote: entry.quote,
                pair_symbol: symbol.clone(),
                minimum_order_size,
            });
        }
        Ok(pairs)
    }

    async fn get_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let body = self.policy.run(|| self.private_call("Balance", Vec::new())).await?;
        let result = body
            .get("result")
            .and_then(|r| r.as_object())
            .ok_or_else(|| ExchangeError::Decode("Balance response missing result".into()))?;

        let mut balances = HashMap::new();
        for (asset, amount) in result {
            let amount = amount
                .as_str()
                .ok_or_else(|| ExchangeError::Decode(format!("balance for {asset} was not a string")))?
                .parse::<Decimal>()
                .map_err(|e| ExchangeError::Decode(format!("balance for {asset}: {e}")))?;
            balances.insert(asset.clone(), amount);
        }
        Ok(balances)
    }

    async fn submit_market_sell(&self, pair_symbol: &str, volume: Decimal) -> Result<String, ExchangeError> {
        // This call is never retried by the shared policy: a transport
        // failure here is ambiguous (the order may or may not have reached
        // the matching engine), and retrying could double-sell. We make
        // exactly one attempt and translate any transport-layer failure
        // into `AmbiguousSubmission` for the engine to reconcile (§4.4.6).
        self.policy.admit().await;

        let path = "/0/private/AddOrder";
        let nonce = self.nonce.next();
        let params = vec![
            ("pair".to_string(), pair_symbol.to_string()),
            ("type".to_string(), "sell".to_string()),
            ("ordertype".to_string(), "market".to_string()),
            ("volume".to_string(), volume.normalize().to_string()),
            ("nonce".to_string(), nonce.to_string()),
        ];
        let postdata = serde_urlencoded::to_string(&params).map_err(|e| ExchangeError::Decode(e.to_string()))?;
        let signature = sign_request(&self.api_secret, path, nonce, &postdata);
        let url = format!("{}{}", self.base_url, path);

        let send_result = self
            .http
            .post(&url)
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(postdata)
            .send()
            .await;

        let resp = match send_result {
            Ok(resp) => resp,
            Err(e) => return Err(ExchangeError::AmbiguousSubmission(e.to_string())),
        };

        let status = resp.status();
        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return Err(ExchangeError::AmbiguousSubmission(format!("undecodable response (HTTP {status}): {e}"))),
        };

        check_kraken_errors(&body)?;

        body.get("result")
            .and_then(|r| r.get("txid"))
            .and_then(|t| t.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Decode("AddOrder response missing txid".into()))
    }

    async fn query_order(&self, order_id: &str) -> Result<Order, ExchangeError> {
        let params = vec![("txid".to_string(), order_id.to_string())];
        let body = self.policy.run(|| self.private_call("QueryOrders", params.clone())).await?;
        let entry = body
            .get("result")
            .and_then(|r| r.get(order_id))
            .ok_or_else(|| ExchangeError::NotFound(format!("order {order_id} not found")))?;

        let status = entry.get("status").and_then(|s| s.as_str()).unwrap_or("open");
        let state = match status {
            "closed" => OrderState::Closed,
            "canceled" | "expired" => OrderState::Canceled,
            "pending" => OrderState::Pending,
            _ => OrderState::Open,
        };

        let descr = entry.get("descr").and_then(|d| d.get("pair")).and_then(|p| p.as_str()).unwrap_or("");
        let volume_requested = entry.get("vol").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO);
        let volume_executed = entry.get("vol_exec").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO);

        Ok(Order {
            order_id: order_id.to_string(),
            pair_symbol: descr.to_string(),
            state,
            volume_requested,
            volume_executed,
        })
    }

    async fn query_trades(&self, trade_ids: &[String]) -> Result<Vec<Trade>, ExchangeError> {
        let params = vec![("txid".to_string(), trade_ids.join(","))];
        let body = self.policy.run(|| self.private_call("QueryTrades", params.clone())).await?;
        let result = body
            .get("result")
            .and_then(|r| r.as_object())
            .ok_or_else(|| ExchangeError::Decode("QueryTrades response missing result".into()))?;

        let mut trades = Vec::new();
        for (trade_id, entry) in result {
            trades.push(Trade {
                trade_id: trade_id.clone(),
                order_id: entry.get("ordertxid").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                pair_symbol: entry.get("pair").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                price: entry.get("price").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO),
                volume: entry.get("vol").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO),
                cost: entry.get("cost").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO),
                fee: entry.get("fee").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO),
            });
        }
        Ok(trades)
    }

    async fn obtain_feed_token(&self) -> Result<String, ExchangeError> {
        let body = self.policy.run(|| self.private_call("GetWebSocketsToken", Vec::new())).await?;
        body.get("result")
            .and_then(|r| r.get("token"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ExchangeError::Decode("GetWebSocketsToken response missing token".into()))
    }
}

/// In-memory double used in engine/registry tests, mirroring the teacher's
/// `SimExchange`. Not wired into `main` — exercised only by `#[cfg(test)]`
/// code in this crate.
pub struct SimExchange {
    pub balances: Mutex<HashMap<String, Decimal>>,
    pub pairs: Vec<PairInfo>,
    pub orders: Mutex<HashMap<String, Order>>,
    next_order_id: Mutex<u64>,
}

impl SimExchange {
    pub fn new(balances: HashMap<String, Decimal>, pairs: Vec<PairInfo>) -> Self {
        Self {
            balances: Mutex::new(balances),
            pairs,
            orders: Mutex::new(HashMap::new()),
            next_order_id: Mutex::new(1),
        }
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn list_pairs(&self) -> Result<Vec<PairInfo>, ExchangeError> {
        Ok(self.pairs.clone())
    }

    async fn get_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        Ok(self.balances.lock().expect("sim balances mutex poisoned").clone())
    }

    async fn submit_market_sell(&self, pair_symbol: &str, volume: Decimal) -> Result<String, ExchangeError> {
        let pair = self
            .pairs
            .iter()
            .find(|p| p.pair_symbol == pair_symbol)
            .ok_or_else(|| ExchangeError::BusinessRejection(format!("unknown pair {pair_symbol}")))?;

        let mut balances = self.balances.lock().expect("sim balances mutex poisoned");
        let available = balances.get(&pair.base).copied().unwrap_or(Decimal::ZERO);
        if available < volume {
            return Err(ExchangeError::BusinessRejection("insufficient funds".into()));
        }
        *balances.entry(pair.base.clone()).or_insert(Decimal::ZERO) -= volume;

        let mut next_id = self.next_order_id.lock().expect("sim order id mutex poisoned");
        let order_id = format!("SIM-{}", *next_id);
        *next_id += 1;

        self.orders.lock().expect("sim orders mutex poisoned").insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                pair_symbol: pair_symbol.to_string(),
                state: OrderState::Closed,
                volume_requested: volume,
                volume_executed: volume,
            },
        );

        Ok(order_id)
    }

    async fn query_order(&self, order_id: &str) -> Result<Order, ExchangeError> {
        self.orders
            .lock()
            .expect("sim orders mutex poisoned")
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("order {order_id} not found")))
    }

    async fn query_trades(&self, _trade_ids: &[String]) -> Result<Vec<Trade>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn obtain_feed_token(&self) -> Result<String, ExchangeError> {
        Ok("sim-token".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_usd_pair() -> PairInfo {
        PairInfo {
            base: "XXBT".into(),
            quote: "ZUSD".into(),
            pair_symbol: "XBTUSD".into(),
            minimum_order_size: "0.0001".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn sim_exchange_submits_and_debits_balance() {
        let mut balances = HashMap::new();
        balances.insert("XXBT".to_string(), Decimal::new(5, 1)); // 0.5
        let sim = SimExchange::new(balances, vec![btc_usd_pair()]);

        let order_id = sim.submit_market_sell("XBTUSD", Decimal::new(2, 1)).await.unwrap(); // 0.2
        let balance = sim.get_balance().await.unwrap();
        assert_eq!(balance["XXBT"], Decimal::new(3, 1)); // 0.3 remaining

        let order = sim.query_order(&order_id).await.unwrap();
        assert_eq!(order.state, OrderState::Closed);
        assert_eq!(order.volume_executed, Decimal::new(2, 1));
    }

    #[tokio::test]
    async fn sim_exchange_rejects_insufficient_funds() {
        let mut balances = HashMap::new();
        balances.insert("XXBT".to_string(), Decimal::new(1, 2)); // 0.01
        let sim = SimExchange::new(balances, vec![btc_usd_pair()]);

        let err = sim.submit_market_sell("XBTUSD", Decimal::new(5, 1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::BusinessRejection(_)));
    }

    #[test]
    fn kraken_error_taxonomy_classifies_invalid_nonce_as_retryable_business_rejection() {
        let body = serde_json::json!({ "error": ["EAPI:Invalid nonce"] });
        let err = check_kraken_errors(&body).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ExchangeError::BusinessRejection(_)));
    }

    #[test]
    fn kraken_error_taxonomy_classifies_auth_failures_as_non_retryable() {
        let body = serde_json::json!({ "error": ["EAPI:Invalid key"] });
        let err = check_kraken_errors(&body).unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(err, ExchangeError::Authentication(_)));
    }

    #[tokio::test]
    async fn rate_limiter_enforces_minimum_inter_call_spacing() {
        let policy = RequestPolicy::new();
        let start = Instant::now();
        policy.admit().await;
        policy.admit().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
