//! Balance Feed (C3): the authenticated real-time balance channel.
//!
//! Grounded on the teacher's `ingestor.rs::connect_and_listen`: the
//! exponential-backoff reconnection loop, the heartbeat-driven stall
//! detector running as an independent task, and the typed `match channel`
//! dispatch after parsing are carried over in shape and re-targeted at
//! Kraken's `balances` channel instead of Hyperliquid's `l2Book`/`trades`.

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::FeedError;
use crate::exchange::ExchangeClient;

const WS_URL: &str = "wss://ws-auth.kraken.com/v2";
const WS_URL_SANDBOX: &str = "wss://demo-futures.kraken.com/ws/v1";
const HEARTBEAT_WATCHDOG_PERIOD: Duration = Duration::from_secs(10);
const HEARTBEAT_STALL_AFTER: Duration = Duration::from_secs(30);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const SUBSCRIPTION_RETRY_DELAY: Duration = Duration::from_secs(5);

const PERMANENT_SUBSCRIPTION_ERRORS: &[&str] = &["invalid channel", "invalid token", "event not found"];

/// One entry of a `balances` snapshot message.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotEntry {
    pub asset: String,
    pub balance: Decimal,
}

/// One entry of a `balances` update message (§3 "Balance update event").
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Deposit,
    Withdrawal,
    Trade,
    Adjustment,
    Transfer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEntry {
    pub asset: String,
    #[serde(rename = "type")]
    pub kind: UpdateType,
    pub amount: Decimal,
    pub balance: Decimal,
    #[serde(default)]
    pub ledger_id: Option<String>,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BalancesPayload {
    Snapshot { data: Vec<SnapshotEntry> },
    Update { data: Vec<UpdateEntry> },
}

/// The tagged variant the feed decodes every inbound frame into exactly
/// once, so the engine (C4) never inspects raw JSON (§9 "dynamic-typed
/// event dispatch" redesign note).
#[derive(Debug)]
enum InboundMessage {
    Snapshot(HashMap<String, Decimal>),
    Update(Vec<UpdateEntry>),
    Heartbeat,
    TransientSubscriptionError(String),
    PermanentSubscriptionError(String),
    Ignored,
}

fn decode_frame(text: &str) -> Result<InboundMessage, FeedError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if value.get("channel").and_then(|c| c.as_str()) == Some("heartbeat") {
        return Ok(InboundMessage::Heartbeat);
    }

    if value.get("event").and_then(|e| e.as_str()) == Some("subscriptionStatus")
        && value.get("status").and_then(|s| s.as_str()) == Some("error")
    {
        let message = value
            .get("errorMessage")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown subscription error")
            .to_string();
        let lower = message.to_ascii_lowercase();
        return Ok(if PERMANENT_SUBSCRIPTION_ERRORS.iter().any(|p| lower.contains(p)) {
            InboundMessage::PermanentSubscriptionError(message)
        } else {
            InboundMessage::TransientSubscriptionError(message)
        });
    }

    if value.get("channel").and_then(|c| c.as_str()) != Some("balances") {
        return Ok(InboundMessage::Ignored);
    }

    let payload: BalancesPayload = serde_json::from_value(value)?;
    Ok(match payload {
        BalancesPayload::Snapshot { data } => {
            InboundMessage::Snapshot(data.into_iter().map(|e| (e.asset, e.balance)).collect())
        }
        BalancesPayload::Update { data } => InboundMessage::Update(data),
    })
}

/// Callbacks the engine (C4) registers to receive feed events. Kept as a
/// trait object so the feed does not need to know C4's internal shape,
/// mirroring how the teacher's ingestor only ever hands plain data back
/// through a shared buffer rather than calling into the execution engine
/// directly.
#[async_trait::async_trait]
pub trait BalanceSink: Send + Sync {
    /// Called exactly once per connection cycle, before any updates from
    /// that cycle.
    async fn on_snapshot(&self, balances: HashMap<String, Decimal>);
    async fn on_update(&self, event: UpdateEntry);
}

/// Shared, externally observable feed status (read by C5).
pub struct FeedStatus {
    connected: AtomicBool,
    degraded: AtomicBool,
    last_heartbeat_unix_ms: AtomicU64,
}

impl FeedStatus {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            last_heartbeat_unix_ms: AtomicU64::new(0),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn last_heartbeat_unix_ms(&self) -> u64 {
        self.last_heartbeat_unix_ms.load(Ordering::SeqCst)
    }

    fn touch_heartbeat(&self, now_ms: u64) {
        self.last_heartbeat_unix_ms.store(now_ms, Ordering::SeqCst);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct BalanceFeed {
    status: Arc<FeedStatus>,
    ws_url: &'static str,
}

impl BalanceFeed {
    pub fn new(sandbox: bool) -> Self {
        Self {
            status: Arc::new(FeedStatus::new()),
            ws_url: if sandbox { WS_URL_SANDBOX } else { WS_URL },
        }
    }

    pub fn status(&self) -> Arc<FeedStatus> {
        self.status.clone()
    }

    /// Runs the feed forever: obtain token, connect, subscribe, dispatch,
    /// and on any close or error reconnect with exponential backoff
    /// (§4.3). Only returns if the hard reconnect cap is exceeded, at
    /// which point the feed is marked degraded and this task exits; the
    /// rest of the process (including the HTTP status surface) keeps
    /// running.
    pub async fn run(
        &self,
        exchange: Arc<dyn ExchangeClient>,
        sink: Arc<dyn BalanceSink>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            match self.run_one_cycle(&exchange, &sink).await {
                Ok(()) => {
                    // Clean close (shutdown requested elsewhere); stop reconnecting.
                    self.status.connected.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    log::warn!("balance feed cycle ended: {e}");
                    // `run_one_cycle` flips `connected` to true as soon as it
                    // subscribes, and only this loop ever flips it back to
                    // false (just below). So if it's still true here, this
                    // cycle did successfully (re)subscribe before dropping,
                    // and the backoff attempt counter resets per §4.3
                    // ("Attempt counter is reset on any successful
                    // resubscription") even though the cycle ultimately
                    // ended in error.
                    if self.status.connected() {
                        attempt = 0;
                    }
                    self.status.connected.store(false, Ordering::SeqCst);
                }
            }

            if attempt >= MAX_RECONNECT_ATTEMPTS {
                log::error!(
                    "balance feed reconnect cap ({MAX_RECONNECT_ATTEMPTS}) exceeded; marking degraded"
                );
                self.status.degraded.store(true, Ordering::SeqCst);
                return;
            }

            let delay = std::cmp::min(
                RECONNECT_BASE_DELAY.saturating_mul(1 << attempt),
                RECONNECT_MAX_DELAY,
            );
            attempt += 1;
            log::info!("reconnecting balance feed in {:?} (attempt {attempt})", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One subscribe-and-listen cycle. Returns `Ok(())` only on a
    /// deliberate clean shutdown (not currently triggered internally;
    /// reserved for a future external cancellation signal). Any socket
    /// close or transport error returns `Err` so the caller reconnects.
    async fn run_one_cycle(
        &self,
        exchange: &Arc<dyn ExchangeClient>,
        sink: &Arc<dyn BalanceSink>,
    ) -> Result<(), FeedError> {
        let token = exchange.obtain_feed_token().await?;

        let (ws_stream, _) = connect_async(self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "method": "subscribe",
            "params": { "channel": "balances", "token": token },
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        self.status.connected.store(true, Ordering::SeqCst);
        self.status.degraded.store(false, Ordering::SeqCst);
        self.status.touch_heartbeat(now_ms());
        log::info!("balance feed connected and subscribed");

        // Heartbeat watchdog: forcibly closes the connection by returning
        // an error from this cycle if no heartbeat has been observed
        // recently enough. We signal this back to the read loop through a
        // shared "stale" flag rather than closing the socket from another
        // task, since only the owning task may write to it (§5).
        let stale = Arc::new(AtomicBool::new(false));
        let watchdog_status = self.status.clone();
        let watchdog_stale = stale.clone();
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT_WATCHDOG_PERIOD).await;
                let last = watchdog_status.last_heartbeat_unix_ms();
                if now_ms().saturating_sub(last) > HEARTBEAT_STALL_AFTER.as_millis() as u64 {
                    log::warn!("no heartbeat observed recently; flagging feed stale");
                    watchdog_stale.store(true, Ordering::SeqCst);
                    break;
                }
            }
        });

        let mut subscription_retried = false;

        let result = loop {
            if stale.load(Ordering::SeqCst) {
                break Err(FeedError::Transport(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                ));
            }

            let msg = match read.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => break Err(FeedError::Transport(e)),
                None => {
                    break Err(FeedError::Transport(
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                    ))
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Ping(payload) => {
                    let _ = write.send(Message::Pong(payload)).await;
                    continue;
                }
                Message::Close(_) => break Err(FeedError::Transport(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                )),
                _ => continue,
            };

            match decode_frame(&text) {
                Ok(InboundMessage::Snapshot(balances)) => {
                    sink.on_snapshot(balances).await;
                }
                Ok(InboundMessage::Update(events)) => {
                    for event in events {
                        sink.on_update(event).await;
                    }
                }
                Ok(InboundMessage::Heartbeat) => {
                    self.status.touch_heartbeat(now_ms());
                }
                Ok(InboundMessage::TransientSubscriptionError(msg)) => {
                    if subscription_retried {
                        break Err(FeedError::TransientSubscription(msg));
                    }
                    subscription_retried = true;
                    log::warn!("transient subscription error, retrying once in {:?}: {msg}", SUBSCRIPTION_RETRY_DELAY);
                    tokio::time::sleep(SUBSCRIPTION_RETRY_DELAY).await;
                    let resubscribe = serde_json::json!({
                        "method": "subscribe",
                        "params": { "channel": "balances", "token": token },
                    });
                    if let Err(e) = write.send(Message::Text(resubscribe.to_string())).await {
                        break Err(FeedError::Transport(e));
                    }
                }
                Ok(InboundMessage::PermanentSubscriptionError(msg)) => {
                    break Err(FeedError::PermanentSubscription(msg));
                }
                Ok(InboundMessage::Ignored) => {}
                Err(e) => {
                    log::warn!("could not decode feed frame, ignoring: {e}");
                }
            }
        };

        watchdog.abort();
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_snapshot_frame() {
        let text = r#"{"channel":"balances","type":"snapshot","data":[{"asset":"ZUSD","balance":"100.0000"},{"asset":"XXBT","balance":"0.5"}]}"#;
        match decode_frame(text).unwrap() {
            InboundMessage::Snapshot(map) => {
                assert_eq!(map["ZUSD"], "100.0000".parse::<Decimal>().unwrap());
                assert_eq!(map["XXBT"], "0.5".parse::<Decimal>().unwrap());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn decodes_update_frame_with_deposit_type() {
        let text = r#"{"channel":"balances","type":"update","data":[{"asset":"XETH","type":"deposit","amount":"0.2","balance":"0.2","timestamp":"2024-01-01T00:00:00Z"}]}"#;
        match decode_frame(text).unwrap() {
            InboundMessage::Update(events) => {
                assert_eq!(events.len(), 1);
                assert!(matches!(events[0].kind, UpdateType::Deposit));
                assert_eq!(events[0].amount, "0.2".parse::<Decimal>().unwrap());
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn decodes_heartbeat_and_non_balances_channels_as_control() {
        assert!(matches!(decode_frame(r#"{"channel":"heartbeat"}"#).unwrap(), InboundMessage::Heartbeat));
        assert!(matches!(decode_frame(r#"{"channel":"status","data":[]}"#).unwrap(), InboundMessage::Ignored));
    }

    #[test]
    fn classifies_permanent_vs_transient_subscription_errors() {
        let permanent = r#"{"event":"subscriptionStatus","status":"error","errorMessage":"Invalid token"}"#;
        assert!(matches!(decode_frame(permanent).unwrap(), InboundMessage::PermanentSubscriptionError(_)));

        let transient = r#"{"event":"subscriptionStatus","status":"error","errorMessage":"Token race, try again"}"#;
        assert!(matches!(decode_frame(transient).unwrap(), InboundMessage::TransientSubscriptionError(_)));
    }

    #[test]
    fn feed_status_starts_disconnected_and_not_degraded() {
        let status = FeedStatus::new();
        assert!(!status.connected());
        assert!(!status.degraded());
    }
}
