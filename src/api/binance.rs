use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{ExecutionClient, MarketDataSource, RetryPolicy};
use crate::config::{Credentials, ExchangeSettings};
use crate::error::ExchangeError;
use crate::models::{
    Candle, KlineInterval, MarginMode, OrderRequest, OrderResult, OrderSide, OrderStatus,
    Position, PositionSide,
};

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

// Error codes with special handling
const CODE_TIMESTAMP_OUTSIDE_WINDOW: i64 = -1021;
const CODE_INVALID_SIGNATURE: i64 = -1022;
const CODE_REJECTED_MBX_KEY: i64 = -2015;
const CODE_BAD_API_KEY_FORMAT: i64 = -2014;
const CODE_MARGIN_TYPE_UNCHANGED: i64 = -4046;
const CODE_DUPLICATE_CLIENT_ID: i64 = -4116;

/// Binance REST adapter: spot klines for the signal, USDⓈ-M futures for execution
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    http: Client,
    spot_base: String,
    futures_base: String,
    credentials: Credentials,
    quote_asset: String,
    recv_window_ms: u64,
    retry: RetryPolicy,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesOrder {
    client_order_id: String,
    status: String,
    side: String,
    orig_qty: String,
    executed_qty: String,
    #[serde(default)]
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    leverage: String,
    margin_type: String,
    #[serde(default)]
    position_side: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetBalance {
    asset: String,
    balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: String,
}

impl BinanceClient {
    pub fn new(settings: &ExchangeSettings, credentials: Credentials) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self::with_http(
            http,
            settings.spot_url(),
            settings.futures_url(),
            credentials,
            RetryPolicy::from_settings(settings),
            settings.requests_per_minute,
        )
        .with_recv_window(settings.recv_window_ms))
    }

    pub fn with_http(
        http: Client,
        spot_base: String,
        futures_base: String,
        credentials: Credentials,
        retry: RetryPolicy,
        requests_per_minute: u32,
    ) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));

        Self {
            http,
            spot_base: spot_base.trim_end_matches('/').to_string(),
            futures_base: futures_base.trim_end_matches('/').to_string(),
            credentials,
            quote_asset: "USDT".to_string(),
            recv_window_ms: 5_000,
            retry,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    /// Asset whose balance counts as account equity
    pub fn with_quote_asset(mut self, asset: &str) -> Self {
        self.quote_asset = asset.to_uppercase();
        self
    }

    /// Send a request, retrying transient failures per the retry policy
    async fn request(
        &self,
        method: Method,
        base: &str,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
    ) -> Result<String, ExchangeError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.rate_limiter.until_ready().await;

            match self.request_once(method.clone(), base, path, &params, signed).await {
                Ok(body) => {
                    if attempt > 1 {
                        tracing::info!(path, attempt, "Exchange request succeeded after retry");
                    }
                    return Ok(body);
                }
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "{} {} attempt {} failed: {}. Retrying in {:?}...",
                        method,
                        path,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(
        &self,
        method: Method,
        base: &str,
        path: &str,
        params: &[(String, String)],
        signed: bool,
    ) -> Result<String, ExchangeError> {
        let query = if signed {
            self.signed_query(params.to_vec())?
        } else {
            serde_urlencoded::to_string(params)
                .map_err(|e| ExchangeError::Fatal(format!("failed to encode query: {}", e)))?
        };

        let url = if query.is_empty() {
            format!("{}{}", base, path)
        } else {
            format!("{}{}?{}", base, path, query)
        };

        let mut builder = self.http.request(method, &url);
        if signed {
            builder = builder.header("X-MBX-APIKEY", &self.credentials.api_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_error(status, &body))
        }
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> Result<String, ExchangeError> {
        if !self.credentials.is_configured() {
            return Err(ExchangeError::Fatal(
                "API key and secret are required for signed requests".to_string(),
            ));
        }

        params.push(("recvWindow".into(), self.recv_window_ms.to_string()));
        params.push(("timestamp".into(), Utc::now().timestamp_millis().to_string()));

        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| ExchangeError::Fatal(format!("failed to encode query: {}", e)))?;
        let signature = sign_query(&self.credentials.api_secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        method: Method,
        base: &str,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
    ) -> Result<T, ExchangeError> {
        let body = self.request(method, base, path, params, signed).await?;
        serde_json::from_str(&body).map_err(|e| {
            ExchangeError::Fatal(format!("malformed response from {}: {}", path, e))
        })
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("limit".to_string(), limit.clamp(1, 1000).to_string()),
        ];

        let raw: Vec<Vec<serde_json::Value>> = self
            .get_json(Method::GET, &self.spot_base, "/api/v3/klines", params, false)
            .await?;

        raw.iter().map(|row| parse_kline(row)).collect()
    }

    async fn fetch_order(
        &self,
        method: Method,
        symbol: &str,
        client_id: &str,
    ) -> Result<OrderResult, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("origClientOrderId".to_string(), client_id.to_string()),
        ];
        let order: FuturesOrder = self
            .get_json(method, &self.futures_base, "/fapi/v1/order", params, true)
            .await?;
        order_result(order)
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    async fn latest_closed_candle(
        &self,
        symbol: &str,
        interval: KlineInterval,
    ) -> Result<Candle, ExchangeError> {
        // The newest kline is usually still open
        let candles = self.fetch_klines(symbol, interval, 2).await?;
        let now = Utc::now();

        candles
            .into_iter()
            .rev()
            .find(|c| c.close_time < now)
            .ok_or_else(|| {
                ExchangeError::Transient(format!("no closed {} candle for {} yet", interval, symbol))
            })
    }

    async fn recent_closed_candles(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let now = Utc::now();
        let mut candles = self.fetch_klines(symbol, interval, limit + 1).await?;
        candles.retain(|c| c.close_time < now);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        Ok(candles)
    }
}

#[async_trait]
impl ExecutionClient for BinanceClient {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.request(Method::POST, &self.futures_base, "/fapi/v1/leverage", params, true)
            .await?;
        Ok(())
    }

    async fn set_margin_mode(
        &self,
        symbol: &str,
        mode: MarginMode,
    ) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("marginType".to_string(), mode.as_exchange_str().to_string()),
        ];
        match self
            .request(Method::POST, &self.futures_base, "/fapi/v1/marginType", params, true)
            .await
        {
            Ok(_) => Ok(()),
            // Already in the requested mode
            Err(ExchangeError::Rejected { code, .. }) if code == CODE_MARGIN_TYPE_UNCHANGED => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut params = vec![
            ("symbol".to_string(), request.symbol.clone()),
            ("side".to_string(), request.side.as_str().to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), format_quantity(request.size)),
            ("newClientOrderId".to_string(), request.client_id.clone()),
            ("newOrderRespType".to_string(), "RESULT".to_string()),
        ];
        if request.reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        tracing::info!(
            client_id = %request.client_id,
            side = %request.side,
            size = request.size,
            reduce_only = request.reduce_only,
            "Sending futures order"
        );

        match self
            .get_json::<FuturesOrder>(Method::POST, &self.futures_base, "/fapi/v1/order", params, true)
            .await
        {
            Ok(order) => order_result(order),
            // An earlier attempt already reached the exchange
            Err(ExchangeError::Rejected { code, .. }) if code == CODE_DUPLICATE_CLIENT_ID => {
                tracing::info!(client_id = %request.client_id, "Order already placed, fetching status");
                self.get_order_status(&request.symbol, &request.client_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> Result<OrderResult, ExchangeError> {
        self.fetch_order(Method::DELETE, symbol, client_id).await
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> Result<OrderResult, ExchangeError> {
        self.fetch_order(Method::GET, symbol, client_id).await
    }

    async fn get_position(&self, symbol: &str) -> Result<Position, ExchangeError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let risks: Vec<PositionRisk> = self
            .get_json(Method::GET, &self.futures_base, "/fapi/v2/positionRisk", params, true)
            .await?;

        // One-way mode reports a single BOTH entry
        let risk = risks
            .into_iter()
            .filter(|r| r.symbol == symbol)
            .find(|r| r.position_side.as_deref().map_or(true, |s| s == "BOTH"))
            .ok_or_else(|| {
                ExchangeError::Fatal(format!("no position entry for {} in one-way mode", symbol))
            })?;

        position_from_risk(risk)
    }

    async fn account_equity(&self) -> Result<f64, ExchangeError> {
        let balances: Vec<AssetBalance> = self
            .get_json(Method::GET, &self.futures_base, "/fapi/v2/balance", Vec::new(), true)
            .await?;

        match balances.into_iter().find(|b| b.asset == self.quote_asset) {
            Some(b) => parse_number(&b.balance, "balance"),
            None => Ok(0.0),
        }
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let index: PremiumIndex = self
            .get_json(Method::GET, &self.futures_base, "/fapi/v1/premiumIndex", params, false)
            .await?;
        parse_number(&index.mark_price, "markPrice")
    }
}

/// HMAC-SHA256 signature of a query string, hex encoded
pub fn sign_query(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Fatal(format!("failed to init signer: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Quote asset of a symbol, used to pick the equity balance
pub fn quote_asset_of(symbol: &str) -> &'static str {
    ["USDT", "USDC", "BUSD"]
        .into_iter()
        .find(|q| symbol.ends_with(q))
        .unwrap_or("USDT")
}

fn classify_error(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::Transient(format!("rate limited ({})", status));
    }
    if status.is_server_error() {
        return ExchangeError::Transient(format!("server error {}: {}", status, body));
    }

    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => match err.code {
            CODE_TIMESTAMP_OUTSIDE_WINDOW => ExchangeError::Transient(err.msg),
            CODE_INVALID_SIGNATURE | CODE_REJECTED_MBX_KEY | CODE_BAD_API_KEY_FORMAT => {
                ExchangeError::Fatal(format!("authentication failed ({}): {}", err.code, err.msg))
            }
            _ if status == StatusCode::UNAUTHORIZED => {
                ExchangeError::Fatal(format!("authentication failed ({}): {}", err.code, err.msg))
            }
            code => ExchangeError::Rejected {
                code,
                message: err.msg,
            },
        },
        Err(_) if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
            ExchangeError::Fatal(format!("authentication failed ({})", status))
        }
        Err(_) => ExchangeError::Fatal(format!("malformed error response ({}): {}", status, body)),
    }
}

fn parse_kline(row: &[serde_json::Value]) -> Result<Candle, ExchangeError> {
    let malformed = || ExchangeError::Fatal(format!("malformed kline row: {:?}", row));

    if row.len() < 7 {
        return Err(malformed());
    }
    let time = |v: &serde_json::Value| -> Result<DateTime<Utc>, ExchangeError> {
        let ms = v.as_i64().ok_or_else(malformed)?;
        Utc.timestamp_millis_opt(ms).single().ok_or_else(malformed)
    };
    let number = |v: &serde_json::Value| -> Result<f64, ExchangeError> {
        v.as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(malformed)
    };

    Ok(Candle {
        open_time: time(&row[0])?,
        open: number(&row[1])?,
        high: number(&row[2])?,
        low: number(&row[3])?,
        close: number(&row[4])?,
        volume: number(&row[5])?,
        close_time: time(&row[6])?,
    })
}

fn parse_number(value: &str, field: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Fatal(format!("malformed {} '{}'", field, value)))
}

fn order_result(order: FuturesOrder) -> Result<OrderResult, ExchangeError> {
    let side = match order.side.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => return Err(ExchangeError::Fatal(format!("unknown order side '{}'", other))),
    };
    let size = parse_number(&order.orig_qty, "origQty")?;
    let filled_size = parse_number(&order.executed_qty, "executedQty")?;
    let avg_price = match order.avg_price.as_deref() {
        Some(p) => Some(parse_number(p, "avgPrice")?).filter(|p| *p > 0.0),
        None => None,
    };

    let status = match order.status.as_str() {
        "NEW" => OrderStatus::Pending,
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "FILLED" => OrderStatus::Filled,
        "REJECTED" => OrderStatus::Rejected,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Canceled,
        other => return Err(ExchangeError::Fatal(format!("unknown order status '{}'", other))),
    };

    Ok(OrderResult {
        client_id: order.client_order_id,
        side,
        size,
        filled_size,
        avg_price,
        status,
    })
}

fn position_from_risk(risk: PositionRisk) -> Result<Position, ExchangeError> {
    let amount = parse_number(&risk.position_amt, "positionAmt")?;
    let entry_price = parse_number(&risk.entry_price, "entryPrice")?;
    let leverage = risk
        .leverage
        .parse::<u32>()
        .map_err(|_| ExchangeError::Fatal(format!("malformed leverage '{}'", risk.leverage)))?;
    let margin_mode = if risk.margin_type.eq_ignore_ascii_case("isolated") {
        MarginMode::Isolated
    } else {
        MarginMode::Cross
    };

    let side = if amount > 0.0 {
        PositionSide::Long
    } else if amount < 0.0 {
        PositionSide::Short
    } else {
        PositionSide::Flat
    };

    Ok(Position {
        symbol: risk.symbol,
        side,
        size: amount.abs(),
        entry_price,
        leverage,
        margin_mode,
    })
}

/// Render a quantity without float noise or trailing zeros
fn format_quantity(size: f64) -> String {
    let s = format!("{:.8}", size);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn test_client(server: &mockito::ServerGuard) -> BinanceClient {
        BinanceClient::with_http(
            Client::new(),
            server.url(),
            server.url(),
            Credentials {
                api_key: "test-key".to_string(),
                api_secret: "test-secret".to_string(),
            },
            RetryPolicy::bounded(Duration::from_millis(1), Duration::from_millis(5), 3),
            6_000,
        )
    }

    #[test]
    fn test_signature_matches_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(0.01), "0.01");
        assert_eq!(format_quantity(0.1 + 0.2), "0.3");
        assert_eq!(format_quantity(2.0), "2");
    }

    #[test]
    fn test_quote_asset_of() {
        assert_eq!(quote_asset_of("BTCUSDT"), "USDT");
        assert_eq!(quote_asset_of("ETHUSDC"), "USDC");
        assert_eq!(quote_asset_of("WEIRD"), "USDT");
    }

    #[test]
    fn test_error_classification() {
        let body = r#"{"code":-2019,"msg":"Margin is insufficient."}"#;
        assert_eq!(
            classify_error(StatusCode::BAD_REQUEST, body),
            ExchangeError::Rejected {
                code: -2019,
                message: "Margin is insufficient.".to_string()
            }
        );

        let auth = r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#;
        assert!(classify_error(StatusCode::UNAUTHORIZED, auth).is_fatal());
        assert!(classify_error(StatusCode::BAD_REQUEST, auth).is_fatal());

        assert!(classify_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_error(StatusCode::BAD_GATEWAY, "<html>").is_transient());

        let clock = r#"{"code":-1021,"msg":"Timestamp for this request is outside of the recvWindow."}"#;
        assert!(classify_error(StatusCode::BAD_REQUEST, clock).is_transient());

        assert!(classify_error(StatusCode::BAD_REQUEST, "not json").is_fatal());
    }

    #[tokio::test]
    async fn test_latest_closed_candle_parses_klines() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"[
            [1700000000000,"100.0","101.5","99.5","101.0","12.5",1700000059999,"0",10,"0","0","0"],
            [1700000060000,"101.0","102.0","100.5","101.8","8.25",1700000119999,"0",7,"0","0","0"]
        ]"#;
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("interval".into(), "1m".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let client = test_client(&server);
        let candle = client
            .latest_closed_candle("BTCUSDT", "1m".parse().unwrap())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(candle.open_time.timestamp_millis(), 1700000060000);
        assert_eq!(candle.close_time.timestamp_millis(), 1700000119999);
        assert_eq!(candle.close, 101.8);
        assert_eq!(candle.volume, 8.25);
    }

    #[tokio::test]
    async fn test_place_order_is_signed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fapi/v1/order")
            .match_header("X-MBX-APIKEY", "test-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("side".into(), "SELL".into()),
                Matcher::UrlEncoded("type".into(), "MARKET".into()),
                Matcher::UrlEncoded("quantity".into(), "0.015".into()),
                Matcher::UrlEncoded("newClientOrderId".into(), "pb-abc".into()),
                Matcher::UrlEncoded("reduceOnly".into(), "true".into()),
                Matcher::Regex("signature=[0-9a-f]{64}".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"clientOrderId":"pb-abc","status":"NEW","side":"SELL","origQty":"0.015","executedQty":"0","avgPrice":"0.00"}"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let request = OrderRequest {
            client_id: "pb-abc".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            size: 0.015,
            reduce_only: true,
        };
        let result = client.place_order(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result.status, OrderStatus::Pending);
        assert_eq!(result.avg_price, None);
        assert_eq!(result.size, 0.015);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fapi/v1/order")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-2019,"msg":"Margin is insufficient."}"#)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(&server);
        let request = OrderRequest::market("BTCUSDT", OrderSide::Buy, 1.0, false);
        let err = client.place_order(&request).await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, ExchangeError::Rejected { code: -2019, .. }));
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_bound() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/premiumIndex")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .expect(3)
            .create_async()
            .await;

        let client = test_client(&server);
        let err = client.mark_price("BTCUSDT").await.unwrap_err();

        mock.assert_async().await;
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_order_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let _filled = server
            .mock("GET", "/fapi/v1/order")
            .match_query(Matcher::UrlEncoded("origClientOrderId".into(), "filled".into()))
            .with_status(200)
            .with_body(
                r#"{"clientOrderId":"filled","status":"FILLED","side":"BUY","origQty":"0.010","executedQty":"0.010","avgPrice":"43000.5"}"#,
            )
            .create_async()
            .await;
        let _expired = server
            .mock("GET", "/fapi/v1/order")
            .match_query(Matcher::UrlEncoded("origClientOrderId".into(), "expired".into()))
            .with_status(200)
            .with_body(
                r#"{"clientOrderId":"expired","status":"EXPIRED","side":"BUY","origQty":"0.010","executedQty":"0.004","avgPrice":"43000.5"}"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);

        let filled = client.get_order_status("BTCUSDT", "filled").await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.filled_size, 0.010);
        assert_eq!(filled.avg_price, Some(43000.5));

        let expired = client.get_order_status("BTCUSDT", "expired").await.unwrap();
        assert_eq!(expired.status, OrderStatus::Canceled);
        assert_eq!(expired.filled_size, 0.004);
    }

    #[tokio::test]
    async fn test_get_position_reads_signed_amount() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fapi/v2/positionRisk")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"symbol":"BTCUSDT","positionAmt":"-0.020","entryPrice":"42000.0","leverage":"10","marginType":"isolated","positionSide":"BOTH","markPrice":"41000.0","unRealizedProfit":"20.0"}]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let position = client.get_position("BTCUSDT").await.unwrap();

        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.size, 0.020);
        assert_eq!(position.entry_price, 42000.0);
        assert_eq!(position.leverage, 10);
        assert_eq!(position.margin_mode, MarginMode::Isolated);
    }

    #[tokio::test]
    async fn test_margin_mode_already_set_is_ok() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/fapi/v1/marginType")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-4046,"msg":"No need to change margin type."}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        tokio_test::assert_ok!(client.set_margin_mode("BTCUSDT", MarginMode::Isolated).await);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fapi/v2/balance")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"code":-2015,"msg":"Invalid API-key, IP, or permissions for action."}"#)
            .expect(1)
            .create_async()
            .await;

        let client = test_client(&server);
        let err = client.account_equity().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_account_equity_uses_quote_asset() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fapi/v2/balance")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[{"asset":"BNB","balance":"1.5"},{"asset":"USDT","balance":"3000.25"}]"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        assert_eq!(client.account_equity().await.unwrap(), 3000.25);
    }

    #[tokio::test]
    async fn test_malformed_body_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/fapi/v1/premiumIndex")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("{not json")
            .create_async()
            .await;

        let client = test_client(&server);
        let err = client.mark_price("BTCUSDT").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_signed_request_without_credentials_is_fatal() {
        let server = mockito::Server::new_async().await;
        let client = BinanceClient::with_http(
            Client::new(),
            server.url(),
            server.url(),
            Credentials::default(),
            RetryPolicy::default(),
            60,
        );
        let err = client.account_equity().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
