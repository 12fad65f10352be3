use crate::config::{ExchangeSettings, Timeframe};
use crate::exchange::Exchange;
use crate::models::{Balance, Candle, Order, OrderRequest, OrderSide, OrderStatus, OrderType};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

const KLINES_PAGE_LIMIT: usize = 1000;
const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Binance spot REST client.
///
/// Public market data needs no credentials; account and order endpoints are signed with
/// HMAC-SHA256 over the query string.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
}

impl BinanceClient {
    pub fn new(settings: &ExchangeSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(key), Some(secret)) => Ok((key, secret)),
            _ => Err(anyhow!(
                "BINANCE_API_KEY and BINANCE_API_SECRET are required for signed endpoints"
            )),
        }
    }

    async fn fetch_klines_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Vec<Value>>> {
        let query = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), timeframe.as_str().to_string()),
            ("startTime".to_string(), start_ms.to_string()),
            ("endTime".to_string(), end_ms.to_string()),
            ("limit".to_string(), KLINES_PAGE_LIMIT.to_string()),
        ];
        self.send(Method::GET, "/api/v3/klines", &encode_query(&query), None)
            .await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<T> {
        let (api_key, api_secret) = self.credentials()?;
        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        params.push((
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        ));
        let query = encode_query(&params);
        let signature = sign(api_secret, &query)?;
        let signed_query = format!("{}&signature={}", query, signature);

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            HeaderValue::from_str(api_key).context("invalid Binance API key")?,
        );
        self.send(method, path, &signed_query, Some(headers)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &str,
        headers: Option<HeaderMap>,
    ) -> Result<T> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(headers) = headers {
            request = request.headers(headers);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, path))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read {} {} response", method, path))?;
        if !status.is_success() {
            let snippet: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(anyhow!("{} {} returned {}: {}", method, path, status, snippet));
        }
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse {} {} response", method, path))
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let end_ms = to.timestamp_millis();
        let mut start_ms = from.timestamp_millis();
        let mut candles = Vec::new();

        while start_ms <= end_ms {
            let rows = self
                .fetch_klines_page(symbol, timeframe, start_ms, end_ms)
                .await
                .with_context(|| format!("failed to fetch {} {} klines", symbol, timeframe))?;
            let page_len = rows.len();
            for row in &rows {
                candles.push(parse_kline(row)?);
            }
            let Some(last) = candles.last() else {
                break;
            };
            if page_len < KLINES_PAGE_LIMIT {
                break;
            }
            start_ms = last.timestamp.timestamp_millis() + 1;
        }

        log::debug!(
            "Fetched {} {} {} candles from Binance",
            candles.len(),
            symbol,
            timeframe
        );
        Ok(candles)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        let mut params = vec![
            ("symbol".to_string(), request.symbol.clone()),
            ("side".to_string(), request.side.as_str().to_string()),
            ("type".to_string(), request.order_type.as_str().to_string()),
            ("quantity".to_string(), format_decimal(request.quantity)),
        ];
        if request.order_type == OrderType::Limit {
            let price = request
                .price
                .ok_or_else(|| anyhow!("limit order for {} requires a price", request.symbol))?;
            params.push(("timeInForce".to_string(), "GTC".to_string()));
            params.push(("price".to_string(), format_decimal(price)));
        }
        if request.stop_loss.is_some() || request.take_profit.is_some() {
            log::info!(
                "{} {} protective levels (stop {:?}, target {:?}) are not attached on Binance spot",
                request.side,
                request.symbol,
                request.stop_loss,
                request.take_profit
            );
        }

        let response: BinanceOrder = self
            .signed(Method::POST, "/api/v3/order", params)
            .await
            .with_context(|| format!("failed to place {} order for {}", request.side, request.symbol))?;
        response.into_order()
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<Order> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let response: BinanceOrder = self.signed(Method::GET, "/api/v3/order", params).await?;
        response.into_order()
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<Order> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let response: BinanceOrder = self.signed(Method::DELETE, "/api/v3/order", params).await?;
        response.into_order()
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance> {
        let account: BinanceAccount = self
            .signed(Method::GET, "/api/v3/account", Vec::new())
            .await
            .context("failed to fetch Binance account")?;
        let balance = account
            .balances
            .into_iter()
            .find(|entry| entry.asset.eq_ignore_ascii_case(asset));
        Ok(match balance {
            Some(entry) => Balance {
                asset: entry.asset,
                free: entry.free.unwrap_or(0.0),
                locked: entry.locked.unwrap_or(0.0),
            },
            None => Balance {
                asset: asset.to_uppercase(),
                free: 0.0,
                locked: 0.0,
            },
        })
    }
}

pub fn sign(secret: &str, payload: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| anyhow!("invalid Binance API secret: {}", err))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn encode_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn format_decimal(value: f64) -> String {
    let formatted = format!("{:.8}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Kline rows are `[openTime, open, high, low, close, volume, closeTime, quoteVolume, trades, ...]`.
fn parse_kline(row: &[Value]) -> Result<Candle> {
    let field = |index: usize, name: &str| -> Result<f64> {
        row.get(index)
            .and_then(value_as_f64)
            .ok_or_else(|| anyhow!("kline row is missing {} (row: {:?})", name, row))
    };
    let open_time = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("kline row is missing open time (row: {:?})", row))?;
    let timestamp = Utc
        .timestamp_millis_opt(open_time)
        .single()
        .ok_or_else(|| anyhow!("kline open time {} is out of range", open_time))?;
    let trade_count = row.get(8).and_then(Value::as_u64).unwrap_or(0);

    Ok(Candle::new(
        timestamp,
        field(1, "open")?,
        field(2, "high")?,
        field(3, "low")?,
        field(4, "close")?,
        field(5, "volume")?,
        trade_count,
    ))
}

#[derive(Debug, Deserialize)]
struct BinanceAccount {
    #[serde(default)]
    balances: Vec<BinanceBalance>,
}

#[derive(Debug, Deserialize)]
struct BinanceBalance {
    asset: String,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    free: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    locked: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrder {
    symbol: String,
    order_id: i64,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    orig_qty: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    executed_qty: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    cummulative_quote_qty: Option<f64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "type", default)]
    order_type: Option<String>,
    side: String,
    #[serde(default)]
    transact_time: Option<i64>,
    #[serde(default)]
    time: Option<i64>,
}

impl BinanceOrder {
    /// Average fill price for executed orders, else the quoted limit price.
    fn effective_price(&self) -> Option<f64> {
        match (self.cummulative_quote_qty, self.executed_qty) {
            (Some(quote), Some(qty)) if qty > 0.0 && quote > 0.0 => Some(quote / qty),
            _ => self.price.filter(|price| *price > 0.0),
        }
    }

    fn into_order(self) -> Result<Order> {
        let side = match self.side.to_ascii_uppercase().as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => return Err(anyhow!("unexpected order side {}", other)),
        };
        let order_type = match self.order_type.as_deref() {
            Some(raw) if raw.eq_ignore_ascii_case("LIMIT") => OrderType::Limit,
            _ => OrderType::Market,
        };
        let created_ms = self.transact_time.or(self.time);
        let created_at = created_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(Order {
            id: self.order_id.to_string(),
            price: self.effective_price(),
            symbol: self.symbol,
            side,
            order_type,
            quantity: self.orig_qty.unwrap_or(0.0),
            status: self
                .status
                .as_deref()
                .map(OrderStatus::parse)
                .unwrap_or(OrderStatus::New),
            created_at,
        })
    }
}

fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or numeric string")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
            Ok(Some(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            Ok(Some(value as f64))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Some(value as f64))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            Ok(value.trim().parse::<f64>().ok())
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}
