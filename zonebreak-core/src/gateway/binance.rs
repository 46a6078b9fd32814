//! Signed Binance USDⓈ-M futures REST client.
//!
//! Requests carry `timestamp` and `recvWindow`, are form-encoded with
//! `serde_urlencoded`, and signed with HMAC-SHA256 over the query string.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::blocking::Client;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info};

use super::{ExchangePosition, ExecutionGateway, GatewayError, OrderAck, OrderKind, OrderRequest};
use crate::risk::round_to_step;
use crate::sync::lock;

type HmacSha256 = Hmac<Sha256>;

pub const LIVE_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// "No need to change margin type."
const CODE_MARGIN_UNCHANGED: i64 = -4046;

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    symbol: String,
    executed_qty: String,
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<Value>,
}

pub struct BinanceFuturesGateway {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    /// Lazily loaded `LOT_SIZE` steps from `/fapi/v1/exchangeInfo`.
    steps: Mutex<Option<HashMap<String, f64>>>,
}

impl BinanceFuturesGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            recv_window_ms: 5_000,
            steps: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn sign(&self, mut params: Vec<(String, String)>, timestamp_ms: i64) -> Result<String, GatewayError> {
        params.push(("timestamp".into(), timestamp_ms.to_string()));
        if self.recv_window_ms > 0 {
            params.push(("recvWindow".into(), self.recv_window_ms.to_string()));
        }
        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| GatewayError::Decode(format!("encode params: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| GatewayError::Auth(format!("failed to init signer: {e}")))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{query}&signature={signature}"))
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
    ) -> Result<Value, GatewayError> {
        let query = if signed {
            self.sign(params, chrono::Utc::now().timestamp_millis())?
        } else {
            serde_urlencoded::to_string(&params)
                .map_err(|e| GatewayError::Decode(format!("encode params: {e}")))?
        };
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };
        debug!(%method, path, "binance request");

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(e.to_string())
                } else {
                    GatewayError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status == reqwest::StatusCode::IM_A_TEAPOT {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1_000)
                .unwrap_or(1_000);
            return Err(GatewayError::RateLimited { retry_after_ms });
        }
        let body = resp.text().map_err(|e| GatewayError::Transport(e.to_string()))?;
        if status.is_server_error() {
            return Err(GatewayError::Transport(format!("HTTP {status}: {body}")));
        }
        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::Decode(format!("{path}: {e}")))
    }

    fn load_steps(&self) -> Result<HashMap<String, f64>, GatewayError> {
        let info: ExchangeInfo = decode(self.send(Method::GET, "/fapi/v1/exchangeInfo", Vec::new(), false)?)?;
        Ok(info
            .symbols
            .into_iter()
            .filter_map(|s| lot_step(&s.filters).map(|step| (s.symbol, step)))
            .collect())
    }
}

fn decode<T: serde::de::DeserializeOwned>(v: Value) -> Result<T, GatewayError> {
    serde_json::from_value(v).map_err(|e| GatewayError::Decode(e.to_string()))
}

fn num(s: &str, field: &str) -> Result<f64, GatewayError> {
    s.parse::<f64>()
        .map_err(|_| GatewayError::Decode(format!("{field}: '{s}' is not a number")))
}

/// Map a 4xx body to a typed error.
fn classify_error(status: u16, body: &str) -> GatewayError {
    let parsed: Option<ApiError> = serde_json::from_str(body).ok();
    match (status, parsed) {
        (401, _) => GatewayError::Auth(body.to_string()),
        (_, Some(e)) if matches!(e.code, -2014 | -2015 | -1022) => GatewayError::Auth(e.msg),
        (_, Some(e)) => GatewayError::Rejected { code: e.code, msg: e.msg },
        (403, None) => GatewayError::Auth(body.to_string()),
        (_, None) => GatewayError::Rejected {
            code: i64::from(status),
            msg: body.to_string(),
        },
    }
}

/// `stepSize` from the `LOT_SIZE` filter.
fn lot_step(filters: &[Value]) -> Option<f64> {
    filters
        .iter()
        .find(|f| f.get("filterType").and_then(Value::as_str) == Some("LOT_SIZE"))
        .and_then(|f| f.get("stepSize"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| *s > 0.0)
}

/// Decimal string for `qty`, trimmed of float noise.
pub fn format_qty(qty: f64) -> String {
    let s = format!("{qty:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

fn order_params(req: &OrderRequest) -> Vec<(String, String)> {
    let mut params = vec![
        ("symbol".to_string(), req.symbol.clone()),
        ("side".to_string(), req.side.order_side().to_string()),
        ("type".to_string(), req.kind.to_string()),
        ("quantity".to_string(), format_qty(req.qty)),
        ("newOrderRespType".to_string(), "RESULT".to_string()),
    ];
    match req.kind {
        OrderKind::Market => {}
        OrderKind::Limit(price) => {
            params.push(("price".to_string(), format_qty(price)));
            params.push(("timeInForce".to_string(), "GTC".to_string()));
        }
        OrderKind::StopMarket(stop) => {
            params.push(("stopPrice".to_string(), format_qty(stop)));
            params.push(("workingType".to_string(), "MARK_PRICE".to_string()));
        }
    }
    if req.reduce_only {
        params.push(("reduceOnly".to_string(), "true".to_string()));
    }
    params
}

impl ExecutionGateway for BinanceFuturesGateway {
    fn name(&self) -> &str {
        "binance_futures"
    }

    fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError> {
        let resp: OrderResponse = decode(self.send(Method::POST, "/fapi/v1/order", order_params(req), true)?)?;
        let avg_price = resp
            .avg_price
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| *p > 0.0);
        info!(symbol = %req.symbol, side = %req.side, qty = req.qty, order_id = resp.order_id, "order placed");
        Ok(OrderAck {
            order_id: resp.order_id.to_string(),
            symbol: resp.symbol,
            executed_qty: num(&resp.executed_qty, "executedQty")?,
            avg_price,
        })
    }

    fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.send(Method::DELETE, "/fapi/v1/order", params, true)?;
        info!(symbol, order_id, "order cancelled");
        Ok(())
    }

    fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("leverage".to_string(), leverage.to_string()),
        ];
        self.send(Method::POST, "/fapi/v1/leverage", params, true)?;
        Ok(())
    }

    fn set_isolated_margin(&self, symbol: &str) -> Result<(), GatewayError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("marginType".to_string(), "ISOLATED".to_string()),
        ];
        match self.send(Method::POST, "/fapi/v1/marginType", params, true) {
            Ok(_) => Ok(()),
            Err(GatewayError::Rejected { code, .. }) if code == CODE_MARGIN_UNCHANGED => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        let rows: Vec<PositionRisk> = decode(self.send(Method::GET, "/fapi/v2/positionRisk", Vec::new(), true)?)?;
        let mut out = Vec::new();
        for row in rows {
            let qty = num(&row.position_amt, "positionAmt")?;
            if qty.abs() <= f64::EPSILON {
                continue;
            }
            out.push(ExchangePosition {
                symbol: row.symbol,
                qty,
                entry_price: num(&row.entry_price, "entryPrice")?,
            });
        }
        Ok(out)
    }

    fn close_position(&self, symbol: &str) -> Result<Option<OrderAck>, GatewayError> {
        let Some(held) = self
            .get_open_positions()?
            .into_iter()
            .find(|p| p.symbol == symbol)
        else {
            return Ok(None);
        };
        let req = OrderRequest::flatten(symbol, held.side(), held.qty.abs());
        self.place_order(&req).map(Some)
    }

    fn available_balance(&self) -> Result<f64, GatewayError> {
        let account: AccountInfo = decode(self.send(Method::GET, "/fapi/v2/account", Vec::new(), true)?)?;
        num(&account.available_balance, "availableBalance")
    }

    fn quantity_step(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        let mut steps = lock(&self.steps);
        if steps.is_none() {
            *steps = Some(self.load_steps()?);
        }
        Ok(steps.as_ref().and_then(|m| m.get(symbol).copied()))
    }
}

/// Round `qty` to the venue step for `symbol`, if the gateway knows one.
pub fn conform_qty(gateway: &dyn ExecutionGateway, symbol: &str, qty: f64) -> Result<f64, GatewayError> {
    Ok(match gateway.quantity_step(symbol)? {
        Some(step) => round_to_step(qty, step),
        None => qty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use serde_json::json;

    fn gateway() -> BinanceFuturesGateway {
        BinanceFuturesGateway::new(TESTNET_URL, "key", "secret").unwrap()
    }

    #[test]
    fn signature_is_hmac_of_query() {
        let gw = gateway();
        let signed = gw
            .sign(vec![("symbol".into(), "BTCUSDT".into())], 1_700_000_000_000)
            .unwrap();
        let (query, sig) = signed.split_once("&signature=").unwrap();
        assert_eq!(query, "symbol=BTCUSDT&timestamp=1700000000000&recvWindow=5000");
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(query.as_bytes());
        assert_eq!(sig, hex::encode(mac.finalize().into_bytes()));
        assert_eq!(sig.len(), 64);
    }

    #[test]
    fn errors_are_classified() {
        assert!(matches!(
            classify_error(400, r#"{"code":-2019,"msg":"Margin is insufficient."}"#),
            GatewayError::Rejected { code: -2019, .. }
        ));
        assert!(matches!(
            classify_error(401, r#"{"code":-2015,"msg":"Invalid API-key"}"#),
            GatewayError::Auth(_)
        ));
        assert!(matches!(classify_error(400, "garbage"), GatewayError::Rejected { code: 400, .. }));
    }

    #[test]
    fn lot_step_from_filters() {
        let filters = vec![
            json!({"filterType": "PRICE_FILTER", "tickSize": "0.10"}),
            json!({"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}),
        ];
        assert_eq!(lot_step(&filters), Some(0.001));
        assert_eq!(lot_step(&[]), None);
    }

    #[test]
    fn order_params_for_exit() {
        let params = order_params(&OrderRequest::flatten("ETHUSDT", Side::Long, 1.25));
        let get = |k: &str| params.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("side"), Some("SELL"));
        assert_eq!(get("type"), Some("MARKET"));
        assert_eq!(get("quantity"), Some("1.25"));
        assert_eq!(get("reduceOnly"), Some("true"));
        assert_eq!(get("price"), None);
    }

    #[test]
    fn order_params_for_stop_loss() {
        let params = order_params(&OrderRequest::stop_loss("BTCUSDT", Side::Short, 0.01, 64_250.5));
        let get = |k: &str| params.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("side"), Some("BUY"));
        assert_eq!(get("type"), Some("STOP_MARKET"));
        assert_eq!(get("stopPrice"), Some("64250.5"));
        assert_eq!(get("workingType"), Some("MARK_PRICE"));
        assert_eq!(get("reduceOnly"), Some("true"));
        assert_eq!(get("timeInForce"), None);
    }

    #[test]
    fn qty_formatting() {
        assert_eq!(format_qty(0.1 + 0.2), "0.3");
        assert_eq!(format_qty(5.0), "5");
        assert_eq!(format_qty(0.0), "0");
    }
}
