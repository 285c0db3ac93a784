//! Ergo node REST client
//!
//! Every call carries a bounded timeout. Errors keep the distinction the
//! payout path depends on: an HTTP error status means the node answered,
//! a timeout or transport failure means we do not know what happened.

use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};

use super::{MiningCandidate, NodeClient, NodeInfo, PaymentRequest, Solution, WalletClient};
use crate::error::{NodeError, SendError};
use crate::metrics::prometheus as metrics;

pub struct ErgoNodeClient {
    base_url: String,
    api_key: String,
    timeout: Duration,
    payment_timeout: Duration,
    client: Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    #[serde(default)]
    full_height: Option<u64>,
    #[serde(default)]
    headers_height: Option<u64>,
    #[serde(default)]
    difficulty: Option<serde_json::Number>,
    #[serde(default)]
    peers_count: Option<u32>,
}

#[derive(Deserialize)]
struct CandidateResponse {
    /// Kept as raw JSON: `b` routinely exceeds 2^64.
    b: Box<RawValue>,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    h: u64,
    #[serde(default)]
    pk: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmissionResponse {
    miner_reward: u64,
}

/// Full-precision network target from a raw `/mining/candidate` body.
/// Only the top-level `b` counts; it must be an unsigned JSON integer.
fn parse_candidate(text: &str) -> Result<(CandidateResponse, BigUint), NodeError> {
    let parsed: CandidateResponse =
        serde_json::from_str(text).map_err(|e| NodeError::Decode(format!("candidate: {e}")))?;
    let raw = parsed.b.get();
    if raw.is_empty() || !raw.bytes().all(|c| c.is_ascii_digit()) {
        return Err(NodeError::Decode(format!("candidate b is not an unsigned integer: {raw}")));
    }
    let b = raw
        .parse()
        .map_err(|e| NodeError::Decode(format!("candidate b: {e}")))?;
    Ok((parsed, b))
}

impl ErgoNodeClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration, payment_timeout: Duration) -> Self {
        tracing::info!(url = base_url, "Ergo node client initialized");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
            payment_timeout,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_key(&self, req: RequestBuilder) -> RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("api_key", &self.api_key)
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, NodeError> {
        metrics::inc_node_requests();
        let res = async {
            let resp = req.send().await.map_err(NodeError::from_reqwest)?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(NodeError::Http { status: status.as_u16(), body });
            }
            Ok(resp)
        }
        .await;
        if res.is_err() {
            metrics::inc_node_errors();
        }
        res
    }

    async fn get(&self, path: &str) -> Result<Response, NodeError> {
        let req = self.with_key(self.client.get(self.url(path)).timeout(self.timeout));
        self.send(req).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Response, NodeError> {
        let req = self.with_key(self.client.post(self.url(path)).timeout(self.timeout).json(body));
        self.send(req).await
    }
}

#[async_trait]
impl NodeClient for ErgoNodeClient {
    async fn info(&self) -> Result<NodeInfo, NodeError> {
        let info: InfoResponse = self
            .get("/info")
            .await?
            .json()
            .await
            .map_err(NodeError::from_reqwest)?;
        let difficulty = info
            .difficulty
            .and_then(|n| n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)))
            .unwrap_or(0);
        Ok(NodeInfo {
            full_height: info.full_height.unwrap_or(0),
            headers_height: info.headers_height.unwrap_or(0),
            difficulty,
            peers_count: info.peers_count.unwrap_or(0),
        })
    }

    async fn mining_candidate(&self) -> Result<MiningCandidate, NodeError> {
        let text = self
            .get("/mining/candidate")
            .await?
            .text()
            .await
            .map_err(NodeError::from_reqwest)?;
        let (parsed, network_target) = parse_candidate(&text)?;
        let height = u32::try_from(parsed.h)
            .map_err(|_| NodeError::Decode(format!("candidate height {} out of range", parsed.h)))?;
        MiningCandidate::new(&parsed.msg, height, network_target, &parsed.pk)
    }

    async fn submit_solution(&self, solution: &Solution) -> Result<(), NodeError> {
        let body = serde_json::to_value(solution).map_err(|e| NodeError::Decode(e.to_string()))?;
        tracing::info!(nonce = %solution.n, "Submitting solution to node");
        self.post_json("/mining/solution", &body).await?;
        Ok(())
    }

    async fn block_ids_at_height(&self, height: u64) -> Result<Vec<String>, NodeError> {
        self.get(&format!("/blocks/at/{height}"))
            .await?
            .json()
            .await
            .map_err(NodeError::from_reqwest)
    }

    async fn emission_reward(&self, height: u64) -> Result<u64, NodeError> {
        let e: EmissionResponse = self
            .get(&format!("/emission/at/{height}"))
            .await?
            .json()
            .await
            .map_err(NodeError::from_reqwest)?;
        Ok(e.miner_reward)
    }
}

#[async_trait]
impl WalletClient for ErgoNodeClient {
    async fn unlock(&self, pass: &str) -> Result<(), NodeError> {
        match self.post_json("/wallet/unlock", &json!({ "pass": pass })).await {
            Ok(_) => Ok(()),
            Err(NodeError::Http { body, .. }) if body.contains("already unlocked") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn lock(&self) -> Result<(), NodeError> {
        self.get("/wallet/lock").await?;
        Ok(())
    }

    async fn send_payment(&self, requests: &[PaymentRequest]) -> Result<String, SendError> {
        metrics::inc_node_requests();
        let req = self.with_key(
            self.client
                .post(self.url("/wallet/payment/send"))
                .timeout(self.payment_timeout)
                .json(requests),
        );

        let resp = req.send().await.map_err(|e| {
            metrics::inc_node_errors();
            SendError::Ambiguous(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SendError::Rejected { status: status.as_u16(), body });
        }

        // Accepted: a failure to read the body does not undo the transfer.
        let text = resp
            .text()
            .await
            .map_err(|e| SendError::Ambiguous(format!("accepted but body unreadable: {e}")))?;
        Ok(parse_tx_id(&text))
    }
}

/// The node answers with a bare JSON string, older versions with `{"id": ..}`.
fn parse_tx_id(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(o)) => o
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| text.trim().to_string()),
        _ => text.trim().trim_matches('"').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_b_keeps_full_precision() {
        let text = r#"{"msg":"ab","b" : 115792089237316195423570985008687907853269984665640564039457584007913129639935,"h":1200000}"#;
        let (parsed, b) = parse_candidate(text).unwrap();
        assert_eq!(b, (BigUint::from(1u8) << 256) - 1u8);
        assert_eq!(parsed.h, 1_200_000);
        assert_eq!(parsed.msg, "ab");
    }

    #[test]
    fn nested_b_does_not_shadow_the_candidate_target() {
        let text = r#"{"msg":"ab","proof":{"b":1},"h":7,"b":987654321987654321987654321,"pk":"02"}"#;
        let (parsed, b) = parse_candidate(text).unwrap();
        assert_eq!(b.to_string(), "987654321987654321987654321");
        assert_eq!(parsed.pk, "02");
    }

    #[test]
    fn candidate_b_must_be_an_unsigned_integer() {
        assert!(parse_candidate(r#"{"b":"12","h":1}"#).is_err());
        assert!(parse_candidate(r#"{"b":-5,"h":1}"#).is_err());
        assert!(parse_candidate(r#"{"b":1.5e3,"h":1}"#).is_err());
        assert!(parse_candidate(r#"{"h":12}"#).is_err());
    }

    #[test]
    fn tx_id_formats() {
        assert_eq!(parse_tx_id(r#""abc123""#), "abc123");
        assert_eq!(parse_tx_id(r#"{"id":"def"}"#), "def");
        assert_eq!(parse_tx_id("raw"), "raw");
    }
}
