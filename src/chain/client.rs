use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::template::{BlockTemplateResponse, WorkTemplate};
use super::{BlockHash, NodeRpc, RpcError, SubmitOutcome};
use crate::miner::Candidate;
use async_trait::async_trait;

const REQUEST_ID: &str = "veco-miner";

/// Connection settings for the node's JSON-RPC endpoint
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Use https instead of http
    pub tls: bool,
    /// Per-request timeout
    pub timeout: Duration,
    /// Address that receives the block reward
    pub address: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 26920,
            username: String::new(),
            password: String::new(),
            tls: false,
            timeout: Duration::from_secs(30),
            address: String::new(),
        }
    }
}

impl ClientConfig {
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<NodeErrorObject>,
}

#[derive(Debug, Deserialize)]
struct NodeErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ValidateAddressResponse {
    #[serde(rename = "isvalid")]
    is_valid: bool,
    #[serde(rename = "scriptPubKey", default)]
    script_pub_key: Option<String>,
}

/// JSON-RPC gateway to a full node over HTTP(S) with basic auth.
pub struct JsonRpcClient {
    config: ClientConfig,
    url: String,
    http: Client,
    reward_script: OnceCell<Vec<u8>>,
}

impl JsonRpcClient {
    pub fn new(config: ClientConfig) -> Result<Self, RpcError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RpcError::Network(e.to_string()))?;

        Ok(Self {
            url: config.url(),
            config,
            http,
            reward_script: OnceCell::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": REQUEST_ID,
            "method": method,
            "params": params,
        });

        debug!("RPC {} -> {}", method, self.url);
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;
        let result = decode_envelope(status, &text)?;

        serde_json::from_value(result).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }

    /// The reward output script, resolved once through `validateaddress`.
    pub async fn reward_script(&self) -> Result<&[u8], RpcError> {
        let script = self
            .reward_script
            .get_or_try_init(|| async {
                let response: ValidateAddressResponse = self
                    .call("validateaddress", json!([self.config.address]))
                    .await?;
                let script = parse_reward_script(&self.config.address, response)?;
                info!(
                    "Reward address {} resolved to script {}",
                    self.config.address,
                    hex::encode(&script)
                );
                Ok::<_, RpcError>(script)
            })
            .await?;
        Ok(script.as_slice())
    }
}

#[async_trait]
impl NodeRpc for JsonRpcClient {
    async fn get_template(&self) -> Result<WorkTemplate, RpcError> {
        let reward_script = self.reward_script().await?;
        let response: BlockTemplateResponse = self
            .call("getblocktemplate", json!([{ "rules": ["segwit"] }]))
            .await?;
        Ok(WorkTemplate::from_response(&response, reward_script)?)
    }

    async fn get_tip_hash(&self) -> Result<BlockHash, RpcError> {
        let hash: String = self.call("getbestblockhash", json!([])).await?;
        Ok(hash.parse()?)
    }

    async fn submit_block(
        &self,
        template: &WorkTemplate,
        candidate: &Candidate,
    ) -> Result<SubmitOutcome, RpcError> {
        let block = template.serialize_block(candidate.extra_nonce, candidate.nonce);
        let result: Value = self.call("submitblock", json!([hex::encode(block)])).await?;
        parse_submit_result(result)
    }
}

fn transport_error(err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout
    } else {
        RpcError::Network(err.to_string())
    }
}

/// Unwrap a JSON-RPC response body into its `result`.
fn decode_envelope(status: u16, body: &str) -> Result<Value, RpcError> {
    if status == 401 || status == 403 {
        return Err(RpcError::Auth { status });
    }

    // The node reports RPC errors with non-2xx statuses and a JSON body
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if !(200..300).contains(&status) => {
            return Err(RpcError::Network(format!("HTTP {status}")));
        }
        Err(e) => return Err(RpcError::Decode(e.to_string())),
    };

    match envelope.error {
        Some(err) => Err(RpcError::Node {
            code: err.code,
            message: err.message,
        }),
        None => Ok(envelope.result),
    }
}

fn parse_reward_script(address: &str, response: ValidateAddressResponse) -> Result<Vec<u8>, RpcError> {
    if !response.is_valid {
        return Err(RpcError::InvalidAddress(address.to_string()));
    }
    let script = response
        .script_pub_key
        .ok_or_else(|| RpcError::Decode("validateaddress: missing scriptPubKey".to_string()))?;
    hex::decode(&script).map_err(|e| RpcError::Decode(format!("validateaddress: {e}")))
}

fn parse_submit_result(result: Value) -> Result<SubmitOutcome, RpcError> {
    match result {
        Value::Null => Ok(SubmitOutcome::Accepted),
        Value::String(reason) => Ok(SubmitOutcome::Rejected(reason)),
        other => Err(RpcError::Decode(format!("submitblock: unexpected result {other}"))),
    }
}
