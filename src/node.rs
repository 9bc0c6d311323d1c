use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Config;
use crate::template::BlockTemplateInfo;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// The slice of a `getmininginfo` response used for hashrate reporting.
#[derive(Debug, Clone, Deserialize)]
pub struct MiningInfo {
    pub blocks: u64,
    pub difficulty: f64,
    pub networkhashps: f64,
}

/// JSON-RPC client for the upstream node.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: reqwest::Client,
    url: String,
    user: String,
    pass: String,
}

impl NodeClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            url: cfg.node_url(),
            user: cfg.rpc_user.clone(),
            pass: cfg.rpc_pass.clone(),
        })
    }

    /// One POST round-trip; returns the full reply envelope.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": method,
            "params": params,
        });
        let reply = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json::<Value>()
            .await
            .with_context(|| format!("{method} returned malformed JSON"))?;
        Ok(reply)
    }

    /// Like `call`, but an `error` member or missing result is an error.
    async fn call_result(&self, method: &str, params: Value) -> Result<Value> {
        let reply = self.call(method, params).await?;
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            bail!("{method} error: {err}");
        }
        reply
            .get("result")
            .filter(|r| !r.is_null())
            .cloned()
            .ok_or_else(|| anyhow!("{method} returned no result"))
    }

    pub async fn get_block_template(&self) -> Result<BlockTemplateInfo> {
        let result = self.call_result("getblocktemplate", json!([])).await?;
        serde_json::from_value(result).context("unexpected getblocktemplate shape")
    }

    pub async fn get_mining_info(&self) -> Result<MiningInfo> {
        let result = self.call_result("getmininginfo", json!([])).await?;
        serde_json::from_value(result).context("unexpected getmininginfo shape")
    }

    /// Submits a block and hands back the raw reply; the caller interprets
    /// the verdict and keeps the miner connected either way.
    pub async fn submit_block(&self, block_hex: &str) -> Result<Value> {
        self.call("submitblock", json!([block_hex])).await
    }
}
