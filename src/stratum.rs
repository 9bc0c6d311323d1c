use anyhow::{Context, Result};
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::address::Address;
use crate::config::Config;
use crate::node::NodeClient;
use crate::state::{SessionHandle, SharedState, SESSION_QUEUE_DEPTH};
use crate::template::{block_height_from_hex, TemplateState};

const MAX_LINE_LENGTH: usize = 65536;

/// `submitblock` replies that mean the block was valid but lost some race.
const NON_FATAL_VERDICTS: [&str; 4] = [
    "inconclusive",
    "duplicate",
    "duplicate-inconclusive",
    "inconclusive-not-best-prevblk",
];

/// One JSON object per line, both directions.
#[derive(Debug, Deserialize)]
struct StratumRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

pub fn set_target_line(target: &str) -> String {
    json!({"id": null, "method": "mining.set_target", "params": [target]}).to_string()
}

pub fn notify_line(tpl: &TemplateState) -> String {
    json!({
        "id": null,
        "method": "mining.notify",
        "params": [
            tpl.job_id(),
            tpl.header_hash,
            hex::encode(tpl.seed_hash.unwrap_or_default()),
            tpl.target,
            true,
            tpl.height,
            tpl.bits,
        ],
    })
    .to_string()
}

fn show_message_line(msg: &str) -> String {
    json!({"id": null, "method": "client.show_message", "params": [msg]}).to_string()
}

fn response_line(id: &Value, result: Value) -> String {
    json!({"id": id, "result": result, "error": null}).to_string()
}

fn error_line(id: &Value, code: i64, message: &str) -> String {
    json!({"id": id, "result": null, "error": [code, message, null]}).to_string()
}

/// Strips an optional `0x`, then flips the byte order. Miners hand nonce and
/// mix hash over in display order; the block wants them reversed.
fn reverse_hex(s: &str) -> Result<String> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let mut raw = hex::decode(stripped).context("bad hex from miner")?;
    raw.reverse();
    Ok(hex::encode(raw))
}

/// Accepts miner connections until the process ends.
pub async fn serve(state: SharedState, node: NodeClient, cfg: Config) -> Result<()> {
    let listener = TcpListener::bind((cfg.listen_addr.as_str(), cfg.listen_port))
        .await
        .with_context(|| format!("binding {}:{}", cfg.listen_addr, cfg.listen_port))?;
    info!("Serving on {}:{}", cfg.listen_addr, cfg.listen_port);
    if cfg.testnet {
        info!("Using testnet");
    }
    let mut next_session_id = 0u64;
    loop {
        let (socket, addr) = listener.accept().await.context("accept failed")?;
        next_session_id += 1;
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let session = Session {
            id: next_session_id,
            addr,
            state: state.clone(),
            node: node.clone(),
            cfg: cfg.clone(),
            tx,
            hashrate_id: None,
        };
        tokio::spawn(session.run(socket, rx));
    }
}

struct Session {
    id: u64,
    addr: SocketAddr,
    state: SharedState,
    node: NodeClient,
    cfg: Config,
    tx: mpsc::Sender<String>,
    /// The id this session last reported hashrate under, so the entry can
    /// be dropped on disconnect.
    hashrate_id: Option<String>,
}

impl Session {
    async fn run(mut self, socket: TcpStream, mut rx: mpsc::Receiver<String>) {
        info!("Connection with client {} established", self.addr);

        let (read_half, write_half) = socket.into_split();
        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(write_half);
            while let Some(line) = rx.recv().await {
                if out.write_all(line.as_bytes()).await.is_err()
                    || out.write_all(b"\n").await.is_err()
                    || out.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let mut lines = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => self.handle_line(&line).await,
                Err(e) => {
                    debug!("read error from {}: {}", self.addr, e);
                    break;
                }
            }
        }

        if self.cfg.verbose {
            info!("Connection with client {} closed", self.addr);
        }
        self.state
            .lock()
            .unwrap()
            .remove_session(self.id, self.hashrate_id.as_deref());
        writer.abort();
    }

    async fn handle_line(&mut self, line: &str) {
        // anything that does not parse as a request is dropped without a
        // reply, as is any unknown method; miners send all sorts of extras
        let Ok(request) = serde_json::from_str::<StratumRequest>(line) else {
            debug!("client {} sent an unparsable line", self.addr);
            return;
        };
        let id = request.id.unwrap_or(Value::Null);
        let reply = match request.method.as_str() {
            "mining.subscribe" => Some(self.handle_subscribe(&id)),
            "mining.authorize" => Some(self.handle_authorize(&id, &request.params)),
            "mining.submit" => Some(self.handle_submit(&id, &request.params).await),
            "eth_submitHashrate" => Some(self.handle_hashrate(&id, &request.params).await),
            _ => None,
        };
        if let Some(reply) = reply {
            self.send(reply).await;
        }
    }

    async fn send(&self, line: String) {
        // a closed queue means the writer is gone; the read loop ends next
        let _ = self.tx.send(line).await;
    }

    fn handle_subscribe(&self, id: &Value) -> String {
        let mut st = self.state.lock().unwrap();
        if !st.all_sessions.contains_key(&self.id) {
            st.new_sessions.insert(
                self.id,
                SessionHandle {
                    id: self.id,
                    tx: self.tx.clone(),
                },
            );
        }
        let extranonce = st.next_extranonce();
        drop(st);
        response_line(id, json!([Value::Null, extranonce]))
    }

    fn handle_authorize(&self, id: &Value, params: &[Value]) -> String {
        let username = params.first().and_then(Value::as_str).unwrap_or_default();
        match Address::from_worker(username, self.cfg.testnet) {
            Ok(addr) => {
                let mut st = self.state.lock().unwrap();
                if st.set_miner_h160(*addr.h160()) {
                    drop(st);
                    info!(
                        "Block rewards will pay to {}",
                        username.split('.').next().unwrap_or(username)
                    );
                }
                response_line(id, json!(true))
            }
            Err(e) => error_line(id, 20, &e.to_string()),
        }
    }

    async fn handle_submit(&self, id: &Value, params: &[Value]) -> String {
        let worker = params.first().and_then(Value::as_str).unwrap_or_default();
        let job_id = params.get(1).and_then(Value::as_str).unwrap_or_default();
        let nonce_hex = params.get(2).and_then(Value::as_str).unwrap_or_default();
        let header_hex = params.get(3).and_then(Value::as_str).unwrap_or_default();
        let mixhash_hex = params.get(4).and_then(Value::as_str).unwrap_or_default();

        if self.cfg.verbose {
            debug!(
                "Possible solution from worker {} for job {} header {}",
                worker, job_id, header_hex
            );
        }

        // old jobs are still worth propagating; the chain may not have moved
        let tpl: TemplateState = {
            let st = self.state.lock().unwrap();
            if job_id == st.template.job_id() {
                st.template.clone()
            } else if let Some(old) = st.history.lookup(job_id) {
                if self.cfg.verbose {
                    error!("An old job was submitted, using its saved state");
                }
                old.clone()
            } else {
                error!("Miner submitted unknown job {job_id}, trying the live state");
                st.template.clone()
            }
        };

        let (nonce, mixhash) = match (reverse_hex(nonce_hex), reverse_hex(mixhash_hex)) {
            (Ok(n), Ok(m)) => (n, m),
            _ => {
                warn!("worker {worker} submitted undecodable nonce or mix hash");
                return response_line(id, json!(true));
            }
        };

        let block_hex = tpl.build_block(&nonce, &mixhash);
        match self.node.submit_block(&block_hex).await {
            Ok(reply) => {
                write_submission_dump(&tpl, &reply);
                self.log_submit_verdict(&reply);
            }
            Err(e) => error!("submitblock request failed: {e:#}"),
        }

        let height = block_height_from_hex(&block_hex).unwrap_or_default();
        let msg = format!("Found block (may or may not be accepted by the chain): {height}");
        info!("{msg}");
        self.send(show_message_line(&msg)).await;

        // any acknowledged share keeps the miner working
        response_line(id, json!(true))
    }

    fn log_submit_verdict(&self, reply: &Value) {
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            error!(
                "submitblock RPC error ({}): {}",
                err.get("code").unwrap_or(&Value::Null),
                err.get("message").unwrap_or(&Value::Null)
            );
        }
        match reply.get("result").unwrap_or(&Value::Null) {
            Value::Null => {}
            Value::String(s) if NON_FATAL_VERDICTS.contains(&s.as_str()) => {
                if self.cfg.verbose {
                    error!("Block submission failed: {s}");
                }
            }
            other => error!("Block submission failed: {other}"),
        }
    }

    async fn handle_hashrate(&mut self, id: &Value, params: &[Value]) -> String {
        let rate_hex = params.first().and_then(Value::as_str).unwrap_or_default();
        let client_id = params
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let rate = u64::from_str_radix(rate_hex.strip_prefix("0x").unwrap_or(rate_hex), 16)
            .unwrap_or(0);

        let mining_info = match self.node.get_mining_info().await {
            Ok(info) => info,
            Err(e) => {
                error!("getmininginfo failed: {e:#}");
                return response_line(id, json!(true));
            }
        };
        debug!(
            "Node reports {} blocks at difficulty {}",
            mining_info.blocks, mining_info.difficulty
        );

        let rates: Vec<(String, u64)> = {
            let mut st = self.state.lock().unwrap();
            st.hashrates.insert(client_id.clone(), rate);
            st.hashrates.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        self.hashrate_id = Some(client_id);
        let total: u64 = rates.iter().map(|(_, r)| r).sum();

        info!("----------------------------");
        for (worker, rate) in &rates {
            info!(
                "Reported hashrate: {:.2}Mh/s for id {}",
                *rate as f64 / 1e6,
                worker
            );
        }
        info!("----------------------------");
        info!("Total reported hashrate: {:.2}Mh/s", total as f64 / 1e6);
        if self.cfg.testnet {
            info!(
                "Network hashrate: {:.2}Mh/s",
                mining_info.networkhashps / 1e6
            );
        } else {
            info!(
                "Network hashrate: {:.2}Th/s",
                mining_info.networkhashps / 1e12
            );
        }

        if total != 0 {
            let ttf = mining_info.difficulty * 2f64.powi(32) / total as f64;
            let msg = if self.cfg.testnet {
                format!("Estimated time to find: {} seconds", ttf.round() as u64)
            } else {
                format!("Estimated time to find: {:.2} days", ttf / 86400.0)
            };
            info!("{msg}");
            self.send(show_message_line(&msg)).await;
        } else {
            info!("Mining software has yet to send data");
        }

        response_line(id, json!(true))
    }
}

/// Best-effort record of the exchange for post-mortems; failures only warn.
fn write_submission_dump(tpl: &TemplateState, reply: &Value) {
    let path = format!("submit_history/{}_{}.txt", tpl.height, tpl.job_counter);
    let body = format!(
        "Response:\n{}\n\nState:\n{}",
        serde_json::to_string_pretty(reply).unwrap_or_else(|_| reply.to_string()),
        tpl
    );
    if let Err(e) = std::fs::write(&path, body) {
        warn!("could not write {path}: {e}");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reverse_hex() {
        assert_eq!(reverse_hex("0xdeadbeef").unwrap(), "efbeadde");
        assert_eq!(reverse_hex("deadbeef").unwrap(), "efbeadde");
        assert_eq!(
            reverse_hex("88a4fed34be156e1").unwrap(),
            "e156e14bd3fea488"
        );
        assert!(reverse_hex("0xnot-hex").is_err());
    }

    #[test]
    fn test_notify_line_shape() {
        let tpl = TemplateState {
            job_counter: 26,
            header_hash: "aa".repeat(32),
            seed_hash: Some([0x11; 32]),
            target: "bb".repeat(32),
            height: 7500,
            bits: "1a5ab50d".to_string(),
            ..TemplateState::default()
        };
        let line = notify_line(&tpl);
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["method"], "mining.notify");
        assert_eq!(parsed["id"], Value::Null);
        let params = parsed["params"].as_array().unwrap();
        assert_eq!(params.len(), 7);
        assert_eq!(params[0], "1a");
        assert_eq!(params[1], "aa".repeat(32));
        assert_eq!(params[2], "11".repeat(32));
        assert_eq!(params[3], "bb".repeat(32));
        assert_eq!(params[4], true);
        assert_eq!(params[5], 7500);
        assert_eq!(params[6], "1a5ab50d");
    }

    #[test]
    fn test_set_target_line_shape() {
        let line = set_target_line("00ff");
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["method"], "mining.set_target");
        assert_eq!(parsed["params"], json!(["00ff"]));
        assert_eq!(parsed["id"], Value::Null);
    }

    #[test]
    fn test_response_and_error_lines() {
        let ok: Value =
            serde_json::from_str(&response_line(&json!(7), json!([Value::Null, "0001"])))
                .unwrap();
        assert_eq!(ok["id"], 7);
        assert_eq!(ok["result"], json!([Value::Null, "0001"]));
        assert_eq!(ok["error"], Value::Null);

        let err: Value = serde_json::from_str(&error_line(
            &json!(8),
            20,
            "Invalid address M9N7VavuhG3bRFxPVMLPTMEvUvKCEobVUh",
        ))
        .unwrap();
        assert_eq!(err["id"], 8);
        assert_eq!(err["result"], Value::Null);
        assert_eq!(err["error"][0], 20);
        assert_eq!(
            err["error"][1],
            "Invalid address M9N7VavuhG3bRFxPVMLPTMEvUvKCEobVUh"
        );
    }

    #[test]
    fn test_unknown_method_is_dropped() {
        let request: StratumRequest =
            serde_json::from_str(r#"{"id": 1, "method": "mining.extranonce.subscribe", "params": []}"#)
                .unwrap();
        assert_eq!(request.method, "mining.extranonce.subscribe");
        // requests with no id or params still parse; they are notifications
        let request: StratumRequest =
            serde_json::from_str(r#"{"method": "mining.ping"}"#).unwrap();
        assert!(request.id.is_none());
        assert!(request.params.is_empty());
    }
}
