use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::history::JobHistory;
use crate::template::TemplateState;

/// Outbound line queue depth per session. A stalled miner loses its newest
/// notifications rather than stalling the refresher.
pub const SESSION_QUEUE_DEPTH: usize = 64;

pub type SharedState = Arc<Mutex<ProxyState>>;

/// Registry entry for a connected miner: its id and outbound line queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub tx: mpsc::Sender<String>,
}

/// Everything the refresher and the session handlers share. One instance
/// behind one mutex; never held across an await.
#[derive(Debug, Default)]
pub struct ProxyState {
    pub template: TemplateState,
    pub history: JobHistory,
    pub miner_h160: Option<[u8; 20]>,
    pub new_sessions: HashMap<u64, SessionHandle>,
    pub all_sessions: HashMap<u64, SessionHandle>,
    pub hashrates: HashMap<String, u64>,
    pub bits_counter: u32,
}

impl ProxyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first address to authorize collects every block this process
    /// finds; later authorizations are accepted but change nothing.
    pub fn set_miner_h160(&mut self, h160: [u8; 20]) -> bool {
        if self.miner_h160.is_none() {
            self.miner_h160 = Some(h160);
            true
        } else {
            false
        }
    }

    /// Two big-endian bytes of a per-subscribe counter. Sessions are never
    /// resumed, so every subscriber gets a nonce space of its own.
    pub fn next_extranonce(&mut self) -> String {
        self.bits_counter = self.bits_counter.wrapping_add(1);
        hex::encode((self.bits_counter as u16).to_be_bytes())
    }

    /// Drops a disconnected session from both registries and forgets the
    /// hashrate it last reported.
    pub fn remove_session(&mut self, id: u64, hashrate_id: Option<&str>) {
        self.new_sessions.remove(&id);
        self.all_sessions.remove(&id);
        if let Some(key) = hashrate_id {
            self.hashrates.remove(key);
        }
    }
}
