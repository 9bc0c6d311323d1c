use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;

use crate::address::{community_script, p2pkh_script};
use crate::merkle::merkle_from_txids;
use crate::op_data::{var_int, OpData};
use crate::script::{coinbase_script, COINBASE_TAG};

pub const KAWPOW_EPOCH_LENGTH: i64 = 7500;

/// Seconds without a rebuild before the current job is considered stale.
const MAX_JOB_AGE_SECS: u64 = 60;

pub fn dsha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::default();
    hasher.update(data);
    hasher.finalize().into()
}

/// Transaction entry of a `getblocktemplate` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    pub txid: String,
}

/// The slice of a `getblocktemplate` response the proxy consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplateInfo {
    pub version: u32,
    pub previousblockhash: String,
    pub transactions: Vec<TemplateTransaction>,
    pub coinbasevalue: u64,
    pub target: String,
    pub bits: String,
    pub height: u32,
    pub default_witness_commitment: String,
    #[serde(rename = "CommunityAutonomousAddress")]
    pub community_autonomous_address: String,
    #[serde(rename = "CommunityAutonomousValue")]
    pub community_autonomous_value: u64,
}

/// The block under construction plus the Stratum job derived from it.
/// Cloned wholesale into the job history before every rebuild.
#[derive(Debug, Clone)]
pub struct TemplateState {
    pub height: i64,
    pub timestamp: u64,
    pub version: u32,
    pub bits: String,
    pub target: String,
    pub prev_hash: [u8; 32],
    pub seed_hash: Option<[u8; 32]>,
    pub current_commitment: String,
    pub coinbase_tx: Vec<u8>,
    pub coinbase_txid: [u8; 32],
    pub external_txs: Vec<String>,
    pub header: Vec<u8>,
    pub header_hash: String,
    pub job_counter: u64,
}

impl Default for TemplateState {
    fn default() -> Self {
        Self {
            height: -1,
            timestamp: 0,
            version: 0,
            bits: String::new(),
            target: String::new(),
            prev_hash: [0; 32],
            seed_hash: None,
            current_commitment: String::new(),
            coinbase_tx: Vec::new(),
            coinbase_txid: [0; 32],
            external_txs: Vec::new(),
            header: Vec::new(),
            header_hash: String::new(),
            job_counter: 0,
        }
    }
}

impl TemplateState {
    /// The job id broadcast to miners: bare lower-case hex of the counter.
    pub fn job_id(&self) -> String {
        format!("{:x}", self.job_counter)
    }

    pub fn is_new_block(&self, info: &BlockTemplateInfo) -> bool {
        self.height == -1 || self.height != i64::from(info.height)
    }

    pub fn has_new_transactions(&self, info: &BlockTemplateInfo) -> bool {
        self.current_commitment != info.default_witness_commitment
    }

    pub fn is_stale(&self, now: u64) -> bool {
        self.timestamp + MAX_JOB_AGE_SECS < now
    }

    /// Fields mirrored from the node on every poll, rebuild or not.
    pub fn apply_wire_fields(&mut self, info: &BlockTemplateInfo) -> Result<()> {
        self.target = info.target.clone();
        self.bits = info.bits.clone();
        self.version = info.version;
        let mut prev = hex::decode(&info.previousblockhash).context("bad previousblockhash")?;
        prev.reverse();
        self.prev_hash = prev
            .try_into()
            .map_err(|_| anyhow!("previousblockhash is not 32 bytes"))?;
        self.current_commitment = info.default_witness_commitment.clone();
        Ok(())
    }

    /// Seed for a height reached with no prior epoch context: Keccak-256
    /// iterated once per completed epoch over the zero block.
    pub fn seed_for_height(height: i64) -> [u8; 32] {
        let mut seed = [0u8; 32];
        for _ in 0..height / KAWPOW_EPOCH_LENGTH {
            seed = keccak256(&seed);
        }
        seed
    }

    /// Epoch rules, applied while `self.height` still holds the old height
    /// and `new_height` is the height about to replace it.
    pub fn update_seed_hash(&mut self, new_height: i64) {
        match self.seed_hash {
            None => {
                self.seed_hash = Some(Self::seed_for_height(new_height));
            }
            Some(seed) if self.height == -1 || new_height > self.height => {
                if self.height % KAWPOW_EPOCH_LENGTH == 0 {
                    self.seed_hash = Some(keccak256(&seed));
                }
            }
            Some(_) if new_height < self.height => {
                // a reorg deeper than our position in the epoch crossed a
                // boundary; rewind from scratch
                if self.height % KAWPOW_EPOCH_LENGTH - (self.height - new_height) < 0 {
                    self.seed_hash = Some(Self::seed_for_height(new_height));
                }
            }
            Some(_) => {}
        }
    }

    /// Rebuilds coinbase, merkle root and header for the template in `info`,
    /// advancing the job counter. `prev_hash` must already be current.
    pub fn rebuild(
        &mut self,
        info: &BlockTemplateInfo,
        miner_h160: &[u8; 20],
        ts: u64,
    ) -> Result<()> {
        let script = coinbase_script(info.height, COINBASE_TAG);
        let coinbase_txin = coinbase_txin(&script);
        let vout_to_miner = p2pkh_script(miner_h160);
        let vout_to_community = community_script(&info.community_autonomous_address)?;
        let witness_vout = hex::decode(&info.default_witness_commitment)
            .context("bad default_witness_commitment")?;

        let outputs = OpData::default()
            .push_u8(0x03)
            .push_u64(info.coinbasevalue)
            .op_push_slice(&vout_to_miner)
            .push_u64(info.community_autonomous_value)
            .op_push_slice(&vout_to_community)
            .push_slice(&[0; 8])
            .op_push_slice(&witness_vout);

        let coinbase_tx = OpData::default()
            .push_u32(1)
            .push_slice(&[0x00, 0x01, 0x01])
            .push_slice(&coinbase_txin)
            .push_slice(outputs.as_slice())
            .push_slice(&[0x01, 0x20])
            .push_slice(&[0; 32])
            .push_slice(&[0; 4]);

        // txid is taken over the serialization without marker, flag and witness
        let coinbase_no_wit = OpData::default()
            .push_u32(1)
            .push_u8(0x01)
            .push_slice(&coinbase_txin)
            .push_slice(outputs.as_slice())
            .push_slice(&[0; 4]);

        self.coinbase_txid = dsha256(coinbase_no_wit.as_slice());
        self.coinbase_tx = coinbase_tx.into_vec();

        let mut txids = Vec::with_capacity(info.transactions.len() + 1);
        txids.push(self.coinbase_txid);
        for tx in &info.transactions {
            let mut h = hex::decode(&tx.txid).context("bad txid in template")?;
            h.reverse();
            txids.push(
                h.try_into()
                    .map_err(|_| anyhow!("txid in template is not 32 bytes"))?,
            );
        }
        self.external_txs = info.transactions.iter().map(|tx| tx.data.clone()).collect();
        let merkle = merkle_from_txids(txids);

        let mut bits = hex::decode(&info.bits).context("bad bits")?;
        bits.reverse();
        self.header = OpData::default()
            .push_u32(info.version)
            .push_slice(&self.prev_hash)
            .push_slice(&merkle)
            .push_u32(ts as u32)
            .push_slice(&bits)
            .push_u32(info.height)
            .into_vec();

        let mut header_hash = dsha256(&self.header);
        header_hash.reverse();
        self.header_hash = hex::encode(header_hash);
        self.timestamp = ts;
        self.job_counter += 1;
        Ok(())
    }

    /// Full block hex for `submitblock`: header, nonce, mix hash, tx count,
    /// coinbase, then the external transactions in template order.
    pub fn build_block(&self, nonce_hex: &str, mixhash_hex: &str) -> String {
        format!(
            "{}{}{}{}{}{}",
            hex::encode(&self.header),
            nonce_hex,
            mixhash_hex,
            hex::encode(var_int(self.external_txs.len() as u64 + 1)),
            hex::encode(&self.coinbase_tx),
            self.external_txs.concat()
        )
    }
}

fn coinbase_txin(script: &[u8]) -> Vec<u8> {
    let mut data = vec![0; 32];
    data.extend_from_slice(&[0xff; 4]);
    data.extend_from_slice(&var_int(script.len() as u64));
    data.extend_from_slice(script);
    data.extend_from_slice(&[0xff; 4]);
    data
}

/// Block height as serialized at the fixed offset behind version, previous
/// hash, merkle root, time and bits.
pub fn block_height_from_hex(block_hex: &str) -> Option<u32> {
    let start = (4 + 32 + 32 + 4 + 4) * 2;
    let raw = hex::decode(block_hex.get(start..start + 8)?).ok()?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

impl fmt::Display for TemplateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Height:\t\t{}", self.height)?;
        writeln!(f, "Job:\t\t{}", self.job_id())?;
        writeln!(f, "Bits:\t\t{}", self.bits)?;
        writeln!(f, "Target:\t\t{}", self.target)?;
        writeln!(f, "Version:\t{}", self.version)?;
        writeln!(f, "Prev hash:\t{}", hex::encode(self.prev_hash))?;
        writeln!(
            f,
            "Seed hash:\t{}",
            hex::encode(self.seed_hash.unwrap_or_default())
        )?;
        writeln!(f, "Header:\t\t{}", hex::encode(&self.header))?;
        writeln!(f, "Header hash:\t{}", self.header_hash)?;
        writeln!(f, "Coinbase:\t{}", hex::encode(&self.coinbase_tx))?;
        writeln!(f, "Coinbase txid:\t{}", hex::encode(self.coinbase_txid))?;
        writeln!(f, "External txs:\t{}", self.external_txs.join(" "))
    }
}
