use anyhow::{Context, Result};
use log::{error, info, warn};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::error::TrySendError;

use crate::config::Config;
use crate::difficulty::format_difficulty;
use crate::node::NodeClient;
use crate::state::{ProxyState, SessionHandle, SharedState};
use crate::stratum::{notify_line, set_target_line};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FAILURE_BACKOFF: Duration = Duration::from_secs(300);

/// Polls the node for template changes until the process ends. A failed
/// tick backs off for five minutes before polling resumes.
pub async fn run(state: SharedState, node: NodeClient, cfg: Config) {
    loop {
        if let Err(e) = tick(&state, &node, &cfg).await {
            error!("getblocktemplate poll failed: {e:#}");
            error!(
                "Sleeping for {} seconds; solutions found during this time may not be current",
                FAILURE_BACKOFF.as_secs()
            );
            tokio::time::sleep(FAILURE_BACKOFF).await;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn tick(state: &SharedState, node: &NodeClient, cfg: &Config) -> Result<()> {
    // nothing to build until somebody has authorized a payout address
    let Some(miner_h160) = state.lock().unwrap().miner_h160 else {
        return Ok(());
    };

    let info = node.get_block_template().await?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs();

    let mut guard = state.lock().unwrap();
    let st = &mut *guard;

    let new_block = st.template.is_new_block(&info);
    let new_txs = st.template.has_new_transactions(&info);
    let stale = st.template.is_stale(now);
    let rebuild = new_block || new_txs || stale;

    // late shares for the outgoing job need its exact header and tx set
    if rebuild {
        st.history.insert(st.template.clone());
    }

    st.template.apply_wire_fields(&info)?;

    if new_block {
        if cfg.verbose {
            info!("New block, updating state");
        }
        st.template.update_seed_hash(i64::from(info.height));
        st.template.height = i64::from(info.height);
    }

    if rebuild {
        st.template.rebuild(&info, &miner_h160, now)?;
        if cfg.show_jobs {
            info!(
                "New job {} diff {} height {}",
                st.template.job_id(),
                format_difficulty(&st.template.target),
                st.template.height
            );
        }
    }

    broadcast(st, rebuild);

    Ok(())
}

/// Delivers the current job: to everyone after a rebuild, and to fresh
/// subscribers unconditionally, promoting them into the broadcast set.
/// Sessions whose queues have closed are pruned from both registries.
fn broadcast(st: &mut ProxyState, rebuilt: bool) {
    let mut dead = Vec::new();

    if rebuilt {
        let set_target = set_target_line(&st.template.target);
        let notify = notify_line(&st.template);
        for handle in st.all_sessions.values() {
            push_job(handle, &set_target, &notify, &mut dead);
        }
    }

    if !st.new_sessions.is_empty() {
        let set_target = set_target_line(&st.template.target);
        let notify = notify_line(&st.template);
        let joining: Vec<SessionHandle> = st.new_sessions.drain().map(|(_, h)| h).collect();
        for handle in joining {
            push_job(&handle, &set_target, &notify, &mut dead);
            st.all_sessions.insert(handle.id, handle);
        }
    }

    for id in dead {
        st.new_sessions.remove(&id);
        st.all_sessions.remove(&id);
    }
}

/// Queues the target and the job on a session's outbound queue. A full
/// queue drops the remainder of the pair, so a notify never arrives ahead
/// of the target it belongs to.
fn push_job(handle: &SessionHandle, set_target: &str, notify: &str, dead: &mut Vec<u64>) {
    for line in [set_target, notify] {
        match handle.tx.try_send(line.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    "session {} cannot keep up, dropping a job notification",
                    handle.id
                );
                return;
            }
            Err(TrySendError::Closed(_)) => {
                dead.push(handle.id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;

    fn state_with_job() -> ProxyState {
        let mut st = ProxyState::new();
        st.template.job_counter = 4;
        st.template.height = 10;
        st.template.target = "00ff".to_string();
        st.template.bits = "1a5ab50d".to_string();
        st.template.header_hash = "aa".repeat(32);
        st.template.seed_hash = Some([0; 32]);
        st
    }

    #[test]
    fn test_broadcast_promotes_new_sessions() {
        let mut st = state_with_job();
        let (tx, mut rx) = mpsc::channel(8);
        st.new_sessions.insert(1, SessionHandle { id: 1, tx });

        // fresh subscribers get the current job even with nothing rebuilt
        broadcast(&mut st, false);
        assert!(st.new_sessions.is_empty());
        assert!(st.all_sessions.contains_key(&1));

        let first = rx.try_recv().unwrap();
        assert!(first.contains("mining.set_target"));
        let second = rx.try_recv().unwrap();
        assert!(second.contains("mining.notify"));
        assert!(second.contains("\"4\""));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_reaches_subscribed_sessions_on_rebuild() {
        let mut st = state_with_job();
        let (tx, mut rx) = mpsc::channel(8);
        st.all_sessions.insert(2, SessionHandle { id: 2, tx });

        broadcast(&mut st, false);
        assert!(rx.try_recv().is_err());

        broadcast(&mut st, true);
        assert!(rx.try_recv().unwrap().contains("mining.set_target"));
        assert!(rx.try_recv().unwrap().contains("mining.notify"));
    }

    #[test]
    fn test_broadcast_prunes_closed_sessions() {
        let mut st = state_with_job();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        st.all_sessions.insert(3, SessionHandle { id: 3, tx });
        broadcast(&mut st, true);
        assert!(st.all_sessions.is_empty());
    }

    #[test]
    fn test_full_queue_never_delivers_notify_without_target() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = SessionHandle { id: 5, tx };
        let mut dead = Vec::new();
        push_job(&handle, "target-line", "notify-line", &mut dead);
        assert_eq!(rx.try_recv().unwrap(), "target-line");
        assert!(rx.try_recv().is_err());
        assert!(dead.is_empty());
    }
}
