mod address;
mod config;
mod difficulty;
mod history;
mod merkle;
mod node;
mod op_data;
mod script;
mod state;
mod stratum;
mod template;
mod updater;

use anyhow::{Context, Result};
use clap::Parser;
use log::error;
use std::sync::{Arc, Mutex};

use crate::config::{Config, MAINNET_RPC_PORT, TESTNET_RPC_PORT};
use crate::node::NodeClient;
use crate::state::{ProxyState, SharedState};

/// Stratum proxy to solo mine to a Meowcoin node.
#[derive(Parser)]
#[clap(name = "mewc-stratum-proxy", version)]
struct Cli {
    /// The address to listen on
    #[clap(long, default_value = "127.0.0.1")]
    address: String,

    /// The port to listen on
    #[clap(long, default_value_t = 54321)]
    port: u16,

    /// The ip of the node rpc server to connect to
    #[clap(long, default_value = "127.0.0.1")]
    rpcip: String,

    /// The port of the node rpc server (9776, or 19776 with --testnet)
    #[clap(long)]
    rpcport: Option<u16>,

    /// The username of the node rpc server
    #[clap(long)]
    rpcuser: String,

    /// The password of the node rpc server
    #[clap(long)]
    rpcpass: String,

    /// Running on testnet
    #[clap(short, long)]
    testnet: bool,

    /// Show jobs in the log
    #[clap(short, long)]
    jobs: bool,

    /// Set log level to debug
    #[clap(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = Config {
        listen_addr: cli.address,
        listen_port: cli.port,
        rpc_ip: cli.rpcip,
        rpc_port: cli.rpcport.unwrap_or(if cli.testnet {
            TESTNET_RPC_PORT
        } else {
            MAINNET_RPC_PORT
        }),
        rpc_user: cli.rpcuser,
        rpc_pass: cli.rpcpass,
        testnet: cli.testnet,
        verbose: cli.verbose,
        show_jobs: cli.jobs || cli.verbose,
    };

    std::fs::create_dir_all("submit_history").context("creating submit_history")?;

    let state: SharedState = Arc::new(Mutex::new(ProxyState::new()));
    let node = NodeClient::new(&cfg)?;

    let updater = tokio::spawn(updater::run(state.clone(), node.clone(), cfg.clone()));
    let server = tokio::spawn(stratum::serve(state, node, cfg));

    // either task ending takes the whole proxy down
    tokio::select! {
        res = updater => {
            if let Err(e) = res {
                error!("template updater stopped: {e}");
            }
        }
        res = server => {
            match res {
                Ok(Err(e)) => error!("stratum server stopped: {e:#}"),
                Err(e) => error!("stratum server stopped: {e}"),
                Ok(Ok(())) => {}
            }
        }
    }
    Ok(())
}
