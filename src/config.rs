pub const MAINNET_RPC_PORT: u16 = 9776;
pub const TESTNET_RPC_PORT: u16 = 19776;

/// Runtime configuration, assembled from the command line by `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub listen_port: u16,
    pub rpc_ip: String,
    pub rpc_port: u16,
    pub rpc_user: String,
    pub rpc_pass: String,
    pub testnet: bool,
    pub verbose: bool,
    pub show_jobs: bool,
}

impl Config {
    pub fn node_url(&self) -> String {
        format!("http://{}:{}", self.rpc_ip, self.rpc_port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_url() {
        let cfg = Config {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 54321,
            rpc_ip: "10.0.0.2".to_string(),
            rpc_port: MAINNET_RPC_PORT,
            rpc_user: "user".to_string(),
            rpc_pass: "pass".to_string(),
            testnet: false,
            verbose: false,
            show_jobs: false,
        };
        assert_eq!(cfg.node_url(), "http://10.0.0.2:9776");
    }
}
