use std::env;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
const DEFAULT_CHANNEL_LABEL: &str = "beach-bottle-chat";

/// Peer connection settings for one chat session.
#[derive(Clone, Debug)]
pub struct Config {
    /// STUN/TURN servers used during candidate gathering.
    pub ice_servers: Vec<RTCIceServer>,
    /// Label of the chat data channel the initiator opens.
    pub data_channel_label: String,
    /// Gather loopback candidates (needed when both peers share a host).
    pub include_loopback: bool,
    /// Upper bound on the gathering wait. `None` waits until gathering
    /// completes or the session is dropped.
    pub gather_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: vec![stun_server(DEFAULT_STUN)],
            data_channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            include_loopback: false,
            gather_timeout: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(servers) = env::var("BEACH_BOTTLE_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(&servers);
        }

        if env_truthy("BEACH_BOTTLE_LOCALHOST_ONLY") {
            config.ice_servers.clear();
            config.include_loopback = true;
        }

        if let Some(secs) = env::var("BEACH_BOTTLE_GATHER_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            config.gather_timeout = Some(Duration::from_secs(secs));
        }

        config
    }

    /// No STUN/TURN, loopback candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            include_loopback: true,
            ..Default::default()
        }
    }

    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = urls.iter().map(|url| stun_server(url)).collect();
        self
    }

    pub fn with_loopback(mut self, include_loopback: bool) -> Self {
        self.include_loopback = include_loopback;
        self
    }

    pub fn with_gather_timeout(mut self, limit: Option<Duration>) -> Self {
        self.gather_timeout = limit;
        self
    }
}

fn stun_server(url: &str) -> RTCIceServer {
    RTCIceServer {
        urls: vec![url.to_string()],
        ..Default::default()
    }
}

fn parse_ice_servers(value: &str) -> Vec<RTCIceServer> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(stun_server)
        .collect()
}

fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 3] = [
        "BEACH_BOTTLE_ICE_SERVERS",
        "BEACH_BOTTLE_LOCALHOST_ONLY",
        "BEACH_BOTTLE_GATHER_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn default_uses_public_stun_and_waits_forever() {
        let config = Config::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN.to_string()]);
        assert_eq!(config.data_channel_label, DEFAULT_CHANNEL_LABEL);
        assert!(config.gather_timeout.is_none());
        assert!(!config.include_loopback);
    }

    #[test]
    fn from_env_without_overrides_matches_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = Config::from_env();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.gather_timeout.is_none());
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(
                "BEACH_BOTTLE_ICE_SERVERS",
                "stun:a.example.org:3478, ,stun:b.example.org:3478",
            );
            env::set_var("BEACH_BOTTLE_GATHER_TIMEOUT_SECS", "7");
        }
        let config = Config::from_env();
        let urls: Vec<_> = config
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.clone())
            .collect();
        assert_eq!(urls, vec!["stun:a.example.org:3478", "stun:b.example.org:3478"]);
        assert_eq!(config.gather_timeout, Some(Duration::from_secs(7)));
        clear_env();
    }

    #[test]
    fn localhost_only_clears_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("BEACH_BOTTLE_LOCALHOST_ONLY", "1") };
        let config = Config::from_env();
        assert!(config.ice_servers.is_empty());
        assert!(config.include_loopback);
        clear_env();
    }
}
