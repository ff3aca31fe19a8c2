pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    /// ICE server urls handed to the transport engine.
    pub ice_servers: Vec<String>,
    /// Remote candidates held while no remote description exists; later
    /// arrivals past this bound are dropped with a warning.
    pub max_pending_candidates: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
        }
    }
}

impl CallConfig {
    pub fn with_ice_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ice_servers = servers
            .into_iter()
            .map(|server| server.as_ref().trim().to_string())
            .filter(|server| !server.is_empty())
            .map(|server| normalize_ice_url(&server))
            .collect();
        self
    }

    pub fn with_max_pending_candidates(mut self, limit: usize) -> Self {
        self.max_pending_candidates = limit;
        self
    }
}

/// Bare `host:port` entries are treated as STUN servers.
pub fn normalize_ice_url(url: &str) -> String {
    if url.starts_with("stun:") || url.starts_with("stuns:") || url.starts_with("turn:")
        || url.starts_with("turns:")
    {
        url.to_string()
    } else {
        format!("stun:{url}")
    }
}
