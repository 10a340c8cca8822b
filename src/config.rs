use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Port appended to resource addresses that do not name one.
pub const DEFAULT_RESOURCE_PORT: u16 = 9443;

/// TLS configuration for the queue <-> resource channel.
///
/// When enabled, every RPC uses mutual TLS (mTLS):
/// - The resource presents its certificate and verifies the queue's
/// - The queue presents its certificate and verifies the resource's
/// - Both sides must have certificates signed by the same CA
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this process's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this process's private key (PEM format).
    /// Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Allow plaintext connections for development/testing.
    /// When true and TLS files are missing, runs in plaintext mode with warning.
    /// When false and TLS files are missing, fails to start.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// Settings for the central queue and its keeper.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Time between two keeper ticks.
    pub keeper_interval: Duration,
    /// Upper bound on a single RPC to a resource. The queue lock is held for
    /// the duration of each call, so this also bounds lock hold time.
    pub rpc_timeout: Duration,
    pub connect_timeout: Duration,
    /// Snapshot of the stack and pool, rewritten every keeper tick.
    pub state_file: Option<PathBuf>,
    /// SQLite job record store.
    pub job_db: Option<PathBuf>,
    /// How long finished jobs stay visible before the keeper drops them.
    /// `None` keeps them forever.
    pub purge_after: Option<Duration>,
    pub default_port: u16,
    pub tls: TlsConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keeper_interval: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            state_file: None,
            job_db: None,
            purge_after: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            default_port: DEFAULT_RESOURCE_PORT,
            tls: TlsConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_keeper_interval(mut self, interval: Duration) -> Self {
        self.keeper_interval = interval;
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn with_job_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.job_db = Some(path.into());
        self
    }

    /// Normalize a resource address into a URI tonic can dial.
    pub fn resource_uri(&self, address: &str) -> String {
        let (scheme, rest) = match address.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None if self.tls.enabled => ("https".to_string(), address),
            None => ("http".to_string(), address),
        };

        let has_port = match rest.rsplit_once(':') {
            // Bare IPv6 literals contain colons without naming a port.
            Some((host, port)) => !host.ends_with(':') && port.parse::<u16>().is_ok(),
            None => false,
        };

        if has_port {
            format!("{}://{}", scheme, rest)
        } else {
            format!("{}://{}:{}", scheme, rest, self.default_port)
        }
    }
}

/// Settings for a resource server hosting a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen_addr: SocketAddr,
    /// Shared secret every non-ping call must carry.
    pub auth_token: String,
    /// Tick of the built-in timer tool.
    pub timer_tick: Duration,
    pub tls: TlsConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RESOURCE_PORT)),
            auth_token: String::new(),
            timer_tick: Duration::from_secs(1),
            tls: TlsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_config_default() {
        let cfg = TlsConfig::default();
        assert!(!cfg.enabled);
        assert!(cfg.ca_cert_path.is_none());
        assert!(!cfg.allow_insecure);
    }

    #[test]
    fn tls_config_is_not_complete_when_path_missing() {
        let base = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/ca.pem")),
            cert_path: Some(PathBuf::from("/cert.pem")),
            key_path: Some(PathBuf::from("/key.pem")),
            allow_insecure: false,
        };
        assert!(base.is_complete());

        let mut cfg = base.clone();
        cfg.key_path = None;
        assert!(!cfg.is_complete());

        let mut cfg = base;
        cfg.enabled = false;
        assert!(!cfg.is_complete());
    }

    #[test]
    fn queue_config_default() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.keeper_interval, Duration::from_secs(30));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(10));
        assert_eq!(cfg.default_port, 9443);
        assert!(cfg.state_file.is_none());
        assert_eq!(cfg.purge_after, Some(Duration::from_secs(604_800)));
    }

    #[test]
    fn resource_uri_appends_default_port() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.resource_uri("worker1"), "http://worker1:9443");
        assert_eq!(cfg.resource_uri("10.0.0.5:7000"), "http://10.0.0.5:7000");
        assert_eq!(
            cfg.resource_uri("https://gpu.example.com"),
            "https://gpu.example.com:9443"
        );
    }

    #[test]
    fn resource_uri_uses_https_with_tls() {
        let mut cfg = QueueConfig::default();
        cfg.tls.enabled = true;
        assert_eq!(cfg.resource_uri("worker1:1234"), "https://worker1:1234");
    }

    #[test]
    fn dispatcher_config_default() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.listen_addr.port(), DEFAULT_RESOURCE_PORT);
        assert_eq!(cfg.timer_tick, Duration::from_secs(1));
    }
}
