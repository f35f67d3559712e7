use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7878";

/// Resolved, typed configuration (component process glue). Every key from
/// SPEC_FULL.md §6.1's configuration table lands here with its default
/// filled in — nothing downstream ever has to ask "was this key set?".
#[derive(Debug, Clone)]
pub struct Conf {
    pub listen_addr: SocketAddr,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub transport_base_path: String,
    pub park_timeout: Duration,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub call_timeout: Duration,
    /// `tls.dh_bits`: 0 disables DH parameter pre-generation. TLS itself is
    /// an external collaborator (`glue_contracts::TlsSession`) this crate
    /// doesn't implement, so this is recorded but otherwise inert here.
    pub tls_dh_bits: u32,
    pub debug: dto::DebugConf,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let listen_addr = conf_file
            .listen_addr
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN_ADDR)
            .parse()
            .context("invalid listen_addr")?;

        let transport = conf_file.transport.clone().unwrap_or_default();
        let lp = conf_file.lp.clone().unwrap_or_default();
        let peer = conf_file.peer.clone().unwrap_or_default();
        let bus = conf_file.bus.clone().unwrap_or_default();
        let tls = conf_file.tls.clone().unwrap_or_default();

        Ok(Self {
            listen_addr,
            log_file: conf_file.log_file.clone().unwrap_or_else(|| Utf8PathBuf::from("ipc-gateway")),
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            transport_base_path: transport.base_path,
            park_timeout: Duration::from_millis(lp.park_timeout_ms),
            idle_timeout: Duration::from_millis(peer.idle_timeout_ms),
            heartbeat_interval: Duration::from_millis(peer.heartbeat_ms),
            call_timeout: Duration::from_millis(bus.call_timeout_ms),
            tls_dh_bits: tls.dh_bits,
            debug: conf_file.debug.clone().unwrap_or_default(),
        })
    }
}

/// Configuration handle, source of truth for the current configuration
/// state. Cheap to clone (`Arc`-backed); layered precedence is CLI >
/// config file > built-in default, resolved once in [`ConfHandle::init`].
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<std::sync::RwLock<Arc<Conf>>>,
}

impl ConfHandle {
    pub fn init(cli: &crate::Cli) -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new(&cli.config_path)?;
        let mut conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        if let Some(listen_addr) = cli.listen_addr {
            conf.listen_addr = listen_addr;
        }
        if let Some(level) = cli.log_level.clone() {
            conf.debug.log_directives = Some(level);
        }

        Ok(Self {
            inner: Arc::new(std::sync::RwLock::new(Arc::new(conf))),
        })
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.read().expect("config lock poisoned").clone()
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => serde_json::from_reader(BufReader::new(file))
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

pub fn load_conf_file_or_generate_new(conf_path: &Utf8Path) -> anyhow::Result<dto::ConfFile> {
    match load_conf_file(conf_path).context("failed to load configuration")? {
        Some(conf_file) => Ok(conf_file),
        None => {
            let defaults = dto::ConfFile::generate_new();
            let json = serde_json::to_string_pretty(&defaults).context("failed JSON serialization of configuration")?;
            std::fs::write(conf_path, json).with_context(|| format!("failed to write default config at {conf_path}"))?;
            Ok(defaults)
        }
    }
}

pub mod dto {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TransportConf {
        #[serde(default = "default_base_path")]
        pub base_path: String,
    }

    impl Default for TransportConf {
        fn default() -> Self {
            Self {
                base_path: default_base_path(),
            }
        }
    }

    fn default_base_path() -> String {
        "/transport".to_owned()
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LpConf {
        #[serde(default = "default_park_timeout_ms")]
        pub park_timeout_ms: u64,
    }

    impl Default for LpConf {
        fn default() -> Self {
            Self {
                park_timeout_ms: default_park_timeout_ms(),
            }
        }
    }

    fn default_park_timeout_ms() -> u64 {
        30_000
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PeerConf {
        #[serde(default = "default_idle_timeout_ms")]
        pub idle_timeout_ms: u64,
        #[serde(default = "default_heartbeat_ms")]
        pub heartbeat_ms: u64,
    }

    impl Default for PeerConf {
        fn default() -> Self {
            Self {
                idle_timeout_ms: default_idle_timeout_ms(),
                heartbeat_ms: default_heartbeat_ms(),
            }
        }
    }

    fn default_idle_timeout_ms() -> u64 {
        15_000
    }

    fn default_heartbeat_ms() -> u64 {
        5_000
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BusConf {
        #[serde(default = "default_call_timeout_ms")]
        pub call_timeout_ms: u64,
    }

    impl Default for BusConf {
        fn default() -> Self {
            Self {
                call_timeout_ms: default_call_timeout_ms(),
            }
        }
    }

    fn default_call_timeout_ms() -> u64 {
        30_000
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TlsConf {
        /// `0` disables DH parameter pre-generation.
        #[serde(default)]
        pub dh_bits: u32,
    }

    impl Default for TlsConf {
        fn default() -> Self {
            Self { dh_bits: 0 }
        }
    }

    /// Verbosity profile (pre-defined tracing directives), mirroring the
    /// teacher's `devolutions-agent::config::dto::VerbosityProfile`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
    pub enum VerbosityProfile {
        #[default]
        Default,
        Debug,
        All,
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,ipc_gateway=debug,bus_bridge=debug,bus_agent=debug",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }

    /// Unsafe debug options, never required for safe operation by default.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
    pub struct DebugConf {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_directives: Option<String>,
    }

    /// Source of truth for the on-disk configuration file, kept close to
    /// the shape of SPEC_FULL.md §6.1's key table.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConfFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub listen_addr: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub transport: Option<TransportConf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub lp: Option<LpConf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub peer: Option<PeerConf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub bus: Option<BusConf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tls: Option<TlsConf>,
        #[serde(rename = "__debug__", default, skip_serializing_if = "Option::is_none")]
        pub debug: Option<DebugConf>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                listen_addr: None,
                log_file: None,
                verbosity_profile: None,
                transport: Some(TransportConf::default()),
                lp: Some(LpConf::default()),
                peer: Some(PeerConf::default()),
                bus: Some(BusConf::default()),
                tls: Some(TlsConf::default()),
                debug: None,
            }
        }
    }
}
