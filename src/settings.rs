//! Application settings, authentication values and tuning knobs.
//!
//! [`AppSettings`] derives serde so a host can load it from JSON or TOML:
//!
//! ```
//! use relay_realtime_client::settings::{AppSettings, ConnectionProtocol};
//!
//! let settings: AppSettings = serde_json::from_str(
//!     r#"{ "app_id": "app-1", "app_version": "1.0", "protocol": "tcp" }"#,
//! ).unwrap();
//! assert_eq!(settings.protocol, ConnectionProtocol::Tcp);
//! assert!(settings.use_directory);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::protocol::ParamValue;

/// Host of the default directory server.
pub const DEFAULT_DIRECTORY_HOST: &str = "ns.relay-service.net";

/// Default timeout of async operations.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Default interval of the service pump.
pub const DEFAULT_SERVICE_INTERVAL: Duration = Duration::from_millis(10);

// ── Protocol ────────────────────────────────────────────────────────

/// Transport protocol of the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionProtocol {
    #[default]
    Udp,
    Tcp,
    #[serde(rename = "ws")]
    WebSocket,
    #[serde(rename = "wss")]
    WebSocketSecure,
}

impl ConnectionProtocol {
    /// Protocol tried after a failed directory connect, if any.
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Udp => Some(Self::Tcp),
            Self::Tcp => Some(Self::Udp),
            Self::WebSocket | Self::WebSocketSecure => None,
        }
    }

    /// URL scheme prefix used in server addresses.
    pub fn scheme(self) -> Option<&'static str> {
        match self {
            Self::Udp | Self::Tcp => None,
            Self::WebSocket => Some("ws://"),
            Self::WebSocketSecure => Some("wss://"),
        }
    }
}

/// Default ports of the three server roles for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPorts {
    pub directory: u16,
    pub matchmaker: u16,
    pub relay: u16,
}

/// Default ports per protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolPorts {
    pub udp: ServerPorts,
    pub tcp: ServerPorts,
    pub ws: ServerPorts,
    pub wss: ServerPorts,
}

impl Default for ProtocolPorts {
    fn default() -> Self {
        Self {
            udp: ServerPorts {
                directory: 27000,
                matchmaker: 27001,
                relay: 27002,
            },
            tcp: ServerPorts {
                directory: 4533,
                matchmaker: 4530,
                relay: 4531,
            },
            ws: ServerPorts {
                directory: 80,
                matchmaker: 80,
                relay: 80,
            },
            wss: ServerPorts {
                directory: 443,
                matchmaker: 443,
                relay: 443,
            },
        }
    }
}

impl ProtocolPorts {
    pub fn for_protocol(&self, protocol: ConnectionProtocol) -> ServerPorts {
        match protocol {
            ConnectionProtocol::Udp => self.udp,
            ConnectionProtocol::Tcp => self.tcp,
            ConnectionProtocol::WebSocket => self.ws,
            ConnectionProtocol::WebSocketSecure => self.wss,
        }
    }
}

// ── Authentication ──────────────────────────────────────────────────

/// How credentials travel across the server hops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Full credentials at every hop.
    #[default]
    Auth,
    /// Credentials once at the directory; the token is presented on connect
    /// afterwards.
    AuthOnce,
}

/// Provider used for custom authentication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomAuthType {
    Custom,
    Steam,
    Facebook,
    Oculus,
    PlayStation,
    Xbox,
    NintendoSwitch,
    Epic,
    #[default]
    None,
}

impl CustomAuthType {
    pub fn code(self) -> u8 {
        match self {
            Self::Custom => 0,
            Self::Steam => 1,
            Self::Facebook => 2,
            Self::Oculus => 3,
            Self::PlayStation => 4,
            Self::Xbox => 5,
            Self::NintendoSwitch => 11,
            Self::Epic => 13,
            Self::None => 255,
        }
    }
}

/// Credentials sent when authenticating.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthValues {
    /// User id; assigned by the server when unset.
    pub user_id: Option<String>,
    pub auth_type: CustomAuthType,
    /// Query string forwarded to the custom authentication provider.
    pub auth_parameters: Option<String>,
    /// Body forwarded to the custom authentication provider.
    pub auth_data: Option<ParamValue>,
    /// Token issued by the server; set by the client after authentication.
    pub token: Option<String>,
}

impl AuthValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values with a random user id.
    pub fn anonymous() -> Self {
        Self::new().with_user_id(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_custom_auth(mut self, auth_type: CustomAuthType, parameters: impl Into<String>) -> Self {
        self.auth_type = auth_type;
        self.auth_parameters = Some(parameters.into());
        self
    }

    #[must_use]
    pub fn with_auth_data(mut self, data: ParamValue) -> Self {
        self.auth_data = Some(data);
        self
    }
}

// ── AppSettings ─────────────────────────────────────────────────────

/// Settings used by [`connect_using_settings`](crate::client::RealtimeClient::connect_using_settings).
///
/// The only required field is `app_id`; all others have defaults.
///
/// # Example
///
/// ```
/// use relay_realtime_client::settings::{AppSettings, AuthMode};
///
/// let settings = AppSettings::new("app-1")
///     .with_app_version("1.2")
///     .with_fixed_region("EU")
///     .with_auth_mode(AuthMode::AuthOnce);
/// assert_eq!(settings.fixed_region.as_deref(), Some("eu"));
/// assert_eq!(settings.directory_address(), "ns.relay-service.net:27000");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub app_id: String,
    pub app_version: String,
    /// Start at the directory server. When `false`, `server` is the
    /// matchmaker.
    pub use_directory: bool,
    /// Host of the directory, or of the matchmaker when `use_directory` is
    /// `false`. Defaults to [`DEFAULT_DIRECTORY_HOST`].
    pub server: Option<String>,
    /// Port override; `0` uses the protocol default.
    pub port: u16,
    /// Region to use instead of pinging.
    pub fixed_region: Option<String>,
    pub auth_mode: AuthMode,
    pub protocol: ConnectionProtocol,
    /// Retry the directory connect once with the other of UDP/TCP.
    pub enable_protocol_fallback: bool,
    /// Summary of the previous region selection, for sticky pinging.
    pub best_region_summary: Option<String>,
    pub ports: ProtocolPorts,
    pub region_ping: RegionPingConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_version: String::new(),
            use_directory: true,
            server: None,
            port: 0,
            fixed_region: None,
            auth_mode: AuthMode::default(),
            protocol: ConnectionProtocol::default(),
            enable_protocol_fallback: true,
            best_region_summary: None,
            ports: ProtocolPorts::default(),
            region_ping: RegionPingConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    /// Connect straight to a matchmaker at `host`, skipping the directory.
    #[must_use]
    pub fn with_matchmaker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.use_directory = false;
        self.server = Some(host.into());
        self.port = port;
        self
    }

    /// Use a custom directory host.
    #[must_use]
    pub fn with_directory(mut self, host: impl Into<String>, port: u16) -> Self {
        self.use_directory = true;
        self.server = Some(host.into());
        self.port = port;
        self
    }

    /// Region codes are lower-cased.
    #[must_use]
    pub fn with_fixed_region(mut self, region: impl Into<String>) -> Self {
        self.fixed_region = Some(region.into().to_lowercase());
        self
    }

    #[must_use]
    pub fn with_auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: ConnectionProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn with_protocol_fallback(mut self, enabled: bool) -> Self {
        self.enable_protocol_fallback = enabled;
        self
    }

    #[must_use]
    pub fn with_best_region_summary(mut self, summary: impl Into<String>) -> Self {
        self.best_region_summary = Some(summary.into());
        self
    }

    #[must_use]
    pub fn with_region_ping(mut self, config: RegionPingConfig) -> Self {
        self.region_ping = config;
        self
    }

    /// Fixed region, ignoring empty values.
    pub fn fixed_region(&self) -> Option<&str> {
        self.fixed_region.as_deref().filter(|r| !r.is_empty())
    }

    /// Address of the directory for the configured protocol.
    pub fn directory_address(&self) -> String {
        let host = self.server.as_deref().unwrap_or(DEFAULT_DIRECTORY_HOST);
        let port = self.port_or(self.ports.for_protocol(self.protocol).directory);
        format_address(self.protocol, host, port)
    }

    /// Address of the matchmaker when the directory is skipped.
    pub fn matchmaker_address(&self) -> Option<String> {
        let host = self.server.as_deref().filter(|h| !h.is_empty())?;
        let port = self.port_or(self.ports.for_protocol(self.protocol).matchmaker);
        Some(format_address(self.protocol, host, port))
    }

    fn port_or(&self, default: u16) -> u16 {
        if self.port == 0 {
            default
        } else {
            self.port
        }
    }
}

/// Builds `host:port`, adding the protocol scheme unless present.
pub fn format_address(protocol: ConnectionProtocol, host: &str, port: u16) -> String {
    match protocol.scheme() {
        Some(scheme) if !host.contains("://") => format!("{scheme}{host}:{port}"),
        _ => format!("{host}:{port}"),
    }
}

// ── Tuning ──────────────────────────────────────────────────────────

/// Region pinging parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionPingConfig {
    /// Sequential attempts per region. Defaults to **5**.
    pub attempts: u32,
    /// Cap of one attempt in milliseconds; failures count as this value.
    /// Defaults to **800**.
    pub max_ping_ms: u32,
    /// A sticky region is kept if its fresh ping is at most this many
    /// milliseconds. Defaults to **90**.
    pub reping_limit_ms: u32,
    /// Similarity factor for best-region and sticky decisions. Defaults to
    /// **1.2**.
    pub similarity_factor: f64,
    /// Port used by the UDP pinger. Defaults to **5056**.
    pub udp_port: u16,
}

impl Default for RegionPingConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            max_ping_ms: 800,
            reping_limit_ms: 90,
            similarity_factor: 1.2,
            udp_port: 5056,
        }
    }
}

impl RegionPingConfig {
    pub fn max_ping(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_ping_ms))
    }
}

/// Configuration of one async operation.
///
/// # Example
///
/// ```
/// use relay_realtime_client::settings::AsyncConfig;
/// use std::time::Duration;
///
/// let config = AsyncConfig::new().with_operation_timeout(Duration::from_secs(5));
/// assert_eq!(config.service_interval, Duration::from_millis(10));
/// ```
#[derive(Debug, Clone)]
pub struct AsyncConfig {
    /// Interval of the service pump. Defaults to **10 ms**.
    pub service_interval: Duration,
    /// Deadline of the operation. Defaults to **15 s**.
    pub operation_timeout: Duration,
    /// Drive `service()` from a pump task while the operation is pending.
    /// Disable when the host services the client itself. Defaults to **true**.
    pub create_pump: bool,
    /// Cancels the operation when triggered.
    pub cancellation: CancellationToken,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            service_interval: DEFAULT_SERVICE_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            create_pump: true,
            cancellation: CancellationToken::new(),
        }
    }
}

impl AsyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values below 1 ms are clamped to 1 ms.
    #[must_use]
    pub fn with_service_interval(mut self, interval: Duration) -> Self {
        self.service_interval = interval.max(Duration::from_millis(1));
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pump(mut self, create_pump: bool) -> Self {
        self.create_pump = create_pump;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_per_protocol() {
        let ports = ProtocolPorts::default();
        assert_eq!(ports.for_protocol(ConnectionProtocol::Udp).directory, 27000);
        assert_eq!(ports.for_protocol(ConnectionProtocol::Tcp).matchmaker, 4530);
        assert_eq!(ports.for_protocol(ConnectionProtocol::WebSocket).relay, 80);
        assert_eq!(
            ports.for_protocol(ConnectionProtocol::WebSocketSecure).directory,
            443
        );
    }

    #[test]
    fn fallback_swaps_udp_and_tcp_only() {
        assert_eq!(ConnectionProtocol::Udp.fallback(), Some(ConnectionProtocol::Tcp));
        assert_eq!(ConnectionProtocol::Tcp.fallback(), Some(ConnectionProtocol::Udp));
        assert_eq!(ConnectionProtocol::WebSocketSecure.fallback(), None);
    }

    #[test]
    fn matchmaker_address_uses_protocol_default_port() {
        let settings = AppSettings::new("app")
            .with_matchmaker("mm.local", 0)
            .with_protocol(ConnectionProtocol::Tcp);
        assert_eq!(settings.matchmaker_address().as_deref(), Some("mm.local:4530"));

        let settings = settings.with_matchmaker("mm.local", 9000);
        assert_eq!(settings.matchmaker_address().as_deref(), Some("mm.local:9000"));
    }

    #[test]
    fn websocket_addresses_carry_scheme() {
        let settings = AppSettings::new("app").with_protocol(ConnectionProtocol::WebSocketSecure);
        assert_eq!(settings.directory_address(), "wss://ns.relay-service.net:443");
    }

    #[test]
    fn empty_fixed_region_is_ignored() {
        let mut settings = AppSettings::new("app");
        settings.fixed_region = Some(String::new());
        assert_eq!(settings.fixed_region(), None);
    }

    #[test]
    fn settings_load_from_toml() {
        let settings: AppSettings = toml::from_str(
            r#"
            app_id = "app-7"
            auth_mode = "auth_once"
            enable_protocol_fallback = false

            [region_ping]
            attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(settings.auth_mode, AuthMode::AuthOnce);
        assert!(!settings.enable_protocol_fallback);
        assert_eq!(settings.region_ping.attempts, 3);
        assert_eq!(settings.region_ping.max_ping_ms, 800);
    }

    #[test]
    fn anonymous_auth_values_have_a_user_id() {
        let a = AuthValues::anonymous();
        let b = AuthValues::anonymous();
        assert!(a.user_id.is_some());
        assert_ne!(a.user_id, b.user_id);
    }

    #[test]
    fn async_config_defaults() {
        let config = AsyncConfig::default();
        assert_eq!(config.service_interval, Duration::from_millis(10));
        assert_eq!(config.operation_timeout, Duration::from_secs(15));
        assert!(config.create_pump);
        assert!(!config.cancellation.is_cancelled());
    }
}
