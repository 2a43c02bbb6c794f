//! Options and Configuration Loading
//!
//! [`IpcOptions`] is the immutable option set consumed once when a channel
//! is constructed. Nothing mutates it after construction; server and client
//! each hold their own `Arc` of it.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. Explicit overrides supplied by the caller (CLI arguments)
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! id = "worker"
//! appspace = "app."
//! socket_root = "/run/user/1000/"
//! max_connections = 32
//! retry = 250
//! max_retries = 10
//!
//! [interfaces]
//! local_port = 40000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TransportError};

/// Default unix socket namespace
pub const DEFAULT_APPSPACE: &str = "app.";

/// Default directory for unix sockets
pub const DEFAULT_SOCKET_ROOT: &str = "/tmp/";

/// Host used when only a TCP port is configured
pub const DEFAULT_NETWORK_HOST: &str = "localhost";

// =============================================================================
// Option Types
// =============================================================================

/// Text encoding applied to raw-buffer payloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// 7-bit ASCII
    Ascii,
    /// UTF-8
    #[default]
    Utf8,
    /// UTF-16 little endian
    Utf16le,
    /// Alias of UTF-16 little endian
    Ucs2,
    /// Standard base64
    Base64,
    /// Lowercase hex
    Hex,
}

impl Encoding {
    /// Render raw bytes as text in this encoding
    #[must_use]
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Ascii => bytes.iter().map(|b| char::from(b & 0x7f)).collect(),
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Utf16le | Self::Ucs2 => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
            Self::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
            Self::Hex => hex::encode(bytes),
        }
    }

    /// Length of the longest prefix of `bytes` that ends on a character
    /// boundary
    ///
    /// The remainder is a partial character that must wait for more bytes
    /// before [`encode`](Self::encode) can render it. Byte-wise encodings
    /// are always complete.
    #[must_use]
    pub fn complete_len(self, bytes: &[u8]) -> usize {
        match self {
            Self::Ascii | Self::Hex | Self::Base64 => bytes.len(),
            Self::Utf8 => utf8_complete_len(bytes),
            Self::Utf16le | Self::Ucs2 => {
                let even = bytes.len() & !1;
                // A trailing high surrogate waits for its pair
                match even.checked_sub(2) {
                    Some(last)
                        if (0xD800..=0xDBFF)
                            .contains(&u16::from_le_bytes([bytes[last], bytes[last + 1]])) =>
                    {
                        last
                    }
                    _ => even,
                }
            }
        }
    }

    /// Turn text in this encoding back into raw bytes
    ///
    /// # Errors
    ///
    /// Returns `TransportError::SerializationError` for malformed base64 or hex.
    pub fn decode(self, text: &str) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::Ascii => Ok(text.chars().map(|c| (u32::from(c) & 0x7f) as u8).collect()),
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Utf16le | Self::Ucs2 => Ok(text
                .encode_utf16()
                .flat_map(u16::to_le_bytes)
                .collect()),
            Self::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| TransportError::SerializationError(e.to_string())),
            Self::Hex => {
                hex::decode(text).map_err(|e| TransportError::SerializationError(e.to_string()))
            }
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "ascii" => Some(Self::Ascii),
            "utf8" | "utf-8" => Some(Self::Utf8),
            "utf16le" => Some(Self::Utf16le),
            "ucs2" => Some(Self::Ucs2),
            "base64" => Some(Self::Base64),
            "hex" => Some(Self::Hex),
            _ => None,
        }
    }
}

fn utf8_complete_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // Walk back over continuation bytes to the last lead byte
    for back in 1..=len.min(4) {
        let lead = bytes[len - back];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let width = match lead {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return len,
        };
        return if back < width { len - back } else { len };
    }
    len
}

/// Local interface selection for TCP clients
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceOptions {
    /// Local address to bind before connecting
    pub local_address: Option<String>,
    /// Local port to bind before connecting
    pub local_port: Option<u16>,
}

impl InterfaceOptions {
    /// True when no local binding was requested
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.local_address.is_none() && self.local_port.is_none()
    }
}

/// Where a channel listens or connects
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket at this path
    Unix(PathBuf),
    /// TCP host and port
    Tcp {
        /// Host name or address
        host: String,
        /// Port number
        port: u16,
    },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// Channel options shared by server and client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcOptions {
    /// ID of this socket or service
    pub id: String,
    /// Unix socket namespace, prefixed to `id`
    pub appspace: String,
    /// Directory in which the unix socket lives
    pub socket_root: PathBuf,
    /// TCP host (TCP is used when `network_port` is set)
    pub network_host: Option<String>,
    /// TCP port
    pub network_port: Option<u16>,
    /// Socket file readable by all users
    pub readable_all: bool,
    /// Socket file writable by all users
    pub writable_all: bool,
    /// Maximum concurrent peers accepted by a server
    pub max_connections: usize,
    /// Encoding for raw-buffer payloads
    pub encoding: Encoding,
    /// Send and receive raw bytes instead of JSON envelopes
    pub raw_buffer: bool,
    /// Frame separator; when set frames are delimited JSON
    pub delimiter: Option<String>,
    /// Suppress channel-level debug logging
    pub silent: bool,
    /// Remove a stale socket file before binding
    pub unlink: bool,
    /// Client reconnect interval in milliseconds
    pub retry: u64,
    /// Reconnect attempts after each disconnect (`None` = unlimited)
    pub max_retries: Option<u32>,
    /// Never reconnect after a disconnect
    pub stop_retrying: bool,
    /// Local interface binding for TCP clients
    pub interfaces: InterfaceOptions,
}

impl IpcOptions {
    /// Create options with defaults for everything but the ID
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            appspace: DEFAULT_APPSPACE.to_string(),
            socket_root: PathBuf::from(DEFAULT_SOCKET_ROOT),
            network_host: None,
            network_port: None,
            readable_all: false,
            writable_all: false,
            max_connections: 100,
            encoding: Encoding::Utf8,
            raw_buffer: false,
            delimiter: None,
            silent: false,
            unlink: true,
            retry: 500,
            max_retries: None,
            stop_retrying: false,
            interfaces: InterfaceOptions::default(),
        }
    }

    /// Options for a unix socket under `root`
    pub fn unix(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            socket_root: root.into(),
            ..Self::new(id)
        }
    }

    /// Options for a TCP endpoint
    pub fn tcp(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            network_host: Some(host.into()),
            network_port: Some(port),
            ..Self::new(id)
        }
    }

    /// Unix socket path: `socket_root` + `appspace` + `id`
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.socket_root
            .join(format!("{}{}", self.appspace, self.id))
    }

    /// Endpoint selected by these options
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        match self.network_port {
            Some(port) => Endpoint::Tcp {
                host: self
                    .network_host
                    .clone()
                    .unwrap_or_else(|| DEFAULT_NETWORK_HOST.to_string()),
                port,
            },
            None => Endpoint::Unix(self.socket_path()),
        }
    }

    /// Reconnect interval
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry)
    }

    /// Unix file mode for the socket file
    #[must_use]
    pub fn socket_mode(&self) -> u32 {
        let mut mode = 0o600;
        if self.readable_all {
            mode |= 0o044;
        }
        if self.writable_all {
            mode |= 0o022;
        }
        mode
    }

    /// Validate the options
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty ID, a zero
    /// connection cap, or an empty delimiter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "id must not be empty".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.delimiter.as_deref() == Some("") {
            return Err(ConfigError::ValidationError(
                "delimiter must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Adapter Options
// =============================================================================

/// How a client correlates responses with requests
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMode {
    /// Responses are matched by pattern only; at most one outstanding
    /// request per pattern can be told apart
    #[default]
    SingleFlight,
    /// Requests carry a monotonic ID that the server echoes back
    RequestId,
}

/// Event name the server uses for responses in single-flight mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseEvent {
    /// Tag every response as the generic `"message"` event
    #[default]
    Generic,
    /// Tag the response with the request's pattern
    Pattern,
}

/// Server-side adapter knobs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Upper bound for each lifecycle hook; `None` waits forever
    pub hook_timeout: Option<Duration>,
    /// Response tagging in single-flight mode
    pub response_event: ResponseEvent,
    /// Accept correlated request envelopes
    pub correlation: CorrelationMode,
}

/// Client-side adapter knobs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// How responses are matched to requests
    pub correlation: CorrelationMode,
    /// Timeout applied by [`TransportClient::request`](crate::client::TransportClient::request)
    /// only; `publish` never times out on its own
    pub request_timeout: Option<Duration>,
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the loaded options came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// TOML file layout; every field optional
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsToml {
    /// Socket or service ID
    pub id: Option<String>,
    /// Unix socket namespace
    pub appspace: Option<String>,
    /// Unix socket directory
    pub socket_root: Option<PathBuf>,
    /// TCP host
    pub network_host: Option<String>,
    /// TCP port
    pub network_port: Option<u16>,
    /// Socket readable by all
    pub readable_all: Option<bool>,
    /// Socket writable by all
    pub writable_all: Option<bool>,
    /// Connection cap
    pub max_connections: Option<usize>,
    /// Raw payload encoding
    pub encoding: Option<Encoding>,
    /// Raw buffer mode
    pub raw_buffer: Option<bool>,
    /// Frame delimiter
    pub delimiter: Option<String>,
    /// Silence channel logging
    pub silent: Option<bool>,
    /// Unlink stale socket
    pub unlink: Option<bool>,
    /// Reconnect interval in milliseconds
    pub retry: Option<u64>,
    /// Reconnect attempt cap
    pub max_retries: Option<u32>,
    /// Disable reconnects
    pub stop_retrying: Option<bool>,
    /// TCP client interface binding
    pub interfaces: Option<InterfaceOptions>,
}

/// Options plus where they came from
#[derive(Clone, Debug)]
pub struct LoadedOptions {
    /// The resolved options
    pub options: IpcOptions,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Highest-priority source that contributed a value
    pub source: ConfigSource,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or `~/.config/relay/relay.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load options from the default file location and the environment
///
/// `id` overrides any ID found in the file or environment.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// no source provides an ID.
pub fn load_options(id: Option<String>) -> Result<LoadedOptions, ConfigError> {
    load_options_from_path(default_config_path().as_deref(), id)
}

/// Load options from a specific file and the environment
///
/// A missing file is not an error (defaults are used).
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, if no source
/// provides an ID, or if the result fails [`IpcOptions::validate`].
pub fn load_options_from_path(
    path: Option<&Path>,
    id: Option<String>,
) -> Result<LoadedOptions, ConfigError> {
    let mut layer = OptionsToml::default();
    let mut source = ConfigSource::Default;
    let mut config_file_path = None;

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            layer = toml::from_str(&content)?;
            source = ConfigSource::File;
            config_file_path = Some(config_path.to_path_buf());

            tracing::info!(path = %config_path.display(), "Loaded options from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    if apply_env_overrides(&mut layer)? {
        source = ConfigSource::Env;
    }

    if id.is_some() {
        layer.id = id;
        source = ConfigSource::Cli;
    }

    let options = resolve(layer)?;
    options.validate()?;

    Ok(LoadedOptions {
        options,
        config_file_path,
        source,
    })
}

/// Turn a fully layered TOML value into options
fn resolve(layer: OptionsToml) -> Result<IpcOptions, ConfigError> {
    let id = layer.id.ok_or(ConfigError::MissingOption("id"))?;
    let mut options = IpcOptions::new(id);

    if let Some(appspace) = layer.appspace {
        options.appspace = appspace;
    }
    if let Some(root) = layer.socket_root {
        options.socket_root = root;
    }
    options.network_host = layer.network_host;
    options.network_port = layer.network_port;
    if let Some(v) = layer.readable_all {
        options.readable_all = v;
    }
    if let Some(v) = layer.writable_all {
        options.writable_all = v;
    }
    if let Some(v) = layer.max_connections {
        options.max_connections = v;
    }
    if let Some(v) = layer.encoding {
        options.encoding = v;
    }
    if let Some(v) = layer.raw_buffer {
        options.raw_buffer = v;
    }
    options.delimiter = layer.delimiter;
    if let Some(v) = layer.silent {
        options.silent = v;
    }
    if let Some(v) = layer.unlink {
        options.unlink = v;
    }
    if let Some(v) = layer.retry {
        options.retry = v;
    }
    options.max_retries = layer.max_retries;
    if let Some(v) = layer.stop_retrying {
        options.stop_retrying = v;
    }
    if let Some(v) = layer.interfaces {
        options.interfaces = v;
    }

    Ok(options)
}

/// Apply `RELAY_*` environment variables on top of the file layer
///
/// Returns true if any variable was applied.
fn apply_env_overrides(layer: &mut OptionsToml) -> Result<bool, ConfigError> {
    apply_overrides(layer, |name| std::env::var(name).ok())
}

/// Apply overrides read through `lookup`; a set but malformed value is fatal
fn apply_overrides<F>(layer: &mut OptionsToml, lookup: F) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = false;

    let mut string_var = |name: &str, slot: &mut Option<String>| {
        if let Some(value) = lookup(name) {
            *slot = Some(value);
            applied = true;
        }
    };
    string_var("RELAY_ID", &mut layer.id);
    string_var("RELAY_APPSPACE", &mut layer.appspace);
    string_var("RELAY_NETWORK_HOST", &mut layer.network_host);
    string_var("RELAY_DELIMITER", &mut layer.delimiter);

    if let Some(root) = lookup("RELAY_SOCKET_ROOT") {
        layer.socket_root = Some(PathBuf::from(root));
        applied = true;
    }
    if let Some(port) = parse_var::<u16>(&lookup, "RELAY_NETWORK_PORT")? {
        layer.network_port = Some(port);
        applied = true;
    }
    if let Some(max) = parse_var::<usize>(&lookup, "RELAY_MAX_CONNECTIONS")? {
        layer.max_connections = Some(max);
        applied = true;
    }
    if let Some(retry) = parse_var::<u64>(&lookup, "RELAY_RETRY")? {
        layer.retry = Some(retry);
        applied = true;
    }
    if let Some(max) = parse_var::<u32>(&lookup, "RELAY_MAX_RETRIES")? {
        layer.max_retries = Some(max);
        applied = true;
    }
    if let Some(value) = lookup("RELAY_ENCODING") {
        let encoding =
            Encoding::parse(&value).ok_or_else(|| invalid_var("RELAY_ENCODING", &value))?;
        layer.encoding = Some(encoding);
        applied = true;
    }
    if let Some(silent) = flag_var(&lookup, "RELAY_SILENT")? {
        layer.silent = Some(silent);
        applied = true;
    }
    if let Some(raw) = flag_var(&lookup, "RELAY_RAW_BUFFER")? {
        layer.raw_buffer = Some(raw);
        applied = true;
    }

    Ok(applied)
}

fn invalid_var(name: &str, value: &str) -> ConfigError {
    ConfigError::ValidationError(format!("{name} has an invalid value: {value:?}"))
}

fn parse_var<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|v| v.trim().parse().map_err(|_| invalid_var(name, &v)))
        .transpose()
}

fn flag_var(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<bool>, ConfigError> {
    lookup(name)
        .map(|v| match v.trim().to_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => Err(invalid_var(name, &v)),
        })
        .transpose()
}
