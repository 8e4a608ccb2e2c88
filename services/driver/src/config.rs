//! Driver configuration loading.
//!
//! Three layers, later wins: built-in defaults, an optional TOML file,
//! environment variables (prefix `CONDUIT_`, property names 1:1), then CLI
//! flags applied by `main`.
//!
//! # TOML shape
//! Flat keys matching the field names below, e.g.
//! ```toml
//! dir = "/dev/shm/conduit"
//! threading_mode = "shared"
//! term_buffer_length = "1m"
//! nak_unicast_delay = "60ms"
//! ```
//! Sizes accept `k`/`m`/`g` suffixes; durations accept `ns`/`us`/`ms`/`s`.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DriverError;

// ---------------------------------------------------------------------------
// Threading mode
// ---------------------------------------------------------------------------

/// How the three agents map onto OS threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadingMode {
    /// One thread per agent.
    Dedicated,
    /// Conductor on its own thread; sender + receiver share one.
    SharedNetwork,
    /// All three agents on one thread.
    Shared,
    /// No threads: the host application drives `do_work` itself.
    Invoker,
}

impl ThreadingMode {
    pub fn parse(value: &str) -> Result<Self, DriverError> {
        match value {
            "dedicated" => Ok(ThreadingMode::Dedicated),
            "shared-network" => Ok(ThreadingMode::SharedNetwork),
            "shared" => Ok(ThreadingMode::Shared),
            "invoker" => Ok(ThreadingMode::Invoker),
            other => Err(DriverError::Configuration(format!(
                "unknown threading mode '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Resolved driver configuration.
#[derive(Debug, Clone, Serialize)]
pub struct DriverConfig {
    /// Per-instance directory holding cnc.dat and the log buffer files.
    pub dir: PathBuf,
    /// Delete and recreate the directory at startup if present but dead.
    pub dir_delete_on_start: bool,
    pub threading_mode: ThreadingMode,

    // Buffer sizing
    pub to_driver_buffer_length: usize,
    pub to_clients_buffer_length: usize,
    pub counters_values_buffer_length: usize,
    pub error_buffer_length: usize,
    pub loss_report_buffer_length: usize,
    pub file_page_size: usize,
    pub term_buffer_length: usize,
    pub ipc_term_buffer_length: usize,
    pub mtu_length: usize,
    pub initial_window_length: usize,
    pub socket_sndbuf: usize,
    pub socket_rcvbuf: usize,
    pub socket_multicast_ttl: u32,

    // Timeouts (nanoseconds unless named otherwise)
    pub driver_timeout_ms: i64,
    pub client_liveness_timeout_ns: i64,
    pub image_liveness_timeout_ns: i64,
    pub publication_linger_timeout_ns: i64,
    pub publication_unblock_timeout_ns: i64,
    pub publication_connection_timeout_ns: i64,
    pub status_message_timeout_ns: i64,
    pub publication_heartbeat_timeout_ns: i64,
    pub pending_setups_timeout_ns: i64,
    pub counter_free_to_reuse_timeout_ns: i64,
    pub timer_interval_ns: i64,
    pub re_resolution_check_interval_ns: i64,
    pub untethered_window_limit_timeout_ns: i64,
    pub untethered_linger_timeout_ns: i64,
    pub untethered_resting_timeout_ns: i64,
    pub conductor_cycle_threshold_ns: i64,

    // Loss recovery
    pub nak_unicast_delay_ns: i64,
    pub nak_unicast_retry_delay_ns: i64,
    pub nak_multicast_max_backoff_ns: i64,
    pub retransmit_unicast_delay_ns: i64,
    pub retransmit_unicast_linger_ns: i64,
    pub retransmit_receiver_window_multiple: usize,
    pub max_resend: usize,

    // Behavior flags
    pub spies_simulate_connection: bool,
    pub reliable_stream: bool,
    pub tether_subscriptions: bool,
    pub rejoin_stream: bool,
    pub sparse_files: bool,
    pub print_configuration: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            dir: default_dir(),
            dir_delete_on_start: false,
            threading_mode: ThreadingMode::Dedicated,

            to_driver_buffer_length: 1024 * 1024 + cn_concurrent::ring_buffer::TRAILER_LENGTH,
            to_clients_buffer_length: 1024 * 1024 + cn_concurrent::broadcast::TRAILER_LENGTH,
            counters_values_buffer_length: 1024 * 1024,
            error_buffer_length: 1024 * 1024,
            loss_report_buffer_length: 1024 * 1024,
            file_page_size: 4096,
            term_buffer_length: 4 * 1024 * 1024,
            ipc_term_buffer_length: 4 * 1024 * 1024,
            mtu_length: 1408,
            initial_window_length: 128 * 1024,
            socket_sndbuf: 0,
            socket_rcvbuf: 0,
            socket_multicast_ttl: 0,

            driver_timeout_ms: 10_000,
            client_liveness_timeout_ns: 10_000_000_000,
            image_liveness_timeout_ns: 10_000_000_000,
            publication_linger_timeout_ns: 5_000_000_000,
            publication_unblock_timeout_ns: 15_000_000_000,
            publication_connection_timeout_ns: 5_000_000_000,
            status_message_timeout_ns: 200_000_000,
            publication_heartbeat_timeout_ns: 100_000_000,
            pending_setups_timeout_ns: 1_000_000_000,
            counter_free_to_reuse_timeout_ns: 1_000_000_000,
            timer_interval_ns: 1_000_000_000,
            re_resolution_check_interval_ns: 1_000_000_000,
            untethered_window_limit_timeout_ns: 5_000_000_000,
            untethered_linger_timeout_ns: 5_000_000_000,
            untethered_resting_timeout_ns: 10_000_000_000,
            conductor_cycle_threshold_ns: 1_000_000_000,

            nak_unicast_delay_ns: 60_000_000,
            nak_unicast_retry_delay_ns: 60_000_000,
            nak_multicast_max_backoff_ns: 60_000_000,
            retransmit_unicast_delay_ns: 0,
            retransmit_unicast_linger_ns: 10_000_000,
            retransmit_receiver_window_multiple: 4,
            max_resend: 16,

            spies_simulate_connection: false,
            reliable_stream: true,
            tether_subscriptions: true,
            rejoin_stream: true,
            sparse_files: true,
            print_configuration: false,
        }
    }
}

fn default_dir() -> PathBuf {
    std::env::temp_dir().join("conduit")
}

impl DriverConfig {
    /// Term window length governing how far a publisher may run ahead of
    /// consumption; at most half a term.
    pub fn publication_term_window_length(&self, term_length: usize) -> usize {
        term_length / 2
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), DriverError> {
        cn_logbuffer::check_term_length(self.term_buffer_length)
            .map_err(|e| DriverError::Configuration(e.to_string()))?;
        cn_logbuffer::check_term_length(self.ipc_term_buffer_length)
            .map_err(|e| DriverError::Configuration(e.to_string()))?;
        cn_logbuffer::check_page_size(self.file_page_size)
            .map_err(|e| DriverError::Configuration(e.to_string()))?;

        let min_mtu = cn_protocol::frame::DATA_HEADER_LENGTH + cn_protocol::frame::FRAME_ALIGNMENT;
        if self.mtu_length < min_mtu || self.mtu_length > 65_504 {
            return Err(DriverError::Configuration(format!(
                "mtu_length {} outside [{min_mtu}, 65504]",
                self.mtu_length
            )));
        }
        if self.mtu_length % cn_protocol::frame::FRAME_ALIGNMENT != 0 {
            return Err(DriverError::Configuration(format!(
                "mtu_length {} must be a multiple of {}",
                self.mtu_length,
                cn_protocol::frame::FRAME_ALIGNMENT
            )));
        }
        if self.initial_window_length > self.term_buffer_length / 2 {
            return Err(DriverError::Configuration(format!(
                "initial_window_length {} exceeds half the term length {}",
                self.initial_window_length, self.term_buffer_length
            )));
        }
        if !cn_concurrent::is_power_of_two(
            self.to_driver_buffer_length - cn_concurrent::ring_buffer::TRAILER_LENGTH,
        ) {
            return Err(DriverError::Configuration(
                "to_driver_buffer_length must be a power of two plus the ring trailer".to_owned(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw TOML layer
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    dir: Option<String>,
    dir_delete_on_start: Option<bool>,
    threading_mode: Option<String>,
    term_buffer_length: Option<String>,
    ipc_term_buffer_length: Option<String>,
    mtu_length: Option<String>,
    initial_window_length: Option<String>,
    socket_sndbuf: Option<String>,
    socket_rcvbuf: Option<String>,
    socket_multicast_ttl: Option<u32>,
    driver_timeout_ms: Option<i64>,
    client_liveness_timeout: Option<String>,
    image_liveness_timeout: Option<String>,
    publication_linger_timeout: Option<String>,
    publication_unblock_timeout: Option<String>,
    status_message_timeout: Option<String>,
    timer_interval: Option<String>,
    nak_unicast_delay: Option<String>,
    nak_unicast_retry_delay: Option<String>,
    nak_multicast_max_backoff: Option<String>,
    retransmit_unicast_delay: Option<String>,
    retransmit_unicast_linger: Option<String>,
    retransmit_receiver_window_multiple: Option<usize>,
    max_resend: Option<usize>,
    untethered_window_limit_timeout: Option<String>,
    untethered_linger_timeout: Option<String>,
    untethered_resting_timeout: Option<String>,
    spies_simulate_connection: Option<bool>,
    sparse_files: Option<bool>,
    print_configuration: Option<bool>,
}

/// Load configuration: defaults, then the TOML file (if given), then
/// `CONDUIT_*` environment variables.
pub fn load_config(toml_path: Option<&std::path::Path>) -> Result<DriverConfig, DriverError> {
    let mut config = DriverConfig::default();

    let raw = match toml_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                DriverError::Configuration(format!("reading config file '{}': {e}", path.display()))
            })?;
            toml::from_str::<RawConfig>(&text)
                .map_err(|e| DriverError::Configuration(format!("parsing config: {e}")))?
        }
        None => RawConfig::default(),
    };
    apply_raw(&mut config, &raw)?;
    apply_env(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_raw(config: &mut DriverConfig, raw: &RawConfig) -> Result<(), DriverError> {
    if let Some(dir) = &raw.dir {
        config.dir = PathBuf::from(dir);
    }
    if let Some(v) = raw.dir_delete_on_start {
        config.dir_delete_on_start = v;
    }
    if let Some(mode) = &raw.threading_mode {
        config.threading_mode = ThreadingMode::parse(mode)?;
    }
    if let Some(v) = &raw.term_buffer_length {
        config.term_buffer_length = parse_size("term_buffer_length", v)?;
    }
    if let Some(v) = &raw.ipc_term_buffer_length {
        config.ipc_term_buffer_length = parse_size("ipc_term_buffer_length", v)?;
    }
    if let Some(v) = &raw.mtu_length {
        config.mtu_length = parse_size("mtu_length", v)?;
    }
    if let Some(v) = &raw.initial_window_length {
        config.initial_window_length = parse_size("initial_window_length", v)?;
    }
    if let Some(v) = &raw.socket_sndbuf {
        config.socket_sndbuf = parse_size("socket_sndbuf", v)?;
    }
    if let Some(v) = &raw.socket_rcvbuf {
        config.socket_rcvbuf = parse_size("socket_rcvbuf", v)?;
    }
    if let Some(v) = raw.socket_multicast_ttl {
        config.socket_multicast_ttl = v;
    }
    if let Some(v) = raw.driver_timeout_ms {
        config.driver_timeout_ms = v;
    }
    if let Some(v) = &raw.client_liveness_timeout {
        config.client_liveness_timeout_ns = parse_duration("client_liveness_timeout", v)?;
    }
    if let Some(v) = &raw.image_liveness_timeout {
        config.image_liveness_timeout_ns = parse_duration("image_liveness_timeout", v)?;
    }
    if let Some(v) = &raw.publication_linger_timeout {
        config.publication_linger_timeout_ns = parse_duration("publication_linger_timeout", v)?;
    }
    if let Some(v) = &raw.publication_unblock_timeout {
        config.publication_unblock_timeout_ns = parse_duration("publication_unblock_timeout", v)?;
    }
    if let Some(v) = &raw.status_message_timeout {
        config.status_message_timeout_ns = parse_duration("status_message_timeout", v)?;
    }
    if let Some(v) = &raw.timer_interval {
        config.timer_interval_ns = parse_duration("timer_interval", v)?;
    }
    if let Some(v) = &raw.nak_unicast_delay {
        config.nak_unicast_delay_ns = parse_duration("nak_unicast_delay", v)?;
    }
    if let Some(v) = &raw.nak_unicast_retry_delay {
        config.nak_unicast_retry_delay_ns = parse_duration("nak_unicast_retry_delay", v)?;
    }
    if let Some(v) = &raw.nak_multicast_max_backoff {
        config.nak_multicast_max_backoff_ns = parse_duration("nak_multicast_max_backoff", v)?;
    }
    if let Some(v) = &raw.retransmit_unicast_delay {
        config.retransmit_unicast_delay_ns = parse_duration("retransmit_unicast_delay", v)?;
    }
    if let Some(v) = &raw.retransmit_unicast_linger {
        config.retransmit_unicast_linger_ns = parse_duration("retransmit_unicast_linger", v)?;
    }
    if let Some(v) = raw.retransmit_receiver_window_multiple {
        config.retransmit_receiver_window_multiple = v;
    }
    if let Some(v) = raw.max_resend {
        config.max_resend = v;
    }
    if let Some(v) = &raw.untethered_window_limit_timeout {
        config.untethered_window_limit_timeout_ns =
            parse_duration("untethered_window_limit_timeout", v)?;
    }
    if let Some(v) = &raw.untethered_linger_timeout {
        config.untethered_linger_timeout_ns = parse_duration("untethered_linger_timeout", v)?;
    }
    if let Some(v) = &raw.untethered_resting_timeout {
        config.untethered_resting_timeout_ns = parse_duration("untethered_resting_timeout", v)?;
    }
    if let Some(v) = raw.spies_simulate_connection {
        config.spies_simulate_connection = v;
    }
    if let Some(v) = raw.sparse_files {
        config.sparse_files = v;
    }
    if let Some(v) = raw.print_configuration {
        config.print_configuration = v;
    }
    Ok(())
}

/// Apply `CONDUIT_*` environment variables over the current config.
fn apply_env(config: &mut DriverConfig) -> Result<(), DriverError> {
    if let Ok(dir) = std::env::var("CONDUIT_DIR") {
        config.dir = PathBuf::from(dir);
    }
    if let Ok(v) = std::env::var("CONDUIT_THREADING_MODE") {
        config.threading_mode = ThreadingMode::parse(&v)?;
    }
    if let Ok(v) = std::env::var("CONDUIT_TERM_BUFFER_LENGTH") {
        config.term_buffer_length = parse_size("CONDUIT_TERM_BUFFER_LENGTH", &v)?;
    }
    if let Ok(v) = std::env::var("CONDUIT_MTU_LENGTH") {
        config.mtu_length = parse_size("CONDUIT_MTU_LENGTH", &v)?;
    }
    if let Ok(v) = std::env::var("CONDUIT_DRIVER_TIMEOUT_MS") {
        config.driver_timeout_ms = v
            .parse()
            .map_err(|_| DriverError::Configuration(format!("CONDUIT_DRIVER_TIMEOUT_MS: {v}")))?;
    }
    if let Ok(v) = std::env::var("CONDUIT_CLIENT_LIVENESS_TIMEOUT") {
        config.client_liveness_timeout_ns = parse_duration("CONDUIT_CLIENT_LIVENESS_TIMEOUT", &v)?;
    }
    if let Ok(v) = std::env::var("CONDUIT_PRINT_CONFIGURATION") {
        config.print_configuration = v == "true";
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

fn parse_size(key: &str, value: &str) -> Result<usize, DriverError> {
    let invalid = || DriverError::Configuration(format!("invalid size for {key}: '{value}'"));
    let (digits, multiplier) = match value.as_bytes().last().ok_or_else(invalid)? {
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<usize>()
        .map(|v| v * multiplier)
        .map_err(|_| invalid())
}

fn parse_duration(key: &str, value: &str) -> Result<i64, DriverError> {
    let invalid = || DriverError::Configuration(format!("invalid duration for {key}: '{value}'"));
    let (digits, multiplier) = if let Some(d) = value.strip_suffix("ms") {
        (d, 1_000_000)
    } else if let Some(d) = value.strip_suffix("us") {
        (d, 1_000)
    } else if let Some(d) = value.strip_suffix("ns") {
        (d, 1)
    } else if let Some(d) = value.strip_suffix('s') {
        (d, 1_000_000_000)
    } else {
        (value, 1)
    };
    digits
        .parse::<i64>()
        .map(|v| v * multiplier)
        .map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        std::fs::write(
            &path,
            "term_buffer_length = \"64k\"\nthreading_mode = \"shared\"\nnak_unicast_delay = \"5ms\"\ninitial_window_length = \"32k\"\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.term_buffer_length, 64 * 1024);
        assert_eq!(config.threading_mode, ThreadingMode::Shared);
        assert_eq!(config.nak_unicast_delay_ns, 5_000_000);
    }

    #[test]
    fn rejects_oversized_window() {
        let config = DriverConfig {
            term_buffer_length: 64 * 1024,
            initial_window_length: 48 * 1024,
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unaligned_mtu() {
        let config = DriverConfig {
            mtu_length: 1400,
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn threading_mode_names() {
        assert_eq!(
            ThreadingMode::parse("shared-network").unwrap(),
            ThreadingMode::SharedNetwork
        );
        assert!(ThreadingMode::parse("turbo").is_err());
    }
}
