use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::ensure;

/// Minimum TLS protocol version the server will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

/// TLS termination settings. Certificate material is validated at startup,
/// before any socket is bound.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PKCS#8 or RSA private key, PEM.
    pub key_path: PathBuf,
    /// CA bundle for client-certificate verification.
    pub ca_path: Option<PathBuf>,
    /// Require and verify a client certificate against `ca_path`.
    pub require_client_cert: bool,
    pub min_version: TlsVersion,
}

impl TlsSettings {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: None,
            require_client_cert: false,
            min_version: TlsVersion::default(),
        }
    }
}

/// HTTP/2 connection caps, mapped onto the framing layer's settings.
#[derive(Debug, Clone)]
pub struct H2Settings {
    pub enabled: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    /// 16 KiB – 16 MiB per RFC 7540 §6.5.2.
    pub max_frame_size: u32,
    /// Server push is not supported for application use; this exists so a
    /// config that asks for it can be rejected loudly.
    pub enable_push: bool,
    /// Extended CONNECT (RFC 8441), required for WebSocket-over-HTTP/2.
    pub enable_connect_protocol: bool,
    pub max_header_list_size: u32,
}

impl Default for H2Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            enable_push: false,
            enable_connect_protocol: true,
            max_header_list_size: 64 * 1024,
        }
    }
}

/// Where access-log lines go.
#[derive(Debug, Clone)]
pub enum AccessLogTarget {
    Stderr,
    File(PathBuf),
}

/// Access logging; `None` on [`ServerConfig::access_log`] disables it.
#[derive(Debug, Clone)]
pub struct AccessLogSettings {
    /// Apache-style format string, compiled once at startup.
    pub format: String,
    pub target: AccessLogTarget,
}

impl Default for AccessLogSettings {
    fn default() -> Self {
        Self {
            format: crate::accesslog::COMMON_FORMAT.to_string(),
            target: AccessLogTarget::Stderr,
        }
    }
}

/// The server's complete configuration surface.
///
/// Every timer whose value is zero is never created, so the idle paths cost
/// nothing when disabled.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub tls: Option<TlsSettings>,
    /// 0 = single-process; ≥ 1 = pre-fork supervisor with that many workers.
    pub workers: u32,
    /// Give each worker its own listening socket via `SO_REUSEPORT` instead
    /// of sharing one inherited socket.
    pub reuseport: bool,
    pub listener_backlog: u32,
    /// Admission cap; beyond it new connections get a synthetic 503.
    pub max_connections: usize,

    /// Idle keep-alive: close if no new request begins within this long
    /// after the previous response. Zero disables.
    pub timeout: Duration,
    /// Stall detector during an active request, reset by any I/O. Zero
    /// disables.
    pub request_timeout: Duration,
    pub ws_idle_timeout: Duration,
    pub sse_idle_timeout: Duration,
    /// Ceiling on the graceful drain; afterwards connections are
    /// force-closed.
    pub shutdown_timeout: Duration,
    /// Worker liveness detector (multi-worker only). Zero disables.
    pub heartbeat_timeout: Duration,
    /// Ceiling on each lifespan phase (startup, shutdown).
    pub lifespan_timeout: Duration,

    /// Per-worker request budget before a graceful recycle. Zero = no limit.
    pub max_requests: u64,

    pub max_header_size: usize,
    pub max_header_count: usize,
    pub max_body_size: u64,
    pub max_ws_frame_size: usize,
    /// Cap on buffered inbound WebSocket messages; overflow closes 1008.
    pub max_receive_queue: usize,

    pub write_high_watermark: usize,
    pub write_low_watermark: usize,
    /// Files at or below this size are read on the event-loop thread; larger
    /// ones stream in 64 KiB chunks through the blocking pool.
    pub sync_file_threshold: u64,

    pub h2: H2Settings,
    pub access_log: Option<AccessLogSettings>,
    /// Development mode: validate application event sequences. Also enabled
    /// by the `PAGI_VALIDATE_EVENTS` environment variable.
    pub validate_events: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            tls: None,
            workers: 0,
            reuseport: false,
            listener_backlog: 1024,
            max_connections: 1000,
            timeout: Duration::from_secs(60),
            request_timeout: Duration::ZERO,
            ws_idle_timeout: Duration::ZERO,
            sse_idle_timeout: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::ZERO,
            lifespan_timeout: Duration::from_secs(10),
            max_requests: 0,
            max_header_size: 64 * 1024,
            max_header_count: 128,
            max_body_size: 64 * 1024 * 1024,
            max_ws_frame_size: 1024 * 1024,
            max_receive_queue: 32,
            write_high_watermark: 64 * 1024,
            write_low_watermark: 8 * 1024,
            sync_file_threshold: 64 * 1024,
            h2: H2Settings::default(),
            access_log: Some(AccessLogSettings::default()),
            validate_events: false,
        }
    }
}

impl ServerConfig {
    /// Reject configurations that cannot work before any socket is bound.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.write_low_watermark <= self.write_high_watermark,
            "write_low_watermark ({}) exceeds write_high_watermark ({})",
            self.write_low_watermark,
            self.write_high_watermark
        );
        ensure!(
            (16_384..=16_777_215).contains(&self.h2.max_frame_size),
            "h2_max_frame_size must be within 16 KiB..16 MiB, got {}",
            self.h2.max_frame_size
        );
        ensure!(
            !self.h2.enable_push,
            "h2_enable_push is not supported: server push is unavailable to applications"
        );
        ensure!(self.max_connections > 0, "max_connections must be nonzero");
        ensure!(
            self.max_receive_queue > 0,
            "max_receive_queue must be nonzero"
        );
        if self.reuseport {
            ensure!(
                self.workers > 0,
                "reuseport only applies to multi-worker mode"
            );
        }
        if let Some(tls) = &self.tls {
            crate::tls::validate_materials(tls)?;
        }
        Ok(())
    }

    /// Whether event validation is on, from config or environment.
    pub fn validate_events(&self) -> bool {
        self.validate_events
            || std::env::var("PAGI_VALIDATE_EVENTS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn inverted_watermarks_are_rejected() {
        let config = ServerConfig {
            write_high_watermark: 1024,
            write_low_watermark: 4096,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn h2_frame_size_bounds_are_enforced() {
        for bad in [0u32, 16_383, 16 * 1024 * 1024] {
            let config = ServerConfig {
                h2: H2Settings {
                    max_frame_size: bad,
                    ..H2Settings::default()
                },
                ..ServerConfig::default()
            };
            assert!(config.validate().is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn push_cannot_be_enabled() {
        let config = ServerConfig {
            h2: H2Settings {
                enable_push: true,
                ..H2Settings::default()
            },
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn reuseport_requires_workers() {
        let config = ServerConfig {
            reuseport: true,
            workers: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
