//! Configuration surface (spec §6.3).
//!
//! The embedding application assembles a `Config` and hands it to
//! `RpcServer`/`RpcClient`; this crate does not read config files or
//! environment variables itself — callers pass a bare socket path or
//! host:port and build the rest up from there.

use std::time::Duration;

/// Which value codec to use on the wire. Only `Clone` (JSON +
/// structured-clone pre/post-processing) ships with this crate; `Bson`
/// and `Fron` are named so embedding applications can match on a stable
/// set of variants once they bring their own `ValueCodec` impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    #[default]
    Clone,
    Json,
    Bson,
    Fron,
}

/// An endpoint a server binds or a client dials.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// `rpc://<host>:<port>`
    Tcp { host: String, port: u16 },
    /// `ipc://<path>` (Unix domain socket)
    Ipc { path: String },
}

impl Endpoint {
    /// The endpoint's DSN, used as the default server id (spec GLOSSARY).
    pub fn dsn(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("rpc://{host}:{port}"),
            Endpoint::Ipc { path } => format!("ipc://{path}"),
        }
    }
}

/// Shared server/client configuration (spec §6.3).
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Endpoint,
    /// Pre-shared secret. Empty string disables authentication.
    pub secret: String,
    /// Published id; defaults to the endpoint's DSN if not set.
    pub id: Option<String>,
    pub timeout: Duration,
    pub ping_interval: Duration,
    pub codec: CodecKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                host: "0.0.0.0".to_string(),
                port: 9000,
            },
            secret: String::new(),
            id: None,
            timeout: Duration::from_millis(5000),
            ping_interval: Duration::from_millis(5000),
            codec: CodecKind::default(),
        }
    }
}

impl Config {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port,
            },
            ..Default::default()
        }
    }

    pub fn ipc(path: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Ipc { path: path.into() },
            ..Default::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Published id, falling back to the endpoint DSN (spec GLOSSARY).
    pub fn published_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.endpoint.dsn())
    }
}

/// Render a `Duration` the way a timeout error message humanizes it
/// (spec §4.5 "the humanized duration").
pub fn humanize(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_formats_match_spec_addressing() {
        assert_eq!(
            Endpoint::Tcp { host: "localhost".into(), port: 9000 }.dsn(),
            "rpc://localhost:9000"
        );
        assert_eq!(
            Endpoint::Ipc { path: "/tmp/x.sock".into() }.dsn(),
            "ipc:///tmp/x.sock"
        );
    }

    #[test]
    fn published_id_falls_back_to_dsn() {
        let cfg = Config::tcp("localhost", 9001);
        assert_eq!(cfg.published_id(), "rpc://localhost:9001");
        let cfg = cfg.with_id("custom-id");
        assert_eq!(cfg.published_id(), "custom-id");
    }

    #[test]
    fn humanize_switches_units_at_one_second() {
        assert_eq!(humanize(Duration::from_millis(500)), "500ms");
        assert_eq!(humanize(Duration::from_millis(1500)), "1.5s");
    }
}
