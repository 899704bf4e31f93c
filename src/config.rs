//! Configuration (spec §6.3 plus the ambient keys this crate's bootstrap
//! needs). Parsed from CLI flags, environment variables, and optionally a
//! `.env` file, in the style of the donor's `clap::Parser` config structs.

use std::path::PathBuf;

use clap::Parser;

/// Command-line options for the transparency log service.
#[derive(Parser, Debug, Clone)]
#[command(name = "transparency-log", about = "Tile-based transparency log service")]
pub struct Config {
    /// Origin string stamped into every checkpoint payload.
    #[arg(long, env = "TLOG_ORIGIN")]
    pub origin: String,

    /// Path to the ES256 signing key used for checkpoints and receipts: a
    /// raw 32-byte scalar, or that scalar hex-encoded as text.
    #[arg(long, env = "TLOG_SERVICE_KEY_PATH")]
    pub service_key_path: PathBuf,

    /// Upper bound on accepted COSE Sign1 statement size, in bytes.
    #[arg(long, env = "TLOG_MAX_STATEMENT_BYTES", default_value_t = 1024 * 1024)]
    pub max_statement_bytes: usize,

    /// Timeout, in milliseconds, for acquiring the in-process append mutex.
    #[arg(long, env = "TLOG_APPEND_MUTEX_TIMEOUT_MS", default_value_t = 5_000)]
    pub append_mutex_timeout_ms: u64,

    /// Size of the admission-control semaphore bounding concurrent
    /// registrations.
    #[arg(long, env = "TLOG_REGISTRATION_CONCURRENCY", default_value_t = 128)]
    pub registration_concurrency: usize,

    /// Prefix prepended to all `BlobStore` keys (multi-tenant single-store).
    #[arg(long, env = "TLOG_STORAGE_PREFIX", default_value = "")]
    pub storage_prefix: String,

    /// Socket address the HTTP surface binds to.
    #[arg(long, env = "TLOG_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Socket address the Prometheus exporter binds to.
    #[arg(long, env = "TLOG_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,

    /// Filesystem root for the `BlobStore`.
    #[arg(long, env = "TLOG_BLOB_STORE_PATH", default_value = "./data/blobs")]
    pub blob_store_path: PathBuf,

    /// `sqlx` connection URL for the `MetaStore`.
    #[arg(long, env = "TLOG_META_STORE_URL", default_value = "sqlite://./data/meta.sqlite3")]
    pub meta_store_url: String,

    /// `tracing_subscriber::EnvFilter` directive string. Falls back to
    /// `RUST_LOG` via the filter's own env lookup if unset.
    #[arg(long, env = "TLOG_LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}

impl Config {
    /// Parse from `std::env::args()`, first hydrating process environment
    /// variables from an optional `.env` file so `env` attrs above see them.
    pub fn load() -> eyre::Result<Self> {
        if let Ok(vars) = env_file_reader::read_file(".env") {
            for (key, value) in vars {
                if std::env::var(&key).is_err() {
                    std::env::set_var(key, value);
                }
            }
        }
        Ok(Config::parse())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_flags() {
        let config = Config::parse_from([
            "transparency-log",
            "--origin",
            "example-log",
            "--service-key-path",
            "/tmp/key.der",
        ]);
        assert_eq!(config.origin, "example-log");
        assert_eq!(config.max_statement_bytes, 1024 * 1024);
        assert_eq!(config.registration_concurrency, 128);
    }
}
