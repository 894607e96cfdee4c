use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Transport failures and timeouts are handled inline by the failover and
/// replication layers; the variants here surface everything that is not a
/// per-stage decision.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("mDNS daemon error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("value codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
