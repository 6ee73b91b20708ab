use thiserror::Error;

/// Error type of the remote store client. The cache never inspects it, only carries it.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The remote store failed to serve a request. Usually transient: network failures, throttling, timeouts.
    #[error("remote store failed on table '{table}': {source}")]
    Remote {
        table:  String,
        #[source]
        source: StoreError,
    },

    /// The cancellation token was signalled while the operation was waiting on I/O or a backoff.
    #[error("operation cancelled")]
    Cancelled,

    #[error("remote table '{0}' does not exist")]
    TableMissing(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] fieldx::error::FieldXError),

    /// A retention policy with a non-positive duration or a zero item limit.
    #[error("invalid retention policy: {0}")]
    InvalidPolicy(#[from] garde::Report),

    #[error("background updater panicked: {0}")]
    UpdaterPanicked(#[from] tokio::task::JoinError),
}

impl CacheError {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
