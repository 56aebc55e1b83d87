//! Error types for the funnel service.

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Concurrent update on {key}: record version changed")]
    Conflict { key: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel gateway errors. All of them are treated as transient by the core.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send {kind} on channel {name}: {reason}")]
    SendFailed {
        name: String,
        kind: String,
        reason: String,
    },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error on channel {name}: {reason}")]
    Http { name: String, reason: String },
}

/// Processing failures scoped to a single inbound event or contact.
#[derive(Debug, thiserror::Error)]
pub enum FunnelError {
    #[error("Contact {address} could not be loaded or created: {source}")]
    ContactUnavailable {
        address: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Contact {address} was modified concurrently; giving up after retry")]
    ConcurrentUpdate { address: String },

    #[error("Referral code for {address} collided twice (last tried {code})")]
    ReferralCollision { address: String, code: String },

    #[error("Malformed inbound event: {0}")]
    MalformedEvent(String),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}
