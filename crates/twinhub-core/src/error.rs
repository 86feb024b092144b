//! Error taxonomy for the gateway core
//!
//! Every failure surfaces through the same future channel as success;
//! nothing here is retried automatically.

use crate::value::ValueType;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// All failures the core can report.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A model with this namespace/name is already registered
    #[error("model {namespace}/{name} is already registered")]
    DuplicateModel { namespace: String, name: String },

    /// No model with this name is registered
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// A provider with this name already exists
    #[error("provider {0} already exists")]
    DuplicateProvider(String),

    /// No provider with this name exists
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider exists but has no such service
    #[error("unknown service: {provider}/{service}")]
    UnknownService { provider: String, service: String },

    /// The provider exists but the service/resource path does not
    #[error("unknown resource: {provider}/{service}/{resource}")]
    UnknownResource {
        provider: String,
        service: String,
        resource: String,
    },

    /// ACT was used on a non-ACTION resource
    #[error("resource {0} is not an ACTION")]
    NotAnAction(String),

    /// GET/SET was used on an ACTION resource
    #[error("ACTION resource {0} has no value to read or write")]
    NotReadable(String),

    /// The ACTION resource has no registered action handler
    #[error("no action handler registered for {0}")]
    NoActionHandler(String),

    /// Action arguments do not match the schema's argument list
    #[error("invalid action arguments: {0}")]
    InvalidArguments(String),

    /// A written value does not conform to the resource's declared type
    #[error("value of type {actual} does not conform to declared type {expected}")]
    TypeMismatch {
        expected: ValueType,
        actual: &'static str,
    },

    /// A command was executed a second time
    #[error("command {0} was already executed")]
    Reuse(Uuid),

    /// A write carried a timestamp older than the stored one; no state changed
    #[error("write with timestamp {attempted} is older than stored {stored}")]
    StaleWrite {
        stored: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    /// An external getter or action handler failed; the twin is unaffected
    #[error("external call failed: {0}")]
    External(#[from] anyhow::Error),

    /// A command-scoped object was used outside its originating command
    #[error("scoped object used outside its originating command")]
    ConcurrencyMisuse,

    /// The command body panicked on the gateway thread
    #[error("command panicked on the gateway thread")]
    CommandPanicked,

    /// The gateway was shut down before the command could run
    #[error("gateway is shut down")]
    GatewayClosed,
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, GatewayError>;
