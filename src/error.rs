use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("invalid arguments: {0}")]
    Validation(String),

    #[error("{}", timeout_message(.target, .diagnostic, .cause))]
    ConvergenceTimeout {
        target: String,
        diagnostic: Option<String>,
        cause: StopCause,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Why a polling loop stopped before its condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Deadline,
    Cancelled,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Deadline => write!(f, "timed out"),
            StopCause::Cancelled => write!(f, "cancelled"),
        }
    }
}

fn timeout_message(target: &str, diagnostic: &Option<String>, cause: &StopCause) -> String {
    match diagnostic {
        Some(message) => message.clone(),
        None => format!("{} waiting for {}", cause, target),
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("catalog {0:?} is not serving")]
    NotServing(String),

    #[error("catalog {0:?} has no content URL")]
    NoContentUrl(String),

    #[error("invalid content URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to resolve a backend for service {service}: {reason}")]
    Resolve { service: String, reason: String },

    #[error("failed to establish tunnel: {0}")]
    TunnelSetup(String),

    #[error("unexpected HTTP status {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("content fetch cancelled")]
    Cancelled,
}

/// Every independent failure of a bulk operation, in target order.
#[derive(Debug, Default)]
pub struct AggregateError(pub Vec<Error>);

impl AggregateError {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl Error {
    /// Collects errors into an aggregate; no errors means success.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Result<()> {
        let errors: Vec<Error> = errors.into_iter().collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(AggregateError(errors)))
        }
    }

    /// Reports a cleanup failure alongside the error that triggered the cleanup.
    pub fn with_cleanup(self, cleanup: Result<()>) -> Error {
        match cleanup {
            Ok(()) => self,
            Err(Error::Aggregate(AggregateError(mut errors))) => {
                errors.insert(0, self);
                Error::Aggregate(AggregateError(errors))
            }
            Err(other) => Error::Aggregate(AggregateError(vec![self, other])),
        }
    }

    pub(crate) fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => Error::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            other => Error::Kube(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
