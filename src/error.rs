use std::fmt;
use std::fmt::Debug;

use thiserror::Error as ThisError;

use crate::store::ObjectId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate that could not be classified
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },
    #[error("{0} not found")]
    NotFound(ObjectId),
    #[error("{0} already exists")]
    AlreadyExists(ObjectId),
    #[error("{0} has been modified, resourceVersion is stale")]
    Conflict(ObjectId),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("{0}")]
    UserInput(String),
    #[error("Unnamed k8s object")]
    UnnamedObject,
    #[error("Failed to (de)serialize object: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Finalizer(#[from] FinalizerError),
    #[error(transparent)]
    Targets(#[from] TargetErrors),
    #[error("Unknown target cluster '{0}'")]
    UnknownTarget(String),
    #[error("RwLock poisoned: {0}")]
    RwLockPoisoned(String),
    #[error("Failed to emit event: {0}")]
    EmitEventFailed(String),
    #[error("Reconciliation was cancelled")]
    Cancelled,

    /// Can be used by controller implementors to return their errors
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(ThisError, Debug)]
pub enum FinalizerError {
    #[error("Failed to clean up object before removing finalizer {finalizer}: {source}")]
    CleanupFailed {
        finalizer: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Failed to add finalizer: {0}")]
    Add(#[source] Box<Error>),
    #[error("Failed to remove finalizer: {0}")]
    Remove(#[source] Box<Error>),
    #[error("Invalid finalizer")]
    InvalidFinalizer,
}

/// Errors collected while working on several target clusters, keyed by target identity.
#[derive(Debug, Default)]
pub struct TargetErrors(Vec<(String, Error)>);

impl TargetErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: impl Into<String>, error: Error) {
        self.0.push((target.into(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(target, _)| target.as_str())
    }

    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.0.iter().map(|(_, error)| error)
    }

    /// Returns `Ok(())` when nothing failed, otherwise the aggregate as an [Error].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Targets(self))
        }
    }
}

impl fmt::Display for TargetErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} target(s) failed:", self.0.len())?;
        for (target, error) in &self.0 {
            write!(f, " [{target}: {error}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for TargetErrors {}

impl Error {
    /// Object absent. On `get` this is a steady-state outcome, not a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube { source } => api_code(source) == Some(404),
            _ => false,
        }
    }

    /// Another writer created the object first.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::Kube {
                source: kube::Error::Api(response),
            } => response.code == 409 && response.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Stale resourceVersion on write. Also true for wrapped finalizer errors and for
    /// target aggregates that consist of conflicts only.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube {
                source: kube::Error::Api(response),
            } => response.code == 409 && response.reason != "AlreadyExists",
            Error::Finalizer(FinalizerError::Add(inner) | FinalizerError::Remove(inner)) => inner.is_conflict(),
            Error::Finalizer(FinalizerError::CleanupFailed { source, .. }) => source.is_conflict(),
            Error::Targets(errors) => !errors.is_empty() && errors.errors().all(Error::is_conflict),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Maps a raw `kube::Error` onto the classified variants for the object it concerned.
    pub(crate) fn classify(error: kube::Error, id: ObjectId) -> Self {
        match &error {
            kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
                (404, _) => Error::NotFound(id),
                (409, "AlreadyExists") => Error::AlreadyExists(id),
                (409, _) => Error::Conflict(id),
                (403, _) => Error::Forbidden(response.message.clone()),
                _ => Error::from(error),
            },
            _ => Error::from(error),
        }
    }
}

fn api_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::RwLockPoisoned(e.to_string())
    }
}
