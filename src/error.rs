use thiserror::Error;

/// Failures raised by an image store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("can't decode stored record {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },
    #[error("can't encode record {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
}

/// Failures raised by the cluster adapter.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no such service: {0}")]
    NoSuchService(String),
    #[error("no such image: {0}")]
    NoSuchImage(String),
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("no such node: {0}")]
    NoSuchNode(String),
    #[error("timeout after {0:?} without output")]
    Inactivity(std::time::Duration),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no images available for app {0:?}")]
    NoImages(String),
    #[error("invalid procfile")]
    InvalidProcfile,
    #[error("{0}")]
    InvalidProcess(String),
    #[error("App {0} image not found")]
    ImageNotFound(String),
    #[error("Invalid version: {0}")]
    InvalidVersion(String),
    #[error("no valid files found")]
    NoValidFiles,
    #[error("archive file is empty")]
    EmptyArchive,
    #[error("deploy canceled by user action")]
    DeployCanceled,
    #[error("No actions to execute.")]
    PipelineNoActions,
    #[error("Exit status {0}")]
    ExitStatus(i64),
    #[error("error in push image {image}: {source}")]
    PushExhausted {
        image: String,
        source: ClusterError,
    },
    #[error("invalid task state for service {service:?}: {status}")]
    InvalidTaskState { service: String, status: String },
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("no cluster managers available")]
    NoManagers,
    #[error("cannot have less than 0 units")]
    InvalidUnits,
    #[error("Too many ports. You should especify which one you want to.")]
    TooManyPorts,
    #[error("{0}")]
    InvalidUnitChange(&'static str),
    #[error("deploy {0} is already in progress")]
    EventInProgress(uuid::Uuid),
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        source: Box<Error>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True when the failure was a user cancellation, wherever it was raised.
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::DeployCanceled => true,
            Error::Stage { source, .. } => source.is_canceled(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NoImages(_) | Error::ImageNotFound(_) | Error::InvalidVersion(_) => true,
            Error::Cluster(
                ClusterError::NoSuchService(_)
                | ClusterError::NoSuchImage(_)
                | ClusterError::NoSuchContainer(_)
                | ClusterError::NoSuchNode(_),
            ) => true,
            Error::Stage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_invalid_input(&self) -> bool {
        match self {
            Error::InvalidProcfile
            | Error::InvalidProcess(_)
            | Error::NoValidFiles
            | Error::EmptyArchive
            | Error::InvalidUnits
            | Error::TooManyPorts
            | Error::InvalidUnitChange(_)
            | Error::EventInProgress(_) => true,
            Error::Stage { source, .. } => source.is_invalid_input(),
            _ => false,
        }
    }

    /// The error without its stage tag.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Tags the error with the deploy stage it happened in.
    pub fn at(self, stage: &'static str) -> Error {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
