use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    archive::ArchiveError, config::DescriptorError, integration::IntegrationError,
    post_embed::FrameError,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("step '{step}' failed")]
    OperationFailed {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Error {
        let path = path.into();
        move |source| Error::Io { path, source }
    }

    /// Name of the failed step, if this error came out of an installer or
    /// uninstaller run.
    pub fn failed_step(&self) -> Option<&'static str> {
        match self {
            Error::OperationFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}
