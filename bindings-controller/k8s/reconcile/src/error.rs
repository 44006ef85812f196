use bindings_controller_core::InvalidSubject;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    MalformedSubject(#[from] InvalidSubject),

    #[error("subject {subject} not found")]
    SubjectMissing { subject: String },

    #[error("failed to patch {resource} {namespace}/{name}: {source}")]
    Patch {
        resource: String,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to encode subject: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl Error {
    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            Self::SubjectMissing { .. } => true,
            Self::Patch { source, .. } | Self::Kube(source) => is_not_found(source),
            _ => false,
        }
    }
}

pub(crate) fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 404)
}
