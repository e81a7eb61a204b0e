use crate::types::WorkerId;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("worker {0} already exists")]
    AlreadyExists(WorkerId),

    #[error("invalid routing policy {given:?}; valid options are {valid}")]
    InvalidPolicy { given: String, valid: &'static str },

    #[error("no workers are registered")]
    NoWorkersAvailable,

    #[error("transport failure contacting worker {worker}: {source}")]
    TransportFailure {
        worker: WorkerId,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed response from worker {worker}: {reason}")]
    MalformedResponse { worker: WorkerId, reason: String },

    #[error(transparent)]
    Tree(#[from] router_tree::TreeError),
}
