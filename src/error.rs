//! Error taxonomy for the change request engine
//!
//! Everything here is unrecoverable for the operation that raised it and
//! propagates to the caller; only `record_decisions` batches failures up
//! into a single [`ChangeError::DecisionBatch`].

#[derive(thiserror::Error, Debug)]
pub enum ChangeError {
    #[error("missing required argument: {0}")]
    MissingArgument(String),
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),
    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),
    #[error("no instance found for id {0}")]
    MissingInstance(String),
    #[error("bad wire format for {0}")]
    InvalidWireFormat(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("malformed stored value: {0}")]
    Conversion(String),
    #[error("a decision was already recorded for element {0}")]
    DecisionAlreadySet(String),
    #[error("element {0} does not permit an externally supplied decision")]
    DecisionNotPermitted(String),
    #[error("request {0} still has undecided elements")]
    IncompleteDecision(String),
    #[error("{failed} of {total} decision(s) could not be recorded")]
    DecisionBatch { failed: usize, total: usize },
}

impl ChangeError {
    pub fn missing(argument: &str) -> Self {
        Self::MissingArgument(argument.to_string())
    }
}
