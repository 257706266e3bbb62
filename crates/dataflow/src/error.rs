use crate::Cid;
use std::sync::Arc;

/// FlowErr is an error value carried by a collection key.
/// It flows through the graph like any other value: a downstream operator
/// reading an errored key propagates the error into its own output, and
/// clients observe it in their diff stream.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowErr {
    /// An operator failed for this key.
    #[error("operator failed: {0}")]
    User(Arc<str>),
    /// A lazy computation re-entered itself at this key.
    #[error("lazy computation depends on itself at key {0}")]
    Cycle(Arc<str>),
    /// The adapter backing an external collection reported an error.
    #[error("external resource failed: {message}")]
    Adapter {
        message: Arc<str>,
        retryable: bool,
    },
    /// An operator or adapter broke an engine contract.
    #[error("contract violation: {0}")]
    Contract(Arc<str>),
}

impl FlowErr {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into().into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract(message.into().into())
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::Adapter { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// OpError is the failure surface of user operator code.
#[derive(thiserror::Error, Debug)]
pub enum OpError {
    /// The operator itself failed; surfaced as a UserError value.
    #[error("{0}")]
    Fail(String),
    /// An input consulted by the operator holds an error value,
    /// which the operator must pass along.
    #[error(transparent)]
    Upstream(FlowErr),
    /// A consulted key is backed by a pending external subscription.
    /// The invocation is parked and re-run on the next adapter update.
    #[error("read is blocked on a pending external resource")]
    Blocked,
}

impl OpError {
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

/// BuildError rejects an ill-formed graph at construction time.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error("unknown collection {0:?}")]
    UnknownCollection(Cid),
    #[error("lazy collection {0:?} cannot be the {1} input of an eager node")]
    LazyInput(Cid, &'static str),
    #[error("take requires a positive limit")]
    ZeroTake,
    #[error("merge requires at least one input")]
    EmptyMerge,
}
