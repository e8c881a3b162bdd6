use thiserror::Error;

/// Caller-recoverable failures raised by graph operations.
///
/// Structural violations (overlapping ranges, broken in-lists, mismatched
/// contexts) are programmer bugs and abort with a panic instead; only
/// resource ceilings and semantic conflicts travel through this enum. When
/// an operation returns an error the graph is left partially constructed
/// but internally consistent, suitable only for discarding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    /// Subset construction exceeded the context's configured state ceiling.
    #[error("state count exceeded the configured limit of {0}")]
    TooManyStates(usize),

    /// Two competing priorities with the same key and equal value met
    /// during a merge. Carries the shared priority key.
    #[error("priority interaction on key {0}")]
    PriorInteraction(i64),

    /// Expanding condition spaces would replicate a cost-marked guard past
    /// its budget. Carries the guard's cost id.
    #[error("condition cost budget exceeded for cost id {0}")]
    CondCostTooHigh(i64),

    /// A repetition construct cannot terminate, or an NFA condensation ran
    /// out of rounds with nondeterminism remaining.
    #[error("repetition cannot be bounded")]
    RepetitionError,

    /// A merged condition space grew past the guard-count density limit.
    #[error("condition space too dense")]
    TransDensity,
}

pub type FsmResult<T> = Result<T, FsmError>;
