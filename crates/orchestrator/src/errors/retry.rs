/// Classification for how the orchestrator reacts to an error.
///
/// # Behavior Summary
///
/// | Class | Record Circuit/Health Failure? | Raised by |
/// |-------|--------------------------------|-----------|
/// | `FailoverWithPenalty` | Yes | fetchers, validation |
/// | `NextSource` | No | admission checks |
/// | `Never` | No | the orchestrator itself |
///
/// Whatever the class, an error from one source never stops the traversal.
/// A fetcher that returns a `NextSource` or `Never` error is moved past
/// without penalty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// The source produced a real failure (network, timeout, rate limit,
    /// unusable or implausible payload).
    ///
    /// The failure counts against the source's circuit and health record, so
    /// repeated failures eventually exclude it from the chain.
    FailoverWithPenalty,

    /// The source was not called (circuit open, health skip). Move on
    /// without recording anything; the skip reason is already in the trace.
    NextSource,

    /// The whole fetch is over: exhaustion, cancellation, missing sources or
    /// a registry misuse.
    Never,
}

impl RetryClass {
    /// Whether the error should be recorded against the source.
    pub fn penalizes(self) -> bool {
        matches!(self, Self::FailoverWithPenalty)
    }
}
