//! Actions enqueued on a strand.
//!
//! Spec: "Either a function pointer (callback applied to the strand's
//! current event) or a small tagged code... encoded in the low bits of a
//! pointer so no allocation is needed for common actions." Rust has no
//! tagged-pointer idiom that is both safe and portable, so the tag lives in
//! an explicit enum discriminant instead; the "no allocation for common
//! actions" intent is kept by making the message-dispatch variant a plain
//! value (`PdMessageKind` is `Copy`), reserving the boxed closure variant
//! for genuinely one-off continuations.

use std::sync::Arc;

use crate::guid::Guid;
use crate::message::PdMessageKind;

/// A single action queued on a strand, to be run against the strand's
/// current event when the strand is processed.
#[derive(Clone)]
pub enum Action {
    /// Invoke a policy-domain message handler for this event (the common
    /// case: routing an asynchronous DB-acquire or dependence-satisfy
    /// completion back into the engine).
    Dispatch(PdMessageKind),
    /// A one-off callback, e.g. a test harness hook or a continuation that
    /// doesn't correspond to any PD message type.
    Callback(Arc<dyn Fn(Guid) + Send + Sync>),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Dispatch(kind) => f.debug_tuple("Dispatch").field(kind).finish(),
            Action::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}
