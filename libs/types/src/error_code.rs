//! Application Error Codes
//!
//! Numeric codes carried in the `error` field of response payloads. Zero is
//! success; anything else means the response's business fields are
//! undefined. Codes above `100_000` are runtime-level failures synthesized
//! by the dispatcher rather than produced by handlers.

pub const OK: i32 = 0;

/// Target ActorId does not resolve to a live entity (disposed, or the
/// instance segment is stale). Synthesized by the dispatcher.
pub const ACTOR_NOT_FOUND: i32 = 100_002;

/// The handler for a request failed; the failure was logged on the serving
/// side and converted to this code for the caller.
pub const HANDLER_FAILED: i32 = 100_003;

/// The target fiber is shutting down and rejected the queued request.
pub const FIBER_STOPPED: i32 = 100_004;

/// No handler is registered for the request type.
pub const HANDLER_NOT_FOUND: i32 = 100_005;

pub fn is_runtime_error(code: i32) -> bool {
    code >= 100_000
}
