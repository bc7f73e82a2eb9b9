//! Debug assertion macros for span pipeline invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so release builds
//! pay nothing for them.

// =============================================================================
// Span identity
// =============================================================================

/// Assert that a freshly generated span id is usable.
///
/// **Invariant**: `span_id != 0` (zero is reserved for "no parent")
///
/// Used in: `Span::new()`
macro_rules! debug_assert_span_id_nonzero {
    ($span_id:expr) => {
        debug_assert!($span_id != 0, "span id must never be zero")
    };
}

// =============================================================================
// State machine
// =============================================================================

/// Assert that a state transition moves forward.
///
/// **Invariant**: terminal states (`DISCARDED`, `PROCESSED`) are never left.
///
/// Used in: `Span::transition()` after a successful CAS
macro_rules! debug_assert_not_terminal {
    ($from:expr) => {
        debug_assert!(
            !$from.is_terminal(),
            "transition out of terminal state {:?}",
            $from
        )
    };
}

// =============================================================================
// Conditions
// =============================================================================

/// Assert that a blocked span still has at least one pending condition.
///
/// **Invariant**: a `*_BLOCKED` state implies a non-empty condition set while
/// the span's monitor is held.
///
/// Used in: `Span::release_condition()`
macro_rules! debug_assert_blocked_has_conditions {
    ($state:expr, $pending:expr) => {
        debug_assert!(
            !$state.is_blocked() || $pending > 0,
            "span in {:?} with no pending conditions",
            $state
        )
    };
}

pub(crate) use debug_assert_blocked_has_conditions;
pub(crate) use debug_assert_not_terminal;
pub(crate) use debug_assert_span_id_nonzero;
