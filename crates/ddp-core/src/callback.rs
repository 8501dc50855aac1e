//! Single-fire completion callbacks.
//!
//! Every caller-supplied completion handler is wrapped in a [`Callback`]
//! latch. The latch is armed once and may be fired once; a second fire is
//! refused and reported as [`DdpError::CallbackContract`] instead of reaching
//! the caller's closure again. A latch can also be armed without a closure so
//! that fire-and-forget calls go through the same bookkeeping.

use crate::error::DdpError;
use tracing::error;

type BoxedFn<T> = Box<dyn FnOnce(T) + Send + 'static>;

enum Latch<T> {
    Armed(Option<BoxedFn<T>>),
    Fired,
}

/// A completion handler that can be invoked at most once.
pub struct Callback<T> {
    latch: Latch<T>,
}

impl<T> Callback<T> {
    /// Arm a latch around a closure.
    pub fn new(f: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            latch: Latch::Armed(Some(Box::new(f))),
        }
    }

    /// Arm a latch with no closure attached.
    pub fn none() -> Self {
        Self {
            latch: Latch::Armed(None),
        }
    }

    /// Arm a latch from an optional boxed closure.
    pub fn from_option(f: Option<BoxedFn<T>>) -> Self {
        Self {
            latch: Latch::Armed(f),
        }
    }

    /// Whether this latch has already been fired.
    pub fn has_fired(&self) -> bool {
        matches!(self.latch, Latch::Fired)
    }

    /// Fire the latch, invoking the closure if one is attached.
    ///
    /// `id` names the invocation or subscription for error reporting. Firing
    /// twice is a bug in the engine; it is logged, trips a debug assertion,
    /// and is returned so the caller can surface it on the diagnostic channel.
    pub fn fire(&mut self, id: &str, value: T) -> Result<(), DdpError> {
        match std::mem::replace(&mut self.latch, Latch::Fired) {
            Latch::Armed(Some(f)) => {
                f(value);
                Ok(())
            }
            Latch::Armed(None) => Ok(()),
            Latch::Fired => {
                error!(id = %id, "Completion callback fired twice");
                debug_assert!(false, "completion callback for {} fired twice", id);
                Err(DdpError::CallbackContract { id: id.to_string() })
            }
        }
    }
}

impl<T> Default for Callback<T> {
    fn default() -> Self {
        Self::none()
    }
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.latch {
            Latch::Armed(Some(_)) => "armed",
            Latch::Armed(None) => "armed(empty)",
            Latch::Fired => "fired",
        };
        f.debug_struct("Callback").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fire_invokes_closure() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let mut cb = Callback::new(move |v: u32| {
            c.fetch_add(v, Ordering::SeqCst);
        });

        assert!(!cb.has_fired());
        cb.fire("1", 5).unwrap();
        assert!(cb.has_fired());
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_empty_latch_still_latches() {
        let mut cb: Callback<()> = Callback::none();
        cb.fire("1", ()).unwrap();
        assert!(cb.has_fired());
    }

    // The second fire trips a debug assertion, so only check it in release.
    #[cfg(not(debug_assertions))]
    #[test]
    fn test_second_fire_is_refused() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let mut cb = Callback::new(move |_: ()| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        cb.fire("9", ()).unwrap();
        let err = cb.fire("9", ()).unwrap_err();
        assert_eq!(err, DdpError::CallbackContract { id: "9".to_string() });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "fired twice")]
    fn test_second_fire_fails_fast_in_debug() {
        let mut cb: Callback<()> = Callback::none();
        cb.fire("9", ()).unwrap();
        let _ = cb.fire("9", ());
    }
}
