//! Allocation reuse for per-frame data.
//!
//! Structures that live in a frame ring slot (command-list pools, scratch
//! vectors, query streams) are created once and then *reset* every time the
//! slot comes around again, so their capacity survives from frame to frame.
//!
//! ```
//! use umbra_core::pool::Poolable;
//!
//! #[derive(Debug, Default)]
//! struct DrawList {
//!     ranges: Vec<(u32, u32)>,
//! }
//!
//! impl Poolable for DrawList {
//!     fn new_empty() -> Self {
//!         Self::default()
//!     }
//!     fn reset(&mut self) {
//!         self.ranges.clear();
//!     }
//! }
//!
//! let mut list = DrawList::new_empty();
//! list.ranges.push((0, 12));
//! list.reset();
//! assert!(list.ranges.is_empty());
//! assert!(list.ranges.capacity() >= 1);
//! ```

/// Trait for types that can be reused across frames.
///
/// Implementors must be able to create an empty instance and clear their
/// contents while preserving allocated capacity.
pub trait Poolable {
    /// Create a new empty instance.
    fn new_empty() -> Self;

    /// Reset the value to an empty state, preserving allocated capacity.
    ///
    /// For example, call `Vec::clear()` rather than replacing with a new `Vec`.
    fn reset(&mut self);
}

impl<T> Poolable for Vec<T> {
    fn new_empty() -> Self {
        Vec::new()
    }

    fn reset(&mut self) {
        self.clear();
    }
}

impl Poolable for () {
    fn new_empty() -> Self {}

    fn reset(&mut self) {}
}

/// Take a value out of a lazily-filled slot, creating it on first use and
/// resetting it on every later use.
///
/// Returns `true` when the value was freshly created.
pub fn acquire_slot<T: Poolable>(slot: &mut Option<T>) -> (&mut T, bool) {
    let fresh = slot.is_none();
    if let Some(value) = slot.as_mut() {
        value.reset();
    }
    (slot.get_or_insert_with(T::new_empty), fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Scratch {
        data: Vec<u32>,
        resets: u32,
    }

    impl Poolable for Scratch {
        fn new_empty() -> Self {
            Self::default()
        }
        fn reset(&mut self) {
            self.data.clear();
            self.resets += 1;
        }
    }

    #[test]
    fn test_vec_reset_keeps_capacity() {
        let mut v: Vec<u32> = Vec::new_empty();
        v.extend_from_slice(&[1, 2, 3, 4]);
        v.reset();
        assert!(v.is_empty());
        assert!(v.capacity() >= 4);
    }

    #[test]
    fn test_acquire_slot_creates_lazily() {
        let mut slot: Option<Scratch> = None;
        let (value, fresh) = acquire_slot(&mut slot);
        assert!(fresh);
        assert_eq!(value.resets, 0);
        value.data.push(7);
        assert!(slot.is_some());
    }

    #[test]
    fn test_acquire_slot_resets_on_reuse() {
        let mut slot: Option<Scratch> = None;
        acquire_slot(&mut slot).0.data.extend_from_slice(&[1, 2, 3]);

        let (value, fresh) = acquire_slot(&mut slot);
        assert!(!fresh);
        assert!(value.data.is_empty());
        assert!(value.data.capacity() >= 3);
        assert_eq!(value.resets, 1);
    }
}
