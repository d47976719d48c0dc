//! Type-indexed extension storage.
//!
//! Every distinct stored type gets a process-wide slot index on first use.
//! Each hub instance keeps a plain vector of owning slots addressed by that
//! index, so access after first use is a bounds check plus a downcast.
//!
//! ```text
//!   registry: TypeId -> index      (global, assigned once, never reused)
//!
//!   hub.slots: [ Some(Box<A>) | None | Some(Box<C>) | ... ]
//!                 index 0        1      index 2
//! ```
//!
//! Index assignment is synchronized; slot storage is not. A hub is owned by
//! exactly one engine or session and must be serialized externally if it is
//! ever touched from more than one thread.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};

use thiserror::Error;

/// Slot indices are handed out up to this bound.
const MAX_SLOT_INDEX: usize = u32::MAX as usize;

static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);
static REGISTRY: OnceLock<RwLock<HashMap<TypeId, usize>>> = OnceLock::new();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// No more slot indices can be assigned in this process
    #[error("context slot indices exhausted")]
    IndexExhausted,
}

fn registry() -> &'static RwLock<HashMap<TypeId, usize>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Index previously assigned to `T`, if any. Never allocates.
fn lookup_index<T: 'static>() -> Option<usize> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&TypeId::of::<T>())
        .copied()
}

/// Index for `T`, assigning the next free one on first use.
fn assign_index<T: 'static>() -> Result<usize, HubError> {
    if let Some(index) = lookup_index::<T>() {
        return Ok(index);
    }

    let mut map = registry().write().unwrap_or_else(PoisonError::into_inner);
    // Another thread may have won the race between the read and write lock
    if let Some(&index) = map.get(&TypeId::of::<T>()) {
        return Ok(index);
    }

    let index = NEXT_INDEX
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < MAX_SLOT_INDEX).then_some(n + 1)
        })
        .map_err(|_| HubError::IndexExhausted)?;
    map.insert(TypeId::of::<T>(), index);
    Ok(index)
}

/// Forget every type-to-index assignment and restart numbering at zero.
///
/// Only compiled for tests and the `test-hooks` feature. Hubs that are still
/// alive keep their old slots and must not be written afterwards: a reused
/// index can point `set` at a slot holding another type's value, which is
/// then dropped. Reading them is safe, a stale value is simply not found.
#[cfg(any(test, feature = "test-hooks"))]
#[doc(hidden)]
pub fn reset_type_indices() {
    let mut map = registry().write().unwrap_or_else(PoisonError::into_inner);
    map.clear();
    NEXT_INDEX.store(0, Ordering::SeqCst);
}

/// Number of types that have been assigned a slot index so far.
pub fn assigned_type_count() -> usize {
    NEXT_INDEX.load(Ordering::SeqCst)
}

/// Heterogeneous store holding at most one value per type.
///
/// ```
/// use netcore::core::ContextHub;
///
/// struct PlayerCount(u32);
///
/// let mut hub = ContextHub::new();
/// hub.set(PlayerCount(3)).unwrap();
/// assert_eq!(hub.get::<PlayerCount>().map(|c| c.0), Some(3));
///
/// hub.reset::<PlayerCount>();
/// assert!(hub.get::<PlayerCount>().is_none());
/// ```
#[derive(Default)]
pub struct ContextHub {
    slots: Vec<Option<Box<dyn Any>>>,
}

impl ContextHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, taking ownership and dropping any previous `T`.
    pub fn set<T: 'static>(&mut self, value: T) -> Result<(), HubError> {
        let index = assign_index::<T>()?;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(Box::new(value));
        Ok(())
    }

    /// Borrow the stored `T`, or `None` if it was never set here.
    #[inline]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        let index = lookup_index::<T>()?;
        self.slots.get(index)?.as_ref()?.downcast_ref::<T>()
    }

    #[inline]
    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        let index = lookup_index::<T>()?;
        self.slots.get_mut(index)?.as_mut()?.downcast_mut::<T>()
    }

    /// Drop the stored `T` and clear its slot.
    pub fn reset<T: 'static>(&mut self) {
        drop(self.take::<T>());
    }

    /// Remove the stored `T` and hand ownership back to the caller.
    pub fn take<T: 'static>(&mut self) -> Option<T> {
        let index = lookup_index::<T>()?;
        let slot = self.slots.get_mut(index)?;
        if !slot.as_ref().is_some_and(|value| value.is::<T>()) {
            return None;
        }
        slot.take()?.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.get::<T>().is_some()
    }

    /// Current slot array width. Only ever grows.
    pub fn width(&self) -> usize {
        self.slots.len()
    }
}

impl std::fmt::Debug for ContextHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHub")
            .field("width", &self.slots.len())
            .field("occupied", &self.slots.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::{Arc, Barrier};

    #[derive(Debug, PartialEq)]
    struct Alpha(u32);

    #[derive(Debug, PartialEq)]
    struct Beta(&'static str);

    #[test]
    fn test_set_then_get() {
        let mut hub = ContextHub::new();
        hub.set(Alpha(7)).unwrap();
        assert_eq!(hub.get::<Alpha>(), Some(&Alpha(7)));
    }

    #[test]
    fn test_get_unset_is_none() {
        struct NeverStored;
        let hub = ContextHub::new();
        assert!(hub.get::<NeverStored>().is_none());
        assert_eq!(hub.width(), 0);
    }

    #[test]
    fn test_distinct_types_do_not_interfere() {
        let mut hub = ContextHub::new();
        hub.set(Alpha(1)).unwrap();
        hub.set(Beta("b")).unwrap();

        hub.reset::<Alpha>();
        assert!(hub.get::<Alpha>().is_none());
        assert_eq!(hub.get::<Beta>(), Some(&Beta("b")));

        hub.set(Alpha(2)).unwrap();
        hub.get_mut::<Beta>().unwrap().0 = "c";
        assert_eq!(hub.get::<Alpha>(), Some(&Alpha(2)));
        assert_eq!(hub.get::<Beta>(), Some(&Beta("c")));
    }

    #[test]
    fn test_set_releases_previous_value() {
        let marker = Rc::new(());
        let mut hub = ContextHub::new();

        hub.set(marker.clone()).unwrap();
        assert_eq!(Rc::strong_count(&marker), 2);

        hub.set(Rc::new(())).unwrap();
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn test_reset_drops_value() {
        let marker = Rc::new(());
        let mut hub = ContextHub::new();
        hub.set(marker.clone()).unwrap();

        hub.reset::<Rc<()>>();
        assert_eq!(Rc::strong_count(&marker), 1);
        assert!(!hub.contains::<Rc<()>>());
    }

    #[test]
    fn test_take_returns_ownership() {
        let mut hub = ContextHub::new();
        hub.set(String::from("session-state")).unwrap();
        assert_eq!(hub.take::<String>().as_deref(), Some("session-state"));
        assert!(hub.take::<String>().is_none());
    }

    #[test]
    fn test_instances_are_independent() {
        let mut a = ContextHub::new();
        let mut b = ContextHub::new();
        a.set(Alpha(1)).unwrap();
        b.set(Alpha(2)).unwrap();
        assert_eq!(a.get::<Alpha>(), Some(&Alpha(1)));
        assert_eq!(b.get::<Alpha>(), Some(&Alpha(2)));
    }

    #[test]
    fn test_width_only_grows() {
        struct Gamma;
        let mut hub = ContextHub::new();
        hub.set(Gamma).unwrap();
        let width = hub.width();
        assert!(width > 0);

        hub.reset::<Gamma>();
        assert_eq!(hub.width(), width);
    }

    #[test]
    fn test_concurrent_first_use_assigns_one_index() {
        struct Contended;
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    assign_index::<Contended>().unwrap()
                })
            })
            .collect();

        let indices: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(indices.windows(2).all(|w| w[0] == w[1]));
    }
}
