//! Ordered callback registry
//!
//! Entries keep insertion order and are addressed by a `CallbackId` that is
//! never reused within one registry. Fan-out snapshots the ids first and
//! re-checks membership before each call, so a callback may remove itself
//! or any other entry while the registry is being walked.
//!
//! Single-threaded: entries are `Rc<RefCell<T>>` and the registry itself is
//! meant to sit behind the owner's `RefCell`, borrowed only briefly.

use core::cell::RefCell;
use core::fmt;
use std::rc::Rc;

/// Handle returned by `Registry::add`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CallbackId(u64);

impl CallbackId {
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackId({})", self.0)
    }
}

/// What a fan-out callback wants done with its registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackControl {
    /// Stay registered
    Keep,
    /// Unregister after this call
    Remove,
}

/// Insertion-ordered list of shared entries
pub struct Registry<T: ?Sized> {
    entries: Vec<(CallbackId, Rc<RefCell<T>>)>,
    next_id: u64,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Append an entry, returning its id
    pub fn add(&mut self, entry: Rc<RefCell<T>>) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, entry));
        id
    }

    /// Remove an entry, handing it back to the caller
    pub fn remove(&mut self, id: CallbackId) -> Option<Rc<RefCell<T>>> {
        let pos = self.entries.iter().position(|(eid, _)| *eid == id)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn get(&self, id: CallbackId) -> Option<Rc<RefCell<T>>> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, entry)| Rc::clone(entry))
    }

    #[inline]
    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries.iter().any(|(eid, _)| *eid == id)
    }

    /// Ids in insertion order, for a removal-tolerant walk
    pub fn snapshot(&self) -> Vec<CallbackId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk `registry` in order, calling `invoke` on every entry still present.
///
/// The registry is only borrowed between calls, never during one. Entries
/// answering `CallbackControl::Remove` are dropped afterwards.
pub fn fan_out<T, F>(registry: &RefCell<Registry<T>>, mut invoke: F)
where
    T: ?Sized,
    F: FnMut(&mut T) -> CallbackControl,
{
    let ids = registry.borrow().snapshot();
    for id in ids {
        let entry = match registry.borrow().get(id) {
            Some(entry) => entry,
            None => continue,
        };
        let control = invoke(&mut *entry.borrow_mut());
        if control == CallbackControl::Remove {
            registry.borrow_mut().remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Cb = dyn FnMut(i32) -> CallbackControl;

    fn boxed(f: impl FnMut(i32) -> CallbackControl + 'static) -> Rc<RefCell<Cb>> {
        Rc::new(RefCell::new(f))
    }

    #[test]
    fn test_add_remove_order() {
        let mut reg: Registry<Cb> = Registry::new();
        let a = reg.add(boxed(|_| CallbackControl::Keep));
        let b = reg.add(boxed(|_| CallbackControl::Keep));
        let c = reg.add(boxed(|_| CallbackControl::Keep));
        assert_eq!(reg.snapshot(), vec![a, b, c]);

        assert!(reg.remove(b).is_some());
        assert!(reg.remove(b).is_none());
        assert_eq!(reg.snapshot(), vec![a, c]);

        // Ids are not reused
        let d = reg.add(boxed(|_| CallbackControl::Keep));
        assert!(d > c);
    }

    #[test]
    fn test_fan_out_self_removal() {
        let reg: RefCell<Registry<Cb>> = RefCell::new(Registry::new());
        let hits = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let hits = Rc::clone(&hits);
            reg.borrow_mut().add(boxed(move |arg| {
                hits.borrow_mut().push((i, arg));
                if i == 1 {
                    CallbackControl::Remove
                } else {
                    CallbackControl::Keep
                }
            }));
        }

        fan_out(&reg, |cb| cb(7));
        assert_eq!(*hits.borrow(), vec![(0, 7), (1, 7), (2, 7)]);
        assert_eq!(reg.borrow().len(), 2);

        fan_out(&reg, |cb| cb(8));
        assert_eq!(hits.borrow().len(), 5);
    }

    #[test]
    fn test_fan_out_removes_other_entry() {
        let reg: Rc<RefCell<Registry<Cb>>> = Rc::new(RefCell::new(Registry::new()));
        let calls = Rc::new(RefCell::new(0));

        let victim_slot: Rc<RefCell<Option<CallbackId>>> = Rc::new(RefCell::new(None));
        {
            let reg2 = Rc::clone(&reg);
            let slot = Rc::clone(&victim_slot);
            let calls = Rc::clone(&calls);
            reg.borrow_mut().add(boxed(move |_| {
                *calls.borrow_mut() += 1;
                if let Some(id) = *slot.borrow() {
                    reg2.borrow_mut().remove(id);
                }
                CallbackControl::Keep
            }));
        }
        let calls2 = Rc::clone(&calls);
        let victim = reg.borrow_mut().add(boxed(move |_| {
            *calls2.borrow_mut() += 100;
            CallbackControl::Keep
        }));
        *victim_slot.borrow_mut() = Some(victim);

        fan_out(&*reg, |cb| cb(0));
        // The victim was removed before its turn and never ran
        assert_eq!(*calls.borrow(), 1);
        assert!(!reg.borrow().contains(victim));
    }
}
