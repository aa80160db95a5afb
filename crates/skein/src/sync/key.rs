//! Work-unit-local storage
//!
//! A [`Key`] names one slot in every work unit. Values are stored in the
//! runtime, keyed by unit, and survive yields and migrations. When a unit
//! terminates, the destructor of each key it set runs on the executing
//! thread (so before the unit can be joined or revived).

use crate::runtime::RuntimeInner;
use crate::unit::{self, UnitId};
use crate::{Error, Result};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a key
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

impl KeyId {
    pub(crate) fn new() -> Self {
        KeyId(NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for KeyId {
    fn default() -> Self {
        Self::new()
    }
}

type Destructor<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A stored value together with the destructor that consumes it
pub(crate) struct KeySlot {
    value: Box<dyn Any + Send>,
    dtor: Option<Box<dyn FnOnce(Box<dyn Any + Send>) + Send>>,
}

impl KeySlot {
    /// Run the destructor (if any) on the value
    pub(crate) fn destroy(self) {
        if let Some(dtor) = self.dtor {
            dtor(self.value);
        }
    }
}

/// Handle to a work-unit-local slot holding a `T`
pub struct Key<T> {
    id: KeyId,
    dtor: Option<Destructor<T>>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> Key<T> {
    /// Create a key without destructor
    pub fn new() -> Self {
        Self::with_destructor_opt(None)
    }

    /// Create a key whose destructor receives each unit's value at termination
    pub fn with_destructor(dtor: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::with_destructor_opt(Some(Arc::new(dtor)))
    }

    pub(crate) fn with_destructor_opt(dtor: Option<Destructor<T>>) -> Self {
        Self {
            id: KeyId::new(),
            dtor,
            _marker: PhantomData,
        }
    }

    /// Key identifier
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Store `value` for the calling unit, replacing (and dropping) any previous one
    pub fn set(&self, value: T) -> Result<()> {
        let (unit, rt) = current_unit()?;
        let dtor = self.dtor.clone().map(|dtor| {
            Box::new(move |value: Box<dyn Any + Send>| {
                if let Ok(value) = value.downcast::<T>() {
                    dtor(*value);
                }
            }) as Box<dyn FnOnce(Box<dyn Any + Send>) + Send>
        });
        let slot = KeySlot {
            value: Box::new(value),
            dtor,
        };
        let previous = rt.keys.entry(unit).or_default().lock().insert(self.id, slot);
        // Dropped outside the map guard
        drop(previous);
        Ok(())
    }

    /// Clone of the calling unit's value
    pub fn get(&self) -> Result<Option<T>>
    where
        T: Clone,
    {
        let (unit, rt) = current_unit()?;
        let value = rt.keys.get(&unit).and_then(|slots| {
            let slots = slots.lock();
            let value = slots
                .get(&self.id)
                .and_then(|slot| slot.value.downcast_ref::<T>())
                .cloned();
            value
        });
        Ok(value)
    }

    /// Run `f` on the calling unit's value.
    ///
    /// The value is taken out of the slot while `f` runs, so `f` sees the
    /// slot as empty if it accesses this key again.
    pub fn with<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> Result<R> {
        let (unit, rt) = current_unit()?;
        let slot = remove_slot(&rt, unit, self.id);

        let Some(mut slot) = slot else {
            return Ok(f(None));
        };
        let result = f(slot.value.downcast_mut::<T>());
        rt.keys.entry(unit).or_default().lock().insert(self.id, slot);
        Ok(result)
    }

    /// Remove the calling unit's value without running the destructor
    pub fn take(&self) -> Result<Option<T>> {
        let (unit, rt) = current_unit()?;
        let slot = remove_slot(&rt, unit, self.id);
        Ok(slot.and_then(|slot| slot.value.downcast::<T>().ok().map(|v| *v)))
    }
}

fn remove_slot(rt: &RuntimeInner, unit: UnitId, key: KeyId) -> Option<KeySlot> {
    let slots = rt.keys.get(&unit)?;
    let removed = slots.lock().remove(&key);
    removed
}

fn current_unit() -> Result<(UnitId, Arc<RuntimeInner>)> {
    let unit = unit::current()
        .ok_or_else(|| Error::InvalidState("keys are only accessible from a work unit".into()))?;
    let rt = unit
        .runtime()
        .ok_or_else(|| Error::InvalidState("runtime already finalized".into()))?;
    Ok((unit.id(), rt))
}

impl<T: Send + 'static> Default for Key<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            dtor: self.dtor.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("has_destructor", &self.dtor.is_some())
            .finish()
    }
}
