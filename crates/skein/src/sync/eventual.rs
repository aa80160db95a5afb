//! Write-once value with blocking readers

use crate::sync::Latch;
use crate::{Error, Result};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// A value set exactly once; readers block until it is available
pub struct Eventual<T> {
    value: OnceCell<Arc<T>>,
    ready: Latch,
}

impl<T: Send + Sync + 'static> Eventual<T> {
    /// Create an unset eventual
    pub fn new() -> Self {
        Self {
            value: OnceCell::new(),
            ready: Latch::new(),
        }
    }

    /// Publish the value and release every waiter
    pub fn set(&self, value: T) -> Result<()> {
        self.value
            .set(Arc::new(value))
            .map_err(|_| Error::InvalidState("eventual is already set".into()))?;
        self.ready.set();
        Ok(())
    }

    /// Block until the value is set; all readers share one allocation
    pub fn wait(&self) -> Result<Arc<T>> {
        self.ready.wait()?;
        self.value
            .get()
            .cloned()
            .ok_or_else(|| Error::InvalidState("eventual released without a value".into()))
    }

    /// The value if already set; never blocks
    pub fn test(&self) -> Option<Arc<T>> {
        self.value.get().cloned()
    }
}

impl<T: Send + Sync + 'static> Default for Eventual<T> {
    fn default() -> Self {
        Self::new()
    }
}
