//! A single-assignment cell.

use std::sync::Mutex;

/// A cell that can be written exactly once: the first [SetOnce::set] wins and
/// every later call is rejected. There is deliberately no way to overwrite an
/// already-set value.
pub struct SetOnce<T> {
    value: Mutex<Option<T>>,
}

impl<T> Default for SetOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SetOnce<T> {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    /// Store a value if the cell is still empty. Returns whether this caller
    /// won.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.value.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// Whether the cell has been written.
    pub fn is_set(&self) -> bool {
        self.value.lock().unwrap().is_some()
    }
}

impl<T: Clone> SetOnce<T> {
    /// Clone out the stored value, if any.
    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap().clone()
    }
}
