use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a registry mutex. Registries hold plain bookkeeping that stays valid
/// even if a holder panicked, so a poisoned lock is recovered.
pub fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
