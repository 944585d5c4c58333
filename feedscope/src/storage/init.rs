use std::future::Future;
use tokio::sync::OnceCell;

use crate::error::Result;

/// Single-flight async initialization.
///
/// The first caller runs the initializer; concurrent callers wait for its
/// outcome instead of starting their own. A failed attempt leaves the guard
/// empty so the next caller retries.
pub struct InitGuard<T = ()> {
    cell: OnceCell<T>,
}

impl<T> InitGuard<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<&T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cell.get_or_try_init(init).await
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

impl<T> Default for InitGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}
