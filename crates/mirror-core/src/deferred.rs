//! One-shot completion primitive.
//!
//! A [`Deferred`] pairs a resolver with a cloneable [`Completion`] that any
//! number of waiters can await; dropping the deferred unresolved wakes the
//! waiters with `None`.

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

/// Shared handle awaiting a deferred value.
#[derive(Clone)]
pub struct Completion<T: Clone + Send + 'static> {
    inner: Shared<BoxFuture<'static, Option<T>>>,
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Wait for the value. Returns `None` when the deferred was dropped
    /// without being resolved.
    pub async fn wait(&self) -> Option<T> {
        self.inner.clone().await
    }
}

/// The resolving side of a one-shot completion.
pub struct Deferred<T: Clone + Send + 'static> {
    sender: Option<oneshot::Sender<T>>,
    completion: Completion<T>,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let inner = receiver.map(|result| result.ok()).boxed().shared();
        Self {
            sender: Some(sender),
            completion: Completion { inner },
        }
    }

    /// Resolve every waiter with the value. A second call is a no-op.
    pub fn resolve(&mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(value);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }

    /// A cloneable handle for waiters.
    pub fn completion(&self) -> Completion<T> {
        self.completion.clone()
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_all_waiters() {
        let mut deferred = Deferred::new();
        let first = deferred.completion();
        let second = deferred.completion();
        deferred.resolve(7u32);
        assert_eq!(first.wait().await, Some(7));
        assert_eq!(second.wait().await, Some(7));
    }

    #[tokio::test]
    async fn test_dropped_deferred_yields_none() {
        let deferred: Deferred<u32> = Deferred::new();
        let completion = deferred.completion();
        drop(deferred);
        assert_eq!(completion.wait().await, None);
    }

    #[tokio::test]
    async fn test_second_resolve_is_ignored() {
        let mut deferred = Deferred::new();
        let completion = deferred.completion();
        deferred.resolve(1u32);
        deferred.resolve(2u32);
        assert_eq!(completion.wait().await, Some(1));
    }
}
