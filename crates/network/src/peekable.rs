//! Peekable asynchronous results
//!
//! A [`Peekable`] drives one computation on the runtime and lets any number
//! of observers check whether it has settled without consuming or waiting on
//! the outcome. [`first_success`] builds the "first success wins, keep
//! waiting on failures" race on top of it.

use std::future::Future;

use futures::future::select_all;
use tokio::sync::watch;

/// Completion state of a [`Peekable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Still running
    Pending,
    /// Produced a value
    Fulfilled,
    /// Produced an error, or was dropped before producing anything
    Rejected,
}

/// Shared handle on the outcome of a spawned computation
#[derive(Debug)]
pub struct Peekable<T, E> {
    state: watch::Receiver<Option<Result<T, E>>>,
}

impl<T, E> Clone for Peekable<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T, E> Peekable<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Spawn `future` on the runtime and observe its outcome.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let outcome = future.await;
            let _ = tx.send(Some(outcome));
        });
        Self { state: rx }
    }

    /// Already-wrapped results are returned unchanged
    pub fn peekable(self) -> Self {
        self
    }

    /// Current completion state. Never blocks.
    pub fn status(&self) -> Settlement {
        match &*self.state.borrow() {
            Some(Ok(_)) => Settlement::Fulfilled,
            Some(Err(_)) => Settlement::Rejected,
            // The driving task is gone without sending anything
            None if self.state.has_changed().is_err() => Settlement::Rejected,
            None => Settlement::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Settlement::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status() == Settlement::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == Settlement::Rejected
    }

    /// The value, if the computation succeeded
    pub fn value(&self) -> Option<T> {
        match &*self.state.borrow() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Wait for the computation to settle.
    ///
    /// Returns `None` if the driving task was dropped without an outcome.
    pub async fn settled(&self) -> Option<Result<T, E>> {
        let mut state = self.state.clone();
        let outcome = match state.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome
    }
}

/// Conversion into a [`Peekable`]
pub trait IntoPeekable<T, E> {
    /// Wrap `self`; wrapping a [`Peekable`] is a no-op
    fn into_peekable(self) -> Peekable<T, E>;
}

impl<T, E> IntoPeekable<T, E> for Peekable<T, E> {
    fn into_peekable(self) -> Peekable<T, E> {
        self
    }
}

impl<F, T, E> IntoPeekable<T, E> for F
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn into_peekable(self) -> Peekable<T, E> {
        Peekable::spawn(self)
    }
}

/// Race `sources` for the first successful value.
///
/// A source failing does not end the race while another is still pending.
/// Returns `None` once every source has settled without a value.
pub async fn first_success<T, E>(sources: &[Peekable<T, E>]) -> Option<T>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    loop {
        if let Some(value) = sources.iter().find_map(Peekable::value) {
            return Some(value);
        }

        let pending: Vec<_> = sources
            .iter()
            .filter(|source| source.is_pending())
            .map(|source| Box::pin(source.settled()))
            .collect();
        if pending.is_empty() {
            return None;
        }

        select_all(pending).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn after<T>(ms: u64, outcome: Result<T, String>) -> Result<T, String> {
        sleep(Duration::from_millis(ms)).await;
        outcome
    }

    #[tokio::test]
    async fn test_status_is_non_destructive() {
        let ok: Peekable<u32, String> = Peekable::spawn(after(10, Ok(7)));
        assert!(ok.is_pending());

        assert_eq!(ok.settled().await, Some(Ok(7)));
        assert!(ok.is_fulfilled());
        // Observing again yields the same value
        assert_eq!(ok.value(), Some(7));
        assert_eq!(ok.clone().settled().await, Some(Ok(7)));

        let err: Peekable<u32, String> = Peekable::spawn(after(0, Err("boom".to_string())));
        assert_eq!(err.settled().await, Some(Err("boom".to_string())));
        assert!(err.is_rejected());
        assert_eq!(err.value(), None);
    }

    #[tokio::test]
    async fn test_wrapping_is_idempotent() {
        let first: Peekable<u32, String> = after(5, Ok(1)).into_peekable();
        let again = first.clone().into_peekable();
        assert_eq!(again.settled().await, Some(Ok(1)));
        assert!(first.is_fulfilled());

        let same = first.clone().peekable();
        assert!(same.is_fulfilled());
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn test_panicking_computation_reports_rejected() {
        let broken: Peekable<u32, String> = Peekable::spawn(async {
            panic!("computation panicked");
            Ok(0)
        });
        assert_eq!(broken.settled().await, None);
        assert!(broken.is_rejected());
    }

    #[tokio::test]
    async fn test_first_success_keeps_waiting_after_failure() {
        let sources: Vec<Peekable<&str, String>> = vec![
            Peekable::spawn(after(10, Err("local miss".to_string()))),
            Peekable::spawn(after(50, Ok("remote"))),
        ];

        assert_eq!(first_success(&sources).await, Some("remote"));
        assert!(sources[0].is_rejected());
    }

    #[tokio::test]
    async fn test_first_success_takes_fastest_value() {
        let sources: Vec<Peekable<&str, String>> = vec![
            Peekable::spawn(after(200, Ok("slow"))),
            Peekable::spawn(after(5, Ok("fast"))),
        ];

        assert_eq!(first_success(&sources).await, Some("fast"));
        assert!(sources[0].is_pending());
    }

    #[tokio::test]
    async fn test_first_success_all_failed() {
        let sources: Vec<Peekable<u32, String>> = vec![
            Peekable::spawn(after(5, Err("a".to_string()))),
            Peekable::spawn(after(10, Err("b".to_string()))),
        ];

        assert_eq!(first_success(&sources).await, None);
        assert_eq!(first_success::<u32, String>(&[]).await, None);
    }
}
