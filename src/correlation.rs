//! Request/response correlation.
//!
//! The correlator assigns command ids and pairs each id with a one-shot
//! waiter the transport read loop resolves when the matching [`Response`]
//! or [`ExceptionResponse`] arrives. Waiters that time out are removed
//! eagerly so a late answer finds no home and is discarded; transport
//! failure rejects every outstanding waiter at once.

use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::command::{ExceptionResponse, Response};
use crate::error::{MessagingError, Result};

/// Outcome delivered to a registered waiter.
pub(crate) type CorrelationOutcome = Result<Response>;

/// Table matching command ids to pending waiters.
#[derive(Debug, Default)]
pub(crate) struct Correlator {
    next_id: AtomicI32,
    waiters: DashMap<i32, oneshot::Sender<CorrelationOutcome>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Assign the next command id and register a waiter for it.
    pub(crate) fn register(&self) -> (i32, oneshot::Receiver<CorrelationOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        (id, rx)
    }

    /// Drop the waiter for `id`, typically after its deadline expired.
    pub(crate) fn cancel(&self, id: i32) {
        self.waiters.remove(&id);
    }

    /// Number of waiters still outstanding.
    pub(crate) fn outstanding(&self) -> usize {
        self.waiters.len()
    }

    /// Resolve the waiter matching a successful response.
    pub(crate) fn offer_response(&self, response: Response) {
        match self.waiters.remove(&response.correlation_id) {
            Some((id, waiter)) => {
                if waiter.send(Ok(response)).is_err() {
                    log::debug!("waiter for command {id} gave up before the response arrived");
                }
            }
            None => {
                log::debug!(
                    "discarding late response for command {}",
                    response.correlation_id
                );
            }
        }
    }

    /// Reject the waiter matching a broker exception.
    pub(crate) fn offer_exception(&self, response: ExceptionResponse) {
        match self.waiters.remove(&response.correlation_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(Err(MessagingError::Broker {
                    message: response.message,
                    exception_class: response.exception_class,
                }));
            }
            None => {
                log::debug!(
                    "discarding late exception response for command {}",
                    response.correlation_id
                );
            }
        }
    }

    /// Reject every outstanding waiter, e.g. when the transport fails or
    /// the connection closes.
    pub(crate) fn fail_all(&self, reason: impl Fn() -> MessagingError) {
        let ids: Vec<i32> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                let _ = waiter.send(Err(reason()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responses_resolve_their_waiter() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.offer_response(Response { correlation_id: id });
        let outcome = rx.await.expect("waiter resolved");
        assert_eq!(outcome.expect("success").correlation_id, id);
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn exceptions_reject_their_waiter() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.offer_exception(ExceptionResponse {
            correlation_id: id,
            message: "denied".into(),
            exception_class: "SecurityException".into(),
        });
        let outcome = rx.await.expect("waiter resolved");
        assert!(matches!(outcome, Err(MessagingError::Broker { .. })));
    }

    #[tokio::test]
    async fn cancelled_ids_discard_late_responses() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register();
        correlator.cancel(id);
        assert_eq!(correlator.outstanding(), 0);
        // A late response must not resurrect the entry.
        correlator.offer_response(Response { correlation_id: id });
        assert_eq!(correlator.outstanding(), 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn fail_all_rejects_every_outstanding_waiter() {
        let correlator = Correlator::new();
        let (_, first) = correlator.register();
        let (_, second) = correlator.register();
        correlator.fail_all(|| MessagingError::transport("socket reset"));
        assert!(matches!(
            first.await.expect("resolved"),
            Err(MessagingError::Transport(_))
        ));
        assert!(matches!(
            second.await.expect("resolved"),
            Err(MessagingError::Transport(_))
        ));
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn ids_increase_monotonically() {
        let correlator = Correlator::new();
        let (first, _rx1) = correlator.register();
        let (second, _rx2) = correlator.register();
        assert!(second > first);
    }
}
