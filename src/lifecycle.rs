//! Open/close bookkeeping for a [`NetworkResource`](crate::NetworkResource).
//!
//! `Idle -> Opening -> Open -> Closing -> Closed`. A failed open goes back
//! to `Idle`; `Closed` is terminal. Only one open and one close sequence
//! ever run at a time, every other caller waits on a oneshot and receives
//! the same result.

use crate::error::{Error, Result};
use tokio::sync::oneshot::{channel, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Phase {
    #[default]
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

/// What a caller of open/close has to do next.
pub(crate) enum Entry {
    /// Nothing to run, here is the result.
    Ready(Result<()>),
    /// The caller must start the sequence, then wait for the result.
    Start(Receiver<Result<()>>),
    /// Another sequence is in flight, wait for its result.
    Wait(Receiver<Result<()>>),
    /// An open is in flight, wait for it to settle and try to close again.
    Settle(Receiver<Result<()>>),
}

#[derive(Default)]
pub(crate) struct Lifecycle {
    phase: Phase,
    opening: Vec<Sender<Result<()>>>,
    closing: Vec<Sender<Result<()>>>,
}

impl Lifecycle {
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn open(&mut self) -> Entry {
        match self.phase {
            Phase::Open => Entry::Ready(Ok(())),
            Phase::Closing | Phase::Closed => Entry::Ready(Err(Error::Closed)),
            Phase::Opening => Entry::Wait(Self::waiter(&mut self.opening)),
            Phase::Idle => {
                self.phase = Phase::Opening;
                Entry::Start(Self::waiter(&mut self.opening))
            }
        }
    }

    pub(crate) fn opened(&mut self, result: Result<()>) {
        self.phase = match result {
            Ok(()) => Phase::Open,
            Err(_) => Phase::Idle,
        };
        Self::notify(&mut self.opening, result);
    }

    pub(crate) fn close(&mut self) -> Entry {
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Closed;
                Entry::Ready(Ok(()))
            }
            Phase::Closed => Entry::Ready(Ok(())),
            Phase::Opening => Entry::Settle(Self::waiter(&mut self.opening)),
            Phase::Closing => Entry::Wait(Self::waiter(&mut self.closing)),
            Phase::Open => {
                self.phase = Phase::Closing;
                Entry::Start(Self::waiter(&mut self.closing))
            }
        }
    }

    pub(crate) fn closed(&mut self, result: Result<()>) {
        self.phase = Phase::Closed;
        Self::notify(&mut self.closing, result);
    }

    fn waiter(waiters: &mut Vec<Sender<Result<()>>>) -> Receiver<Result<()>> {
        let (tx, rx) = channel();
        waiters.push(tx);
        rx
    }

    fn notify(waiters: &mut Vec<Sender<Result<()>>>, result: Result<()>) {
        for tx in waiters.drain(..) {
            let _ = tx.send(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx(entry: Entry) -> Receiver<Result<()>> {
        match entry {
            Entry::Start(rx) | Entry::Wait(rx) | Entry::Settle(rx) => rx,
            Entry::Ready(_) => panic!("expected a waiter"),
        }
    }

    #[tokio::test]
    async fn test_single_open() {
        let mut l = Lifecycle::default();
        let first = l.open();
        assert!(matches!(first, Entry::Start(_)));
        let second = l.open();
        assert!(matches!(second, Entry::Wait(_)));
        assert_eq!(l.phase(), Phase::Opening);

        l.opened(Ok(()));
        assert!(rx(first).await.unwrap().is_ok());
        assert!(rx(second).await.unwrap().is_ok());
        assert!(matches!(l.open(), Entry::Ready(Ok(()))));
    }

    #[tokio::test]
    async fn test_failed_open_shared_then_retry() {
        let mut l = Lifecycle::default();
        let first = rx(l.open());
        let second = rx(l.open());

        l.opened(Err(Error::ConnectionFailed));
        assert!(matches!(first.await.unwrap(), Err(Error::ConnectionFailed)));
        assert!(matches!(second.await.unwrap(), Err(Error::ConnectionFailed)));

        assert_eq!(l.phase(), Phase::Idle);
        assert!(matches!(l.open(), Entry::Start(_)));
    }

    #[tokio::test]
    async fn test_close_waits_for_open() {
        let mut l = Lifecycle::default();
        let _open = l.open();
        let settle = l.close();
        assert!(matches!(settle, Entry::Settle(_)));

        l.opened(Ok(()));
        assert!(rx(settle).await.unwrap().is_ok());

        let first = l.close();
        assert!(matches!(first, Entry::Start(_)));
        let second = l.close();
        assert!(matches!(second, Entry::Wait(_)));
        assert!(matches!(l.open(), Entry::Ready(Err(Error::Closed))));

        l.closed(Ok(()));
        assert!(rx(second).await.unwrap().is_ok());
        assert_eq!(l.phase(), Phase::Closed);
        assert!(matches!(l.close(), Entry::Ready(Ok(()))));
    }

    #[test]
    fn test_close_idle() {
        let mut l = Lifecycle::default();
        assert!(matches!(l.close(), Entry::Ready(Ok(()))));
        assert_eq!(l.phase(), Phase::Closed);
        assert!(matches!(l.open(), Entry::Ready(Err(Error::Closed))));
    }
}
