//! Broker acknowledgement tracking for QoS 1/2 publishes.
//!
//! rumqttc assigns packet ids inside the event loop, so a publish caller
//! cannot know its id up front. Requests leave the client channel in FIFO
//! order and each one produces an `Outgoing::Publish(pkid)` event, so the
//! tracker keeps waiters in a queue and binds the front waiter to the next
//! outgoing packet id. The matching PUBACK/PUBCOMP resolves it.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::transport::TransportError;

type Waiter = oneshot::Sender<Result<(), TransportError>>;

#[derive(Default)]
struct AckState {
    /// Waiters whose packet has not been sent yet. `None` marks a request
    /// that was failed on disconnect but is still sitting in the client channel.
    queued: VecDeque<Option<Waiter>>,
    /// Waiters bound to a packet id, waiting for the broker.
    inflight: HashMap<u16, Waiter>,
    /// Packet ids rumqttc will retransmit after a reconnect.
    replays: HashSet<u16>,
}

#[derive(Default)]
pub(crate) struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hand a request to the client and queue its waiter.
    ///
    /// The lock is held across `submit`, so concurrent publishers queue
    /// waiters in the same order their requests enter the client channel.
    /// `submit` must not block. No waiter is queued when it fails.
    pub(crate) fn submit<F, E>(
        &self,
        submit: F,
    ) -> Result<oneshot::Receiver<Result<(), TransportError>>, E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        let mut state = self.state.lock();
        submit()?;
        let (tx, rx) = oneshot::channel();
        state.queued.push_back(Some(tx));
        Ok(rx)
    }

    #[cfg(test)]
    fn enqueue(&self) -> oneshot::Receiver<Result<(), TransportError>> {
        match self.submit(|| Ok::<(), ()>(())) {
            Ok(rx) => rx,
            Err(()) => unreachable!(),
        }
    }

    /// Bind the next queued waiter to an outgoing packet id.
    pub(crate) fn on_outgoing(&self, pkid: u16) {
        // QoS 0 packets carry id 0 and never get acknowledged
        if pkid == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.replays.remove(&pkid) {
            return;
        }
        if let Some(Some(waiter)) = state.queued.pop_front() {
            state.inflight.insert(pkid, waiter);
        }
    }

    /// Resolve the waiter for an acknowledged packet id.
    pub(crate) fn on_ack(&self, pkid: u16) {
        let waiter = self.state.lock().inflight.remove(&pkid);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Fail every pending waiter after the session dropped.
    pub(crate) fn fail_all(&self, error: TransportError) {
        let mut state = self.state.lock();

        let inflight: Vec<(u16, Waiter)> = state.inflight.drain().collect();
        for (pkid, waiter) in inflight {
            state.replays.insert(pkid);
            let _ = waiter.send(Err(error.clone()));
        }

        for slot in state.queued.iter_mut() {
            if let Some(waiter) = slot.take() {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Drop all bookkeeping, used when the event loop is torn down.
    pub(crate) fn reset(&self, error: TransportError) {
        self.fail_all(error);
        let mut state = self.state.lock();
        state.queued.clear();
        state.replays.clear();
    }

    #[cfg(test)]
    fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.queued.len(), state.inflight.len())
    }
}
