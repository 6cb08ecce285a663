//! Subscriber bookkeeping for the lane.
//!
//! Every subscriber owns its own bounded queue, filled by the lane with
//! `try_send`. The lane never waits on a subscriber: when a queue is full the
//! record is dropped and counted, and the receiver sees a `Lagged(n)` marker
//! at that point of its stream once it catches up. A dropped receiver prunes
//! the subscriber.

use crate::error::{RecvError, TryRecvError};
use crate::graph::StateId;
use crate::record::{Phase, Transition};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Callback run on the lane for every record.
pub(crate) type Callback<E> = Box<dyn FnMut(&Transition<E>) + Send>;

/// Which records a subscriber wants.
#[derive(Debug, Clone)]
pub(crate) enum Interest<E> {
    /// Every record.
    All,
    /// Settled states only (starting and entering).
    Settled,
    /// One end of transitions touching `state`, optionally for one event.
    Edge {
        state: StateId,
        phase: Phase,
        event: Option<E>,
    },
}

impl<E: PartialEq> Interest<E> {
    /// Returns true if the record matches this interest.
    pub(crate) fn matches(&self, record: &Transition<E>) -> bool {
        match self {
            Interest::All => true,
            Interest::Settled => record.phase.is_settled(),
            Interest::Edge {
                state,
                phase,
                event,
            } => {
                record.state == *state
                    && record.phase == *phase
                    && (event.is_none() || event.as_ref() == record.event.as_ref())
            }
        }
    }
}

/// One queue slot: a value, or the number of values dropped before the next.
#[derive(Debug)]
enum Slot<T> {
    Value(T),
    Lagged(u64),
}

/// Sending half of a subscription queue, owned by the lane.
pub(crate) struct Queue<T> {
    tx: mpsc::Sender<Slot<T>>,
    /// Values dropped since the last slot that made it into the queue.
    missed: u64,
    /// Gap left over when the lane lets go of the queue.
    trailing: Arc<AtomicU64>,
}

/// Creates a subscription queue holding up to `capacity` slots.
pub(crate) fn queue<T>(capacity: usize) -> (Queue<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let trailing = Arc::new(AtomicU64::new(0));
    let queue = Queue {
        tx,
        missed: 0,
        trailing: trailing.clone(),
    };
    (queue, Subscription { rx, trailing })
}

impl<T> Queue<T> {
    fn push(&mut self, value: T) -> Delivery {
        if self.missed > 0 {
            match self.tx.try_send(Slot::Lagged(self.missed)) {
                Ok(()) => self.missed = 0,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.missed += 1;
                    return Delivery::Keep;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Delivery::Gone,
            }
        }

        match self.tx.try_send(Slot::Value(value)) {
            Ok(()) => Delivery::Keep,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.missed = 1;
                Delivery::Lagged
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        if self.missed > 0 {
            self.trailing.fetch_add(self.missed, Ordering::Release);
        }
    }
}

/// Where matching records go.
pub(crate) enum Sink<E> {
    Records(Queue<Transition<E>>),
    States(Queue<StateId>),
    Events(Queue<E>),
    Once(Option<oneshot::Sender<E>>),
    Callback(Callback<E>),
}

/// Outcome of delivering one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Keep,
    /// One-shot subscriber fired and is finished.
    Done,
    /// Receiver dropped.
    Gone,
    /// Queue full; the subscriber stays but starts missing records.
    Lagged,
    /// Callback panicked.
    Panicked,
}

/// A registered subscriber.
pub(crate) struct Subscriber<E> {
    pub(crate) id: u64,
    pub(crate) interest: Interest<E>,
    pub(crate) sink: Sink<E>,
}

impl<E: Clone + PartialEq> Subscriber<E> {
    /// Delivers a record if it matches.
    pub(crate) fn deliver(&mut self, record: &Transition<E>) -> Delivery {
        if !self.interest.matches(record) {
            return if self.is_closed() {
                Delivery::Gone
            } else {
                Delivery::Keep
            };
        }

        match &mut self.sink {
            Sink::Records(queue) => queue.push(record.clone()),
            Sink::States(queue) => queue.push(record.state),
            Sink::Events(queue) => match &record.event {
                Some(event) => queue.push(event.clone()),
                None => Delivery::Keep,
            },
            Sink::Once(slot) => match (slot.take(), &record.event) {
                (Some(tx), Some(event)) => {
                    // A dropped receiver just means nobody is waiting anymore.
                    let _ = tx.send(event.clone());
                    Delivery::Done
                }
                (Some(tx), None) => {
                    *slot = Some(tx);
                    Delivery::Keep
                }
                (None, _) => Delivery::Done,
            },
            Sink::Callback(callback) => {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(record))) {
                    Ok(()) => Delivery::Keep,
                    Err(_) => Delivery::Panicked,
                }
            }
        }
    }

    /// Hands a new subscriber its first value.
    ///
    /// Settled-state subscribers get the current state. Record subscribers
    /// get the starting record while no transition has happened yet.
    pub(crate) fn seed(&mut self, current: StateId, fresh: bool) -> Delivery {
        if let Sink::States(queue) = &mut self.sink {
            return queue.push(current);
        }
        if fresh {
            return self.deliver(&Transition::starting(current));
        }
        Delivery::Keep
    }

    fn is_closed(&self) -> bool {
        match &self.sink {
            Sink::Records(queue) => queue.is_closed(),
            Sink::States(queue) => queue.is_closed(),
            Sink::Events(queue) => queue.is_closed(),
            Sink::Once(Some(tx)) => tx.is_closed(),
            Sink::Once(None) => true,
            Sink::Callback(_) => false,
        }
    }
}

/// A stream of values published by a machine.
///
/// A subscriber that falls more than `subscriber_capacity` values behind
/// keeps its subscription but misses values. The gap is reported as
/// [`RecvError::Lagged`] at the position it occurred, after which values
/// resume. [`RecvError::Closed`] means the machine stopped.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<Slot<T>>,
    trailing: Arc<AtomicU64>,
}

impl<T> Subscription<T> {
    /// Receives the next value.
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        match self.rx.recv().await {
            Some(slot) => slot.into_result(),
            None => Err(self.closed()),
        }
    }

    /// Receives the next value if one is ready.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        match self.rx.try_recv() {
            Ok(slot) => slot.into_result().map_err(|e| match e {
                RecvError::Lagged(n) => TryRecvError::Lagged(n),
                RecvError::Closed => TryRecvError::Closed,
            }),
            Err(mpsc::error::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(mpsc::error::TryRecvError::Disconnected) => match self.closed() {
                RecvError::Lagged(n) => Err(TryRecvError::Lagged(n)),
                RecvError::Closed => Err(TryRecvError::Closed),
            },
        }
    }

    /// Blocking receive for use outside async contexts.
    ///
    /// Panics if called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Result<T, RecvError> {
        match self.rx.blocking_recv() {
            Some(slot) => slot.into_result(),
            None => Err(self.closed()),
        }
    }

    /// Receives every remaining value until the machine stops.
    ///
    /// Fails with the total number of missed values if the subscriber fell
    /// behind at any point.
    pub async fn collect(mut self) -> Result<Vec<T>, RecvError> {
        let mut values = Vec::new();
        let mut missed = 0;
        loop {
            match self.recv().await {
                Ok(value) => values.push(value),
                Err(RecvError::Lagged(n)) => missed += n,
                Err(RecvError::Closed) => break,
            }
        }
        finish(values, missed)
    }

    /// Blocking version of [`Subscription::collect`].
    pub fn blocking_collect(mut self) -> Result<Vec<T>, RecvError> {
        let mut values = Vec::new();
        let mut missed = 0;
        loop {
            match self.blocking_recv() {
                Ok(value) => values.push(value),
                Err(RecvError::Lagged(n)) => missed += n,
                Err(RecvError::Closed) => break,
            }
        }
        finish(values, missed)
    }

    /// Reports a gap left at the end of the stream, then `Closed`.
    fn closed(&self) -> RecvError {
        match self.trailing.swap(0, Ordering::Acquire) {
            0 => RecvError::Closed,
            n => RecvError::Lagged(n),
        }
    }
}

impl<T> Slot<T> {
    fn into_result(self) -> Result<T, RecvError> {
        match self {
            Slot::Value(value) => Ok(value),
            Slot::Lagged(n) => Err(RecvError::Lagged(n)),
        }
    }
}

fn finish<T>(values: Vec<T>, missed: u64) -> Result<Vec<T>, RecvError> {
    if missed > 0 {
        Err(RecvError::Lagged(missed))
    } else {
        Ok(values)
    }
}

/// A one-shot notification carrying the event that fired it.
///
/// Resolves to `Some(event)` on the first matching transition, or to `None`
/// once the machine stops without a match.
#[derive(Debug)]
pub struct Trigger<E> {
    rx: oneshot::Receiver<E>,
}

impl<E> Trigger<E> {
    pub(crate) fn new(rx: oneshot::Receiver<E>) -> Self {
        Self { rx }
    }

    /// Returns the event if the trigger already fired.
    pub fn try_fired(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Blocks until the trigger fires or the machine stops.
    pub fn blocking_wait(self) -> Option<E> {
        self.rx.blocking_recv().ok()
    }
}

impl<E> Future for Trigger<E> {
    type Output = Option<E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}
