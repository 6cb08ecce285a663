//! State machine handle and its processing lane.
//!
//! Events, subscription requests and shutdown all travel through one ordered
//! command channel into the lane. The lane is the only place the current
//! state is read or written, and the only place records are fanned out.

use crate::config::{LaneKind, MachineConfig};
use crate::error::MachineError;
use crate::graph::{Event, StateGraph, StateId, Supplier};
use crate::record::{Phase, Transition};
use crate::subscription::{queue, Delivery, Interest, Sink, Subscriber, Subscription, Trigger};
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// How [`StateMachine::shutdown`] treats events already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Process every event queued before the shutdown, then stop.
    Graceful,
    /// Stop after the in-flight event and drop everything still queued.
    Immediate,
}

enum Command<E> {
    Event(E),
    Subscribe(Subscriber<E>),
    Shutdown,
}

/// A reactive state machine driven by a serialized event lane.
///
/// ```
/// use statelane_core::{ShutdownMode, StateGraph, StateMachine};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), statelane_core::MachineError> {
/// let mut graph = StateGraph::new();
/// let view = graph.add_state("VIEW");
/// let adding = graph.add_state("ADDING");
/// graph[view].transition("ADD", adding);
/// graph[adding].transition("DONE", view);
///
/// let machine = StateMachine::new(graph, view)?;
/// let mut current = machine.current();
/// let trigger = machine.enter_trigger(adding);
///
/// machine.accept("ADD");
/// assert_eq!(current.recv().await, Ok(view));
/// assert_eq!(current.recv().await, Ok(adding));
/// assert_eq!(trigger.await, Some("ADD"));
///
/// machine.shutdown(ShutdownMode::Graceful);
/// machine.closed().await;
/// # Ok(())
/// # }
/// ```
pub struct StateMachine<E> {
    name: String,
    graph: Arc<StateGraph<E>>,
    commands: mpsc::UnboundedSender<Command<E>>,
    settled: watch::Receiver<StateId>,
    /// Open until shutdown. Held for reading while an event is sent, so no
    /// accepted event can land behind the shutdown command.
    accepting: RwLock<bool>,
    halted: Arc<AtomicBool>,
    next_subscriber: AtomicU64,
    subscriber_capacity: usize,
}

impl<E: Event> StateMachine<E> {
    /// Creates a machine with the default configuration.
    pub fn new(graph: StateGraph<E>, initial: impl Supplier) -> Result<Self, MachineError> {
        Self::with_config(graph, initial, MachineConfig::default())
    }

    /// Creates a machine and starts its lane.
    ///
    /// The initial state is settled before this returns. Record subscribers
    /// registered before the first transition receive the starting record.
    pub fn with_config(
        graph: StateGraph<E>,
        initial: impl Supplier,
        config: MachineConfig,
    ) -> Result<Self, MachineError> {
        graph.validate()?;
        let initial = graph.check(initial.get())?;

        let runtime = match (config.lane, tokio::runtime::Handle::try_current()) {
            (LaneKind::Thread, _) | (LaneKind::Auto, Err(_)) => None,
            (LaneKind::Task, Err(_)) => return Err(MachineError::NoRuntime),
            (LaneKind::Task | LaneKind::Auto, Ok(handle)) => Some(handle),
        };

        let graph = Arc::new(graph);
        let (commands, rx) = mpsc::unbounded_channel();
        let (settled_tx, settled) = watch::channel(initial);
        let halted = Arc::new(AtomicBool::new(false));

        tracing::info!("[{}] Started in [{}]", config.name, graph.name(initial));
        let lane = Lane {
            name: config.name.clone(),
            graph: graph.clone(),
            current: initial,
            seq: 0,
            subscribers: Vec::new(),
            settled: settled_tx,
            halted: halted.clone(),
        };

        match runtime {
            Some(handle) => {
                handle.spawn(lane.run(rx));
            }
            None => {
                std::thread::Builder::new()
                    .name(format!("statelane-{}", config.name))
                    .spawn(move || lane.run_blocking(rx))?;
            }
        }

        Ok(Self {
            name: config.name,
            graph,
            commands,
            settled,
            accepting: RwLock::new(true),
            halted,
            next_subscriber: AtomicU64::new(1),
            subscriber_capacity: config.subscriber_capacity.max(1),
        })
    }

    /// Enqueues an event and returns immediately.
    ///
    /// Events for which the current state has no successor are logged and
    /// dropped by the lane. Events sent after shutdown are logged and dropped.
    pub fn accept(&self, event: E) {
        if let Err(e) = self.try_accept(event) {
            tracing::warn!("[{}] Dropping event: {}", self.name, e);
        }
    }

    /// Enqueues an event, reporting whether the machine still accepts events.
    ///
    /// `Ok` only means the event was queued, not that it is valid. An event
    /// that returns `Ok` is always queued ahead of any shutdown, so a graceful
    /// shutdown processes it.
    pub fn try_accept(&self, event: E) -> Result<(), MachineError> {
        let accepting = self.accepting.read();
        if !*accepting {
            return Err(self.closed_error());
        }
        self.commands
            .send(Command::Event(event))
            .map_err(|_| self.closed_error())
    }

    /// Stream of settled states: the state current when the subscription is
    /// registered, then every state entered afterwards.
    pub fn current(&self) -> Subscription<StateId> {
        let (queue, subscription) = queue(self.subscriber_capacity);
        self.register(Interest::Settled, Sink::States(queue));
        subscription
    }

    /// Every record published after the subscription is registered, led by
    /// the starting record if no transition has happened yet.
    pub fn records(&self) -> Subscription<Transition<E>> {
        let (queue, subscription) = queue(self.subscriber_capacity);
        self.register(Interest::All, Sink::Records(queue));
        subscription
    }

    /// Runs `callback` on the lane for every record, starting the same way
    /// as [`StateMachine::records`]. Nothing is ever dropped.
    ///
    /// A callback that panics is removed; the lane and other subscribers
    /// carry on.
    pub fn observe<F>(&self, callback: F)
    where
        F: FnMut(&Transition<E>) + Send + 'static,
    {
        self.register(Interest::All, Sink::Callback(Box::new(callback)));
    }

    /// Fires once, on the first transition into `state`.
    pub fn enter_trigger(&self, state: impl Supplier) -> Trigger<E> {
        self.trigger(state.get(), Phase::Entering, None)
    }

    /// Fires once, on the first transition into `state` caused by `event`.
    pub fn enter_trigger_on(&self, state: impl Supplier, event: E) -> Trigger<E> {
        self.trigger(state.get(), Phase::Entering, Some(event))
    }

    /// Fires once, on the first transition out of `state`.
    pub fn exit_trigger(&self, state: impl Supplier) -> Trigger<E> {
        self.trigger(state.get(), Phase::Exiting, None)
    }

    /// Fires once, on the first transition out of `state` caused by `event`.
    pub fn exit_trigger_on(&self, state: impl Supplier, event: E) -> Trigger<E> {
        self.trigger(state.get(), Phase::Exiting, Some(event))
    }

    /// The triggering event of every transition into `state`.
    pub fn entering(&self, state: impl Supplier) -> Subscription<E> {
        self.edges(state.get(), Phase::Entering)
    }

    /// The triggering event of every transition out of `state`.
    pub fn exiting(&self, state: impl Supplier) -> Subscription<E> {
        self.edges(state.get(), Phase::Exiting)
    }

    /// Latest settled state.
    pub fn state(&self) -> StateId {
        *self.settled.borrow()
    }

    /// Display name of the latest settled state.
    pub fn state_name(&self) -> &str {
        self.graph.name(self.state())
    }

    pub fn graph(&self) -> &StateGraph<E> {
        &self.graph
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting events and tells the lane to stop.
    ///
    /// When the lane stops, every subscription stream ends and pending
    /// triggers resolve to `None`.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let mut accepting = self.accepting.write();
        *accepting = false;
        if mode == ShutdownMode::Immediate {
            self.halted.store(true, Ordering::Release);
        }
        tracing::info!("[{}] Shutdown requested ({:?})", self.name, mode);
        // Send fails only if the lane already stopped.
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Returns false once the lane has stopped.
    pub fn is_running(&self) -> bool {
        self.settled.has_changed().is_ok()
    }

    /// Waits until the lane has stopped.
    pub async fn closed(&self) {
        let mut settled = self.settled.clone();
        while settled.changed().await.is_ok() {}
    }

    fn trigger(&self, state: StateId, phase: Phase, event: Option<E>) -> Trigger<E> {
        self.warn_foreign(state);
        let (tx, rx) = oneshot::channel();
        self.register(
            Interest::Edge {
                state,
                phase,
                event,
            },
            Sink::Once(Some(tx)),
        );
        Trigger::new(rx)
    }

    fn edges(&self, state: StateId, phase: Phase) -> Subscription<E> {
        self.warn_foreign(state);
        let (queue, subscription) = queue(self.subscriber_capacity);
        self.register(
            Interest::Edge {
                state,
                phase,
                event: None,
            },
            Sink::Events(queue),
        );
        subscription
    }

    fn register(&self, interest: Interest<E>, sink: Sink<E>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let subscriber = Subscriber { id, interest, sink };
        // If the lane is gone the sink is dropped here and the stream ends.
        let _ = self.commands.send(Command::Subscribe(subscriber));
    }

    fn warn_foreign(&self, state: StateId) {
        if !self.graph.contains(state) {
            tracing::warn!(
                "[{}] Subscribing to unknown state {}; it will never match",
                self.name,
                state
            );
        }
    }

    fn closed_error(&self) -> MachineError {
        MachineError::Closed {
            machine: self.name.clone(),
        }
    }
}

/// The serialized processing lane. Owns the current state and subscribers.
struct Lane<E> {
    name: String,
    graph: Arc<StateGraph<E>>,
    current: StateId,
    seq: u64,
    subscribers: Vec<Subscriber<E>>,
    settled: watch::Sender<StateId>,
    halted: Arc<AtomicBool>,
}

impl<E: Event> Lane<E> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<E>>) {
        while let Some(command) = rx.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.stop(rx);
    }

    fn run_blocking(mut self, mut rx: mpsc::UnboundedReceiver<Command<E>>) {
        while let Some(command) = rx.blocking_recv() {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.stop(rx);
    }

    fn handle(&mut self, command: Command<E>) -> ControlFlow<()> {
        if self.halted.load(Ordering::Acquire) {
            return ControlFlow::Break(());
        }
        match command {
            Command::Event(event) => self.apply(event),
            Command::Subscribe(subscriber) => self.subscribe(subscriber),
            Command::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn apply(&mut self, event: E) {
        tracing::debug!("[{}] ({:?}) *EVENT*", self.name, event);

        let from = self.current;
        let Some(to) = self.graph[from].next(&event) else {
            tracing::error!(
                "[{}] ({:?}) [{}] -> [NULL]: invalid event for state, ignoring",
                self.name,
                event,
                self.graph.name(from)
            );
            return;
        };

        tracing::info!(
            "[{}] ({:?}) [{}] -> [{}]",
            self.name,
            event,
            self.graph.name(from),
            self.graph.name(to)
        );

        let exiting = self.record(from, Phase::Exiting, event.clone());
        self.publish(&exiting);
        self.current = to;
        let entering = self.record(to, Phase::Entering, event);
        self.publish(&entering);
        self.settled.send_replace(to);
    }

    fn record(&mut self, state: StateId, phase: Phase, event: E) -> Transition<E> {
        self.seq += 1;
        Transition {
            seq: self.seq,
            state,
            phase,
            event: Some(event),
        }
    }

    fn publish(&mut self, record: &Transition<E>) {
        let name = &self.name;
        self.subscribers
            .retain_mut(|subscriber| retain(name, subscriber.id, subscriber.deliver(record)));
    }

    fn subscribe(&mut self, mut subscriber: Subscriber<E>) {
        tracing::debug!("[{}] Subscriber {} registered", self.name, subscriber.id);
        let delivery = subscriber.seed(self.current, self.seq == 0);
        if retain(&self.name, subscriber.id, delivery) {
            self.subscribers.push(subscriber);
        }
    }

    fn stop(self, mut rx: mpsc::UnboundedReceiver<Command<E>>) {
        rx.close();
        let mut dropped = 0usize;
        while let Ok(command) = rx.try_recv() {
            if matches!(command, Command::Event(_)) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!("[{}] Dropped {} queued events", self.name, dropped);
        }

        tracing::info!(
            "[{}] Stopped in [{}], releasing {} subscribers",
            self.name,
            self.graph.name(self.current),
            self.subscribers.len()
        );
    }
}

fn retain(machine: &str, id: u64, delivery: Delivery) -> bool {
    match delivery {
        Delivery::Keep => true,
        Delivery::Done | Delivery::Gone => false,
        Delivery::Lagged => {
            tracing::warn!("[{}] Subscriber {} fell behind, dropping records", machine, id);
            true
        }
        Delivery::Panicked => {
            tracing::error!("[{}] Observer {} panicked, removing", machine, id);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecvError;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Ev {
        Add,
        Done,
        Delete,
    }

    fn editor_graph() -> (StateGraph<Ev>, StateId, StateId) {
        let mut graph = StateGraph::new();
        let view = graph.add_state("VIEW");
        let adding = graph.add_state("ADDING");
        graph[view].transition(Ev::Add, adding);
        graph[adding].transition(Ev::Done, view);
        (graph, view, adding)
    }

    fn exit(seq: u64, state: StateId, event: Ev) -> Transition<Ev> {
        Transition {
            seq,
            state,
            phase: Phase::Exiting,
            event: Some(event),
        }
    }

    fn start(state: StateId) -> Transition<Ev> {
        Transition {
            seq: 0,
            state,
            phase: Phase::Starting,
            event: None,
        }
    }

    fn enter(seq: u64, state: StateId, event: Ev) -> Transition<Ev> {
        Transition {
            seq,
            state,
            phase: Phase::Entering,
            event: Some(event),
        }
    }

    #[tokio::test]
    async fn test_valid_transitions_publish_exit_then_enter() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let records = machine.records();
        let current = machine.current();

        machine.accept(Ev::Add);
        machine.accept(Ev::Done);
        machine.shutdown(ShutdownMode::Graceful);

        assert_eq!(
            records.collect().await.unwrap(),
            vec![
                start(view),
                exit(1, view, Ev::Add),
                enter(2, adding, Ev::Add),
                exit(3, adding, Ev::Done),
                enter(4, view, Ev::Done),
            ]
        );
        assert_eq!(current.collect().await.unwrap(), vec![view, adding, view]);
        machine.closed().await;
        assert_eq!(machine.state(), view);
        assert!(!machine.is_running());
    }

    #[tokio::test]
    async fn test_invalid_event_is_dropped() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let records = machine.records();
        let current = machine.current();

        machine.accept(Ev::Done);
        machine.accept(Ev::Delete);
        machine.accept(Ev::Add);
        machine.shutdown(ShutdownMode::Graceful);

        assert_eq!(
            records.collect().await.unwrap(),
            vec![start(view), exit(1, view, Ev::Add), enter(2, adding, Ev::Add)]
        );
        assert_eq!(current.collect().await.unwrap(), vec![view, adding]);
        machine.closed().await;
        assert_eq!(machine.state_name(), "ADDING");
    }

    #[tokio::test]
    async fn test_enter_trigger_fires_once() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let trigger = machine.enter_trigger(adding);
        let entering = machine.entering(adding);

        machine.accept(Ev::Add);
        machine.accept(Ev::Done);
        machine.accept(Ev::Add);
        machine.shutdown(ShutdownMode::Graceful);

        assert_eq!(trigger.await, Some(Ev::Add));
        assert_eq!(entering.collect().await.unwrap(), vec![Ev::Add, Ev::Add]);
    }

    #[tokio::test]
    async fn test_trigger_skips_non_matching_transitions() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let back_to_view = machine.enter_trigger_on(view, Ev::Done);
        let leave_adding = machine.exit_trigger(adding);
        let never = machine.exit_trigger_on(view, Ev::Done);

        machine.accept(Ev::Add);
        machine.accept(Ev::Done);
        machine.shutdown(ShutdownMode::Graceful);

        assert_eq!(back_to_view.await, Some(Ev::Done));
        assert_eq!(leave_adding.await, Some(Ev::Done));
        assert_eq!(never.await, None);
    }

    #[tokio::test]
    async fn test_exiting_stream_repeats() {
        let (graph, view, _) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let exiting = machine.exiting(view);

        for _ in 0..3 {
            machine.accept(Ev::Add);
            machine.accept(Ev::Done);
        }
        machine.shutdown(ShutdownMode::Graceful);

        assert_eq!(exiting.collect().await.unwrap(), vec![Ev::Add; 3]);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_current_state_first() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();

        machine.accept(Ev::Add);
        let mut current = machine.current();
        assert_eq!(current.recv().await, Ok(adding));

        machine.accept(Ev::Done);
        assert_eq!(current.recv().await, Ok(view));
    }

    #[tokio::test]
    async fn test_late_records_subscriber_skips_starting_record() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let early = machine.records();

        machine.accept(Ev::Add);
        let late = machine.records();
        machine.accept(Ev::Done);
        machine.shutdown(ShutdownMode::Graceful);

        let early = early.collect().await.unwrap();
        assert_eq!(early.first(), Some(&start(view)));
        assert_eq!(early.len(), 5);
        assert_eq!(
            late.collect().await.unwrap(),
            vec![exit(3, adding, Ev::Done), enter(4, view, Ev::Done)]
        );
    }

    #[tokio::test]
    async fn test_initial_state_settled_on_construction() {
        let (graph, view, _) = editor_graph();
        let machine = StateMachine::new(graph, move || view).unwrap();
        assert_eq!(machine.state(), view);
        assert_eq!(machine.state_name(), "VIEW");
        assert!(machine.is_running());
    }

    #[tokio::test]
    async fn test_panicking_observer_is_isolated() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        machine.observe(|_| panic!("observer failure"));
        let sink = seen.clone();
        machine.observe(move |record| sink.lock().unwrap().push(record.seq));
        let current = machine.current();

        machine.accept(Ev::Add);
        machine.accept(Ev::Done);
        machine.shutdown(ShutdownMode::Graceful);

        assert_eq!(current.collect().await.unwrap(), vec![view, adding, view]);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_lag_and_resumes() {
        let (graph, view, adding) = editor_graph();
        let config = MachineConfig::named("slow").with_subscriber_capacity(4);
        let machine = StateMachine::with_config(graph, view, config).unwrap();
        let mut slow = machine.records();

        machine.accept(Ev::Add);
        machine.accept(Ev::Done);
        let third = machine.enter_trigger(adding);
        machine.accept(Ev::Add);
        assert_eq!(third.await, Some(Ev::Add));

        // Starting record plus three transition records filled the queue.
        assert_eq!(slow.recv().await, Ok(start(view)));
        assert_eq!(slow.recv().await, Ok(exit(1, view, Ev::Add)));
        assert_eq!(slow.recv().await, Ok(enter(2, adding, Ev::Add)));
        assert_eq!(slow.recv().await, Ok(exit(3, adding, Ev::Done)));

        machine.accept(Ev::Done);
        machine.shutdown(ShutdownMode::Graceful);
        machine.closed().await;

        assert_eq!(slow.recv().await, Err(RecvError::Lagged(3)));
        assert_eq!(slow.recv().await, Ok(exit(7, adding, Ev::Done)));
        assert_eq!(slow.recv().await, Ok(enter(8, view, Ev::Done)));
        assert_eq!(slow.recv().await, Err(RecvError::Closed));
    }

    #[tokio::test]
    async fn test_unpolled_streams_report_lag_above_capacity() {
        let (graph, view, adding) = editor_graph();
        let config = MachineConfig::named("burst").with_subscriber_capacity(16);
        let machine = StateMachine::with_config(graph, view, config).unwrap();
        let mut entering = machine.entering(adding);
        let current = machine.current();
        let count = Arc::new(Mutex::new(0usize));
        let counter = count.clone();
        machine.observe(move |record| {
            if record.phase == Phase::Entering {
                *counter.lock().unwrap() += 1;
            }
        });

        for _ in 0..40 {
            machine.accept(Ev::Add);
            machine.accept(Ev::Done);
        }
        machine.shutdown(ShutdownMode::Graceful);
        machine.closed().await;

        for _ in 0..16 {
            assert_eq!(entering.recv().await, Ok(Ev::Add));
        }
        assert_eq!(entering.recv().await, Err(RecvError::Lagged(24)));
        assert_eq!(entering.recv().await, Err(RecvError::Closed));

        // Seed plus 80 entered states, 16 of which fit.
        assert_eq!(current.collect().await, Err(RecvError::Lagged(65)));
        assert_eq!(*count.lock().unwrap(), 80);
        assert_eq!(machine.state(), view);
    }

    #[tokio::test]
    async fn test_accept_after_shutdown_is_rejected() {
        let (graph, view, _) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();

        machine.shutdown(ShutdownMode::Graceful);
        let result = machine.try_accept(Ev::Add);
        assert!(matches!(result, Err(MachineError::Closed { .. })));

        // Fire-and-forget accept only logs.
        machine.accept(Ev::Add);
        machine.closed().await;
        assert_eq!(machine.state(), view);
    }

    #[tokio::test]
    async fn test_subscription_after_stop_ends_immediately() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        machine.shutdown(ShutdownMode::Graceful);
        machine.closed().await;

        assert!(machine.current().collect().await.unwrap().is_empty());
        assert_eq!(machine.enter_trigger(adding).await, None);
    }

    #[tokio::test]
    async fn test_dropping_machine_releases_subscribers() {
        let (graph, view, adding) = editor_graph();
        let machine = StateMachine::new(graph, view).unwrap();
        let current = machine.current();
        machine.accept(Ev::Add);
        drop(machine);

        assert_eq!(current.collect().await.unwrap(), vec![view, adding]);
    }

    #[test]
    fn test_immediate_shutdown_keeps_pairs_intact() {
        let (graph, view, _) = editor_graph();
        let config = MachineConfig::named("immediate")
            .with_lane(LaneKind::Thread)
            .with_subscriber_capacity(4096);
        let machine = StateMachine::with_config(graph, view, config).unwrap();
        let records = machine.records();
        let never = machine.enter_trigger_on(view, Ev::Delete);

        for _ in 0..500 {
            machine.accept(Ev::Add);
            machine.accept(Ev::Done);
        }
        machine.shutdown(ShutdownMode::Immediate);

        let records = records.blocking_collect().unwrap();
        assert_eq!(records[0], start(view));
        let records = &records[1..];
        assert!(records.len() <= 2000);
        assert_eq!(records.len() % 2, 0);
        for pair in records.chunks(2) {
            assert_eq!(pair[0].phase, Phase::Exiting);
            assert_eq!(pair[1].phase, Phase::Entering);
            assert_eq!(pair[0].event, pair[1].event);
        }
        assert_eq!(never.blocking_wait(), None);
    }

    #[test]
    fn test_concurrent_accept_is_serialized() {
        let (graph, view, adding) = editor_graph();
        let config = MachineConfig::named("concurrent")
            .with_lane(LaneKind::Thread)
            .with_subscriber_capacity(8192);
        let machine = Arc::new(StateMachine::with_config(graph, view, config).unwrap());
        let records = machine.records();
        let current = machine.current();

        let producers: Vec<_> = (0..4)
            .map(|i| {
                let machine = machine.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        machine.accept(if i % 2 == 0 { Ev::Add } else { Ev::Done });
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        machine.shutdown(ShutdownMode::Graceful);

        let records = records.blocking_collect().unwrap();
        assert_eq!(records[0], start(view));
        let records = &records[1..];
        let mut expected_from = view;
        for (i, pair) in records.chunks(2).enumerate() {
            let (out, into) = (&pair[0], &pair[1]);
            assert_eq!(out.seq, 2 * i as u64 + 1);
            assert_eq!((out.phase, into.phase), (Phase::Exiting, Phase::Entering));
            assert_eq!(out.event, into.event);
            assert_eq!(out.state, expected_from);
            let event = out.event.unwrap();
            assert_eq!(machine.graph()[out.state].next(&event), Some(into.state));
            expected_from = into.state;
        }

        let settled = current.blocking_collect().unwrap();
        assert_eq!(settled[0], view);
        for step in settled.windows(2) {
            assert!(
                (step[0] == view && step[1] == adding) || (step[0] == adding && step[1] == view)
            );
        }
        assert_eq!(settled.len(), records.len() / 2 + 1);
    }

    #[test]
    fn test_accepted_events_are_never_lost_to_shutdown() {
        let mut graph = StateGraph::new();
        let view = graph.add_state("VIEW");
        graph[view].transition(Ev::Add, view);
        let config = MachineConfig::named("race").with_lane(LaneKind::Thread);
        let machine = Arc::new(StateMachine::with_config(graph, view, config).unwrap());

        let processed = Arc::new(AtomicU64::new(0));
        let counter = processed.clone();
        machine.observe(move |record| {
            if record.phase == Phase::Entering {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        let stopped = machine.enter_trigger_on(view, Ev::Delete);

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let machine = machine.clone();
                std::thread::spawn(move || {
                    let mut ok = 0u64;
                    for _ in 0..20_000 {
                        if machine.try_accept(Ev::Add).is_err() {
                            break;
                        }
                        ok += 1;
                    }
                    ok
                })
            })
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(2));
        machine.shutdown(ShutdownMode::Graceful);

        let accepted: u64 = producers.into_iter().map(|p| p.join().unwrap()).sum();
        assert_eq!(stopped.blocking_wait(), None);
        assert_eq!(processed.load(Ordering::Relaxed), accepted);
    }

    #[test]
    fn test_task_lane_requires_runtime() {
        let (graph, view, _) = editor_graph();
        let config = MachineConfig::default().with_lane(LaneKind::Task);
        let result = StateMachine::with_config(graph, view, config);
        assert!(matches!(result, Err(MachineError::NoRuntime)));
    }

    #[test]
    fn test_unknown_initial_state_rejected() {
        let (graph, _, _) = editor_graph();
        let (mut other, _, _) = editor_graph();
        let foreign = other.add_state("FOREIGN");

        let result = StateMachine::new(graph, foreign);
        assert!(matches!(
            result,
            Err(MachineError::UnknownState { index: 2, len: 2 })
        ));
    }
}
