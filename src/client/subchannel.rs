/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! A Subchannel represents a (possibly connected) transport to one backend
//! address.  Subchannels start Idle, transition to Connecting when connect()
//! is called, and to Ready on success or TransientFailure on error.  After a
//! reconnect backoff the subchannel returns to Idle; Shutdown is terminal.
//!
//! When health checking is configured, a ready transport alone does not make
//! the subchannel Ready: the health-check watcher gates readiness.

use std::fmt::{Debug, Display};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::health::{HealthCheckClient, HealthWatchFactory};
use crate::client::name_resolution::Address;
use crate::client::ConnectivityState;
use crate::rt::{BoxedTaskHandle, Runtime};
use crate::service::{Batch, ConnectedTransport, OnPingAck, StreamArgs, Transport, TransportStream};
use crate::status::Status;

/// The state of a subchannel as seen by its watchers.
#[derive(Clone, Debug, Default)]
pub struct SubchannelState {
    pub connectivity_state: ConnectivityState,
    /// Set if the state is TransientFailure, describing the most recent
    /// connection error.
    pub last_connection_error: Option<String>,
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{} ({err})", self.connectivity_state),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

// Watchers are cloneable so notifications run outside the state lock.  A
// watcher may observe one final update after unregistration; such updates
// are inconsequential.
pub(crate) type SubchannelStateWatcher = Arc<dyn Fn(SubchannelState) + Send + Sync>;

/// Health-checking configuration for subchannels created by a channel.
#[derive(Clone)]
pub struct HealthCheckOptions {
    pub service_name: String,
    pub factory: Arc<dyn HealthWatchFactory>,
}

enum Event {
    ConnectRequested,
    ConnectSucceeded(Arc<dyn ConnectedTransport>, tokio::sync::oneshot::Receiver<String>),
    ConnectFailed(String),
    ConnectionTerminated(String),
    BackoffExpired,
    HealthChanged(ConnectivityState, Option<String>),
    Shutdown,
}

impl Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectRequested => write!(f, "ConnectRequested"),
            Self::ConnectSucceeded(_, _) => write!(f, "ConnectSucceeded"),
            Self::ConnectFailed(err) => write!(f, "ConnectFailed({err})"),
            Self::ConnectionTerminated(err) => write!(f, "ConnectionTerminated({err})"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
            Self::HealthChanged(state, _) => write!(f, "HealthChanged({state})"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

pub struct Subchannel {
    address: Address,
    events: mpsc::UnboundedSender<Event>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SubchannelState,
    transport: Option<Arc<dyn ConnectedTransport>>,
    watchers: Vec<(u64, SubchannelStateWatcher)>,
    next_watch_id: u64,
    connect_task: Option<BoxedTaskHandle>,
    monitor_task: Option<BoxedTaskHandle>,
    backoff_task: Option<BoxedTaskHandle>,
    health_client: Option<HealthCheckClient>,
    backoff: ExponentialBackoff,
    shut_down: bool,
}

impl Subchannel {
    pub(crate) fn new(
        address: Address,
        transport_factory: Arc<dyn Transport>,
        runtime: Arc<dyn Runtime>,
        health: Option<HealthCheckOptions>,
    ) -> Arc<Subchannel> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        // The default connection backoff config is a compile-time constant
        // and always validates.
        let backoff = ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG)
            .unwrap_or_else(|_| unreachable!("default backoff config is valid"));
        let sc = Arc::new(Subchannel {
            address: address.clone(),
            events: tx,
            inner: Mutex::new(Inner {
                state: SubchannelState::default(),
                transport: None,
                watchers: Vec::new(),
                next_watch_id: 0,
                connect_task: None,
                monitor_task: None,
                backoff_task: None,
                health_client: None,
                backoff,
                shut_down: false,
            }),
        });

        // This long running task implements the subchannel state machine.
        // When the last sender is dropped with the subchannel, rx.recv()
        // returns None and the task exits.
        let weak = Arc::downgrade(&sc);
        runtime.clone().spawn(Box::pin(async move {
            trace!("starting subchannel state machine for {address}");
            while let Some(event) = rx.recv().await {
                let Some(sc) = weak.upgrade() else { break };
                trace!("subchannel {} received event {:?}", sc.address, event);
                let exit = matches!(event, Event::Shutdown);
                sc.handle_event(event, &transport_factory, &runtime, &health);
                if exit {
                    break;
                }
            }
        }));
        sc
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().unwrap().state.connectivity_state
    }

    /// Begins connecting the subchannel asynchronously.  A no-op in any
    /// state but Idle.
    pub fn connect(&self) {
        let _ = self.events.send(Event::ConnectRequested);
    }

    /// Creates a call (one transport stream) on the connected subchannel.
    pub(crate) fn create_call(&self, args: StreamArgs) -> Result<Arc<SubchannelCall>, Status> {
        let transport = {
            let inner = self.inner.lock().unwrap();
            if inner.state.connectivity_state != ConnectivityState::Ready {
                return Err(Status::unavailable(format!(
                    "subchannel {} is not connected",
                    self.address
                )));
            }
            inner.transport.clone()
        };
        let Some(transport) = transport else {
            return Err(Status::unavailable(format!(
                "subchannel {} has no transport",
                self.address
            )));
        };
        let stream = transport.start_stream(args)?;
        Ok(Arc::new(SubchannelCall { stream }))
    }

    pub(crate) fn ping(&self, on_ack: OnPingAck) {
        let transport = self.inner.lock().unwrap().transport.clone();
        match transport {
            Some(t) => t.ping(on_ack),
            None => on_ack(Err(Status::unavailable("subchannel is not connected"))),
        }
    }

    /// Registers a watcher, immediately notifying it of the current state.
    /// Returns a key for unregistration.
    pub(crate) fn start_connectivity_watch(&self, watcher: SubchannelStateWatcher) -> u64 {
        let (id, state) = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_watch_id;
            inner.next_watch_id += 1;
            let state = inner.state.clone();
            inner.watchers.push((id, watcher.clone()));
            (id, state)
        };
        watcher(state);
        id
    }

    pub(crate) fn stop_connectivity_watch(&self, id: u64) {
        self.inner.lock().unwrap().watchers.retain(|(wid, _)| *wid != id);
    }

    /// Shuts the subchannel down.  Terminal: aborts any connection attempt,
    /// drops the transport, and stops health checking.
    pub(crate) fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    fn handle_event(
        self: &Arc<Self>,
        event: Event,
        transport_factory: &Arc<dyn Transport>,
        runtime: &Arc<dyn Runtime>,
        health: &Option<HealthCheckOptions>,
    ) {
        match event {
            Event::ConnectRequested => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.shut_down
                        || inner.state.connectivity_state != ConnectivityState::Idle
                    {
                        return;
                    }
                    let events = self.events.clone();
                    let factory = transport_factory.clone();
                    let address = self.address.clone();
                    inner.connect_task = Some(runtime.spawn(Box::pin(async move {
                        match factory.connect(&address).await {
                            Ok(conn) => {
                                let _ = events.send(Event::ConnectSucceeded(
                                    conn.transport,
                                    conn.disconnection,
                                ));
                            }
                            Err(err) => {
                                let _ = events.send(Event::ConnectFailed(err));
                            }
                        }
                    })));
                }
                self.set_state(ConnectivityState::Connecting, None);
            }
            Event::ConnectSucceeded(transport, disconnection) => {
                let start_health = {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.shut_down {
                        return;
                    }
                    inner.connect_task = None;
                    inner.transport = Some(transport.clone());
                    inner.backoff.reset();
                    let events = self.events.clone();
                    inner.monitor_task = Some(runtime.spawn(Box::pin(async move {
                        let reason = disconnection
                            .await
                            .unwrap_or_else(|_| "transport dropped".to_string());
                        let _ = events.send(Event::ConnectionTerminated(reason));
                    })));
                    health.is_some()
                };
                if start_health {
                    // Health checking gates readiness: stay Connecting until
                    // the watcher reports SERVING.
                    let opts = health.as_ref().unwrap_or_else(|| unreachable!());
                    let events = self.events.clone();
                    let client = HealthCheckClient::new(
                        opts.service_name.clone(),
                        transport,
                        opts.factory.clone(),
                        runtime.clone(),
                        Arc::new(move |state, err| {
                            let _ = events.send(Event::HealthChanged(state, err));
                        }),
                    );
                    self.inner.lock().unwrap().health_client = Some(client);
                } else {
                    self.set_state(ConnectivityState::Ready, None);
                }
            }
            Event::HealthChanged(state, err) => {
                let gated = {
                    let inner = self.inner.lock().unwrap();
                    !inner.shut_down && inner.transport.is_some()
                };
                if gated {
                    self.set_state(state, err);
                }
            }
            Event::ConnectFailed(err) => {
                let delay = {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.shut_down {
                        return;
                    }
                    inner.connect_task = None;
                    inner.backoff.backoff_duration()
                };
                debug!("subchannel {} failed to connect: {err}", self.address);
                self.set_state(ConnectivityState::TransientFailure, Some(err));
                let events = self.events.clone();
                let rt = runtime.clone();
                let task = runtime.spawn(Box::pin(async move {
                    rt.sleep(delay).await;
                    let _ = events.send(Event::BackoffExpired);
                }));
                self.inner.lock().unwrap().backoff_task = Some(task);
            }
            Event::ConnectionTerminated(reason) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.shut_down {
                        return;
                    }
                    inner.transport = None;
                    inner.monitor_task = None;
                    inner.health_client = None;
                }
                debug!("subchannel {} lost its connection: {reason}", self.address);
                self.set_state(ConnectivityState::Idle, None);
            }
            Event::BackoffExpired => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.shut_down {
                        return;
                    }
                    inner.backoff_task = None;
                }
                self.set_state(ConnectivityState::Idle, None);
            }
            Event::Shutdown => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if inner.shut_down {
                        return;
                    }
                    inner.shut_down = true;
                    inner.transport = None;
                    inner.health_client = None;
                    for task in [
                        inner.connect_task.take(),
                        inner.monitor_task.take(),
                        inner.backoff_task.take(),
                    ]
                    .into_iter()
                    .flatten()
                    {
                        task.abort();
                    }
                }
                self.set_state(ConnectivityState::Shutdown, None);
            }
        }
    }

    fn set_state(&self, state: ConnectivityState, error: Option<String>) {
        let (watchers, new_state) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.connectivity_state == state {
                return;
            }
            let new_state = SubchannelState {
                connectivity_state: state,
                last_connection_error: error,
            };
            inner.state = new_state.clone();
            // Snapshot so the lock is released before running watchers.
            let watchers: Vec<SubchannelStateWatcher> =
                inner.watchers.iter().map(|(_, w)| w.clone()).collect();
            (watchers, new_state)
        };
        for w in watchers {
            w(new_state.clone());
        }
    }
}

impl Drop for Subchannel {
    fn drop(&mut self) {
        trace!("dropping subchannel {}", self.address);
    }
}

impl Display for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subchannel({})", self.address)
    }
}

impl Debug for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subchannel({})", self.address)
    }
}

/// One RPC attempt running on a subchannel's transport.
pub struct SubchannelCall {
    stream: Arc<dyn TransportStream>,
}

impl SubchannelCall {
    pub(crate) fn process_op(&self, batch: Batch) {
        self.stream.submit(batch);
    }

    pub(crate) fn cancel(&self, status: Status) {
        self.stream.cancel(status);
    }
}

/// An ordered set of subchannels built from an address list, with per-state
/// counters so the owning policy can answer "all subchannels are x" and
/// "any subchannel is x" in O(1).
pub(crate) struct SubchannelList {
    entries: Vec<Entry>,
    counters: [usize; 5],
}

struct Entry {
    subchannel: Arc<Subchannel>,
    state: ConnectivityState,
}

/// The list state per the aggregation rules, plus whether the owner should
/// ask the resolver to re-resolve.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ListAggregate {
    pub(crate) state: ConnectivityState,
    pub(crate) request_reresolution: bool,
}

fn counter_index(state: ConnectivityState) -> usize {
    match state {
        ConnectivityState::Idle => 0,
        ConnectivityState::Connecting => 1,
        ConnectivityState::Ready => 2,
        ConnectivityState::TransientFailure => 3,
        ConnectivityState::Shutdown => 4,
    }
}

impl SubchannelList {
    pub(crate) fn new(subchannels: Vec<Arc<Subchannel>>) -> Self {
        let mut counters = [0; 5];
        counters[counter_index(ConnectivityState::Idle)] = subchannels.len();
        SubchannelList {
            entries: subchannels
                .into_iter()
                .map(|subchannel| Entry {
                    subchannel,
                    state: ConnectivityState::Idle,
                })
                .collect(),
            counters,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, index: usize) -> &Arc<Subchannel> {
        &self.entries[index].subchannel
    }

    pub(crate) fn state_of(&self, index: usize) -> ConnectivityState {
        self.entries[index].state
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Subchannel>> {
        self.entries.iter().map(|e| &e.subchannel)
    }

    pub(crate) fn index_of(&self, subchannel: &Arc<Subchannel>) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.subchannel, subchannel))
    }

    pub(crate) fn contains(&self, subchannel: &Arc<Subchannel>) -> bool {
        self.index_of(subchannel).is_some()
    }

    /// Records a state transition for a member subchannel.  Returns the old
    /// state, or None if the subchannel is not in the list.
    pub(crate) fn update_state(
        &mut self,
        subchannel: &Arc<Subchannel>,
        state: ConnectivityState,
    ) -> Option<ConnectivityState> {
        let index = self.index_of(subchannel)?;
        let old = self.entries[index].state;
        self.entries[index].state = state;
        self.counters[counter_index(old)] -= 1;
        self.counters[counter_index(state)] += 1;
        Some(old)
    }

    pub(crate) fn num_in(&self, state: ConnectivityState) -> usize {
        self.counters[counter_index(state)]
    }

    /// The aggregate connectivity of the list:
    ///
    /// 1. Any subchannel ready => ready.
    /// 2. Else any connecting => connecting.
    /// 3. Else all shutdown => idle, and re-resolution should be requested.
    /// 4. Else all shutdown or transient_failure => transient_failure.
    ///
    /// Any other mix contains idle members that are about to be connected,
    /// which reads as connecting.
    pub(crate) fn aggregate_state(&self) -> ListAggregate {
        let total = self.entries.len();
        if self.num_in(ConnectivityState::Ready) > 0 {
            return ListAggregate {
                state: ConnectivityState::Ready,
                request_reresolution: false,
            };
        }
        if self.num_in(ConnectivityState::Connecting) > 0 {
            return ListAggregate {
                state: ConnectivityState::Connecting,
                request_reresolution: false,
            };
        }
        if total > 0 && self.num_in(ConnectivityState::Shutdown) == total {
            return ListAggregate {
                state: ConnectivityState::Idle,
                request_reresolution: true,
            };
        }
        if total > 0
            && self.num_in(ConnectivityState::Shutdown) + self.num_in(ConnectivityState::TransientFailure)
                == total
        {
            return ListAggregate {
                state: ConnectivityState::TransientFailure,
                request_reresolution: false,
            };
        }
        ListAggregate {
            state: ConnectivityState::Connecting,
            request_reresolution: false,
        }
    }

    /// Starts connecting every idle member.
    pub(crate) fn connect_all(&self) {
        for entry in &self.entries {
            if entry.state == ConnectivityState::Idle {
                entry.subchannel.connect();
            }
        }
    }

    pub(crate) fn shutdown_all(&mut self) {
        for entry in &mut self.entries {
            entry.subchannel.shutdown();
            let old = entry.state;
            entry.state = ConnectivityState::Shutdown;
            self.counters[counter_index(old)] -= 1;
            self.counters[counter_index(ConnectivityState::Shutdown)] += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::test_utils::FakeTransport;
    use crate::rt::default_runtime;
    use std::sync::Mutex as StdMutex;

    fn new_subchannel(transport: &Arc<FakeTransport>) -> Arc<Subchannel> {
        Subchannel::new(
            Address::backend("1.2.3.4:443"),
            transport.clone() as Arc<dyn Transport>,
            default_runtime(),
            None,
        )
    }

    async fn wait_for_state(sc: &Arc<Subchannel>, want: ConnectivityState) {
        for _ in 0..1000 {
            if sc.state() == want {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("subchannel never reached {want}; at {}", sc.state());
    }

    #[tokio::test]
    async fn connect_success_reaches_ready() {
        let transport = Arc::new(FakeTransport::new());
        let sc = new_subchannel(&transport);
        assert_eq!(sc.state(), ConnectivityState::Idle);

        let states = Arc::new(StdMutex::new(Vec::new()));
        let states2 = states.clone();
        sc.start_connectivity_watch(Arc::new(move |state| {
            states2.lock().unwrap().push(state.connectivity_state);
        }));

        sc.connect();
        wait_for_state(&sc, ConnectivityState::Ready).await;
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectivityState::Idle,
                ConnectivityState::Connecting,
                ConnectivityState::Ready
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_backs_off_to_idle() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_connects("nobody home");
        let sc = new_subchannel(&transport);
        sc.connect();
        wait_for_state(&sc, ConnectivityState::TransientFailure).await;
        // Idle again after the backoff expires (1s +- 20% jitter).
        tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
        wait_for_state(&sc, ConnectivityState::Idle).await;
    }

    #[tokio::test]
    async fn create_call_requires_ready() {
        let transport = Arc::new(FakeTransport::new());
        let sc = new_subchannel(&transport);
        let args = StreamArgs {
            path: "/pkg.Svc/Method".into(),
            deadline: None,
        };
        assert!(sc.create_call(args.clone()).is_err());
        sc.connect();
        wait_for_state(&sc, ConnectivityState::Ready).await;
        assert!(sc.create_call(args).is_ok());
    }

    #[tokio::test]
    async fn connection_loss_returns_to_idle() {
        let transport = Arc::new(FakeTransport::new());
        let sc = new_subchannel(&transport);
        sc.connect();
        wait_for_state(&sc, ConnectivityState::Ready).await;
        transport.kill_connections();
        wait_for_state(&sc, ConnectivityState::Idle).await;
        // A reconnect works against the same transport.
        sc.connect();
        wait_for_state(&sc, ConnectivityState::Ready).await;
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(
            &*transport.connected_addresses()[0].address,
            "1.2.3.4:443"
        );
    }

    #[tokio::test]
    async fn hung_connect_stays_connecting() {
        let transport = Arc::new(FakeTransport::new());
        transport.hang_connects();
        let sc = new_subchannel(&transport);
        sc.connect();
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sc.state(), ConnectivityState::Connecting);
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let transport = Arc::new(FakeTransport::new());
        let sc = new_subchannel(&transport);
        sc.connect();
        wait_for_state(&sc, ConnectivityState::Ready).await;
        sc.shutdown();
        wait_for_state(&sc, ConnectivityState::Shutdown).await;
        sc.connect();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(sc.state(), ConnectivityState::Shutdown);
    }

    #[tokio::test]
    async fn list_counters_and_aggregation() {
        let transport = Arc::new(FakeTransport::new());
        let scs: Vec<_> = (0..3).map(|_| new_subchannel(&transport)).collect();
        let mut list = SubchannelList::new(scs.clone());
        assert_eq!(list.num_in(ConnectivityState::Idle), 3);
        assert_eq!(
            list.aggregate_state().state,
            ConnectivityState::Connecting
        );

        list.update_state(&scs[0], ConnectivityState::Connecting);
        assert_eq!(
            list.aggregate_state().state,
            ConnectivityState::Connecting
        );

        list.update_state(&scs[0], ConnectivityState::Ready);
        assert_eq!(list.aggregate_state().state, ConnectivityState::Ready);
        assert_eq!(list.num_in(ConnectivityState::Ready), 1);

        // All members failing aggregates to transient failure.
        list.update_state(&scs[0], ConnectivityState::TransientFailure);
        list.update_state(&scs[1], ConnectivityState::TransientFailure);
        list.update_state(&scs[2], ConnectivityState::TransientFailure);
        let agg = list.aggregate_state();
        assert_eq!(agg.state, ConnectivityState::TransientFailure);
        assert!(!agg.request_reresolution);

        // All members shut down aggregates to idle with a re-resolution
        // request.
        list.shutdown_all();
        let agg = list.aggregate_state();
        assert_eq!(agg.state, ConnectivityState::Idle);
        assert!(agg.request_reresolution);
        // Counters always sum to the list size.
        let total: usize = [
            ConnectivityState::Idle,
            ConnectivityState::Connecting,
            ConnectivityState::Ready,
            ConnectivityState::TransientFailure,
            ConnectivityState::Shutdown,
        ]
        .iter()
        .map(|s| list.num_in(*s))
        .sum();
        assert_eq!(total, list.len());
    }

    #[tokio::test]
    async fn unknown_subchannel_update_is_ignored() {
        let transport = Arc::new(FakeTransport::new());
        let mut list = SubchannelList::new(vec![new_subchannel(&transport)]);
        let outsider = new_subchannel(&transport);
        assert_eq!(list.update_state(&outsider, ConnectivityState::Ready), None);
    }

    // With health checking configured, a connected transport alone does
    // not make the subchannel ready; the health watcher gates it.
    #[tokio::test]
    async fn health_checking_gates_readiness() {
        use crate::client::test_utils::FakeHealthFactory;
        use crate::client::health::ServingStatus;

        let transport = Arc::new(FakeTransport::new());
        let health = Arc::new(FakeHealthFactory::new());
        let sc = Subchannel::new(
            Address::backend("1.2.3.4:443"),
            transport.clone() as Arc<dyn Transport>,
            default_runtime(),
            Some(HealthCheckOptions {
                service_name: "pkg.Svc".to_string(),
                factory: health.clone(),
            }),
        );
        sc.connect();
        health.wait_for_streams(1).await;
        // Transport is up, health has not answered: still connecting.
        assert_eq!(sc.state(), ConnectivityState::Connecting);

        health.push_response(Ok(ServingStatus::Serving)).await;
        wait_for_state(&sc, ConnectivityState::Ready).await;

        health.push_response(Ok(ServingStatus::NotServing)).await;
        wait_for_state(&sc, ConnectivityState::TransientFailure).await;

        health.push_response(Ok(ServingStatus::Serving)).await;
        wait_for_state(&sc, ConnectivityState::Ready).await;
    }
}
