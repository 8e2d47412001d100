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

//! Test doubles for the seams the core consumes: the stream transport, the
//! health-check protocol, and the balancer protocol, plus harness pieces
//! for driving LB policies directly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::client::health::{HealthWatchFactory, HealthWatchStream, ServingStatus};
use crate::client::load_balancing::grpclb::{
    BalanceLoadReceiver, BalanceLoadSender, BalancerChannelFactory, BalancerMessage, ClientStats,
    ConnectBalancerFuture,
};
use crate::client::load_balancing::{
    LbPolicyOptions, PickCompletion, PickOutcome, PickState, PolicyController, WorkScheduler,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::Subchannel;
use crate::client::ConnectivityState;
use crate::metadata::Metadata;
use crate::rt::{default_runtime, Runtime};
use crate::service::{
    Batch, BatchOutcome, ConnectFuture, ConnectedTransport, OnPingAck, OpSet, RecvInitialMetadata,
    StreamArgs, Transport, TransportConnection, TransportStream,
};
use crate::status::Status;

/// Yields enough times for spawned tasks and combiner hops to settle.
pub(crate) async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

// ===== stream transport fakes =====

/// What a fake stream does with submitted batches.
pub(crate) enum StreamBehavior {
    /// Answer receives from a scripted response.
    Respond(ScriptedResponse),
    /// Fail every op with a transport-level error.
    TransportError(Status),
    /// Hold batches until the stream is cancelled or completed manually.
    Hang,
}

#[derive(Clone)]
pub(crate) struct ScriptedResponse {
    /// None produces a Trailers-Only response.
    pub(crate) initial_metadata: Option<Metadata>,
    pub(crate) messages: Vec<Bytes>,
    pub(crate) status: Status,
}

impl ScriptedResponse {
    /// A Trailers-Only response carrying only a status.
    pub(crate) fn status_only(status: Status) -> Self {
        ScriptedResponse {
            initial_metadata: None,
            messages: Vec::new(),
            status,
        }
    }

    /// A normal unary response: initial metadata, one message, OK status.
    pub(crate) fn ok_unary(message: Bytes) -> Self {
        ScriptedResponse {
            initial_metadata: Some(Metadata::new()),
            messages: vec![message],
            status: Status::ok(),
        }
    }
}

pub(crate) struct FakeStream {
    inner: Mutex<FakeStreamInner>,
}

struct FakeStreamInner {
    behavior: StreamBehavior,
    message_cursor: usize,
    held: Vec<Batch>,
    submitted_ops: Vec<OpSet>,
    cancelled: Option<Status>,
}

impl FakeStream {
    fn new(behavior: StreamBehavior) -> Self {
        FakeStream {
            inner: Mutex::new(FakeStreamInner {
                behavior,
                message_cursor: 0,
                held: Vec::new(),
                submitted_ops: Vec::new(),
                cancelled: None,
            }),
        }
    }

    pub(crate) fn submitted_ops(&self) -> Vec<OpSet> {
        self.inner.lock().unwrap().submitted_ops.clone()
    }

    pub(crate) fn cancelled_with(&self) -> Option<Status> {
        self.inner.lock().unwrap().cancelled.clone()
    }

    fn respond(batch: &mut Batch, script: &ScriptedResponse, message: Option<Bytes>) {
        if let Some(cb) = batch.on_initial_metadata.take() {
            cb(Ok(RecvInitialMetadata {
                metadata: script.initial_metadata.clone().unwrap_or_default(),
                trailers_only: script.initial_metadata.is_none(),
            }));
        }
        if let Some(cb) = batch.on_message.take() {
            cb(Ok(message));
        }
        if let Some(cb) = batch.on_complete.take() {
            let wants_trailing = batch.recv_trailing_metadata;
            let mut trailing = Metadata::new();
            script.status.to_trailing_metadata(&mut trailing);
            cb(BatchOutcome {
                result: Ok(()),
                rpc_status: wants_trailing.then(|| script.status.clone()),
                trailing_metadata: wants_trailing.then_some(trailing),
            });
        }
    }

    fn fail(batch: &mut Batch, status: &Status) {
        if let Some(cb) = batch.on_initial_metadata.take() {
            cb(Err(status.clone()));
        }
        if let Some(cb) = batch.on_message.take() {
            cb(Err(status.clone()));
        }
        if let Some(cb) = batch.on_complete.take() {
            cb(BatchOutcome::failed(status.clone()));
        }
    }
}

impl TransportStream for FakeStream {
    fn submit(&self, mut batch: Batch) {
        enum Action {
            Respond(ScriptedResponse, Option<Bytes>),
            Fail(Status),
            Hold,
        }
        let action = {
            let mut inner = self.inner.lock().unwrap();
            inner.submitted_ops.push(batch.ops());
            if let Some(status) = &inner.cancelled {
                Action::Fail(status.clone())
            } else {
                match &inner.behavior {
                    StreamBehavior::Hang => Action::Hold,
                    StreamBehavior::TransportError(status) => Action::Fail(status.clone()),
                    StreamBehavior::Respond(script) => {
                        let message = if batch.recv_message {
                            script.messages.get(inner.message_cursor).cloned()
                        } else {
                            None
                        };
                        let advance = message.is_some() && batch.recv_message;
                        let action = Action::Respond(script.clone(), message);
                        if advance {
                            inner.message_cursor += 1;
                        }
                        action
                    }
                }
            }
        };
        // Callbacks run outside the stream lock: they re-enter the call
        // combiner and may submit more batches to this stream.
        match action {
            Action::Hold => self.inner.lock().unwrap().held.push(batch),
            Action::Fail(status) => Self::fail(&mut batch, &status),
            Action::Respond(script, message) => Self::respond(&mut batch, &script, message),
        }
    }

    fn cancel(&self, status: Status) {
        let held = {
            let mut inner = self.inner.lock().unwrap();
            inner.cancelled = Some(status.clone());
            std::mem::take(&mut inner.held)
        };
        for mut batch in held {
            Self::fail(&mut batch, &status);
        }
    }
}

pub(crate) struct FakeConnectedTransport {
    inner: Mutex<ConnectedInner>,
}

struct ConnectedInner {
    scripts: VecDeque<StreamBehavior>,
    streams: Vec<Arc<FakeStream>>,
    pings: usize,
}

impl FakeConnectedTransport {
    pub(crate) fn new() -> Self {
        FakeConnectedTransport {
            inner: Mutex::new(ConnectedInner {
                scripts: VecDeque::new(),
                streams: Vec::new(),
                pings: 0,
            }),
        }
    }

    /// Queues the behavior for the next started stream.
    pub(crate) fn script(&self, behavior: StreamBehavior) {
        self.inner.lock().unwrap().scripts.push_back(behavior);
    }

    pub(crate) fn streams_started(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    pub(crate) fn stream(&self, index: usize) -> Arc<FakeStream> {
        self.inner.lock().unwrap().streams[index].clone()
    }

    pub(crate) fn pings(&self) -> usize {
        self.inner.lock().unwrap().pings
    }
}

impl ConnectedTransport for FakeConnectedTransport {
    fn start_stream(&self, _args: StreamArgs) -> Result<Arc<dyn TransportStream>, Status> {
        let mut inner = self.inner.lock().unwrap();
        let behavior = inner.scripts.pop_front().unwrap_or(StreamBehavior::Hang);
        let stream = Arc::new(FakeStream::new(behavior));
        inner.streams.push(stream.clone());
        Ok(stream)
    }

    fn ping(&self, on_ack: OnPingAck) {
        self.inner.lock().unwrap().pings += 1;
        on_ack(Ok(()));
    }
}

/// A transport factory whose connections succeed instantly against one
/// shared [`FakeConnectedTransport`].
pub(crate) struct FakeTransport {
    pub(crate) connected: Arc<FakeConnectedTransport>,
    inner: Arc<Mutex<TransportInner>>,
}

#[derive(Default)]
struct TransportInner {
    fail: Option<String>,
    hang: bool,
    connects: Vec<Address>,
    disconnectors: Vec<oneshot::Sender<String>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        FakeTransport {
            connected: Arc::new(FakeConnectedTransport::new()),
            inner: Arc::default(),
        }
    }

    pub(crate) fn fail_connects(&self, reason: &str) {
        self.inner.lock().unwrap().fail = Some(reason.to_string());
    }

    pub(crate) fn hang_connects(&self) {
        self.inner.lock().unwrap().hang = true;
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.inner.lock().unwrap().connects.len()
    }

    pub(crate) fn connected_addresses(&self) -> Vec<Address> {
        self.inner.lock().unwrap().connects.clone()
    }

    /// Terminates every established connection.
    pub(crate) fn kill_connections(&self) {
        let senders = std::mem::take(&mut self.inner.lock().unwrap().disconnectors);
        for sender in senders {
            let _ = sender.send("connection killed".to_string());
        }
    }
}

impl Transport for FakeTransport {
    fn connect(&self, address: &Address) -> ConnectFuture {
        let inner = self.inner.clone();
        let connected = self.connected.clone();
        let address = address.clone();
        Box::pin(async move {
            let (fail, hang) = {
                let mut inner = inner.lock().unwrap();
                inner.connects.push(address);
                (inner.fail.clone(), inner.hang)
            };
            if hang {
                std::future::pending::<()>().await;
            }
            if let Some(reason) = fail {
                return Err(reason);
            }
            let (tx, rx) = oneshot::channel();
            inner.lock().unwrap().disconnectors.push(tx);
            Ok(TransportConnection {
                transport: connected as Arc<dyn ConnectedTransport>,
                disconnection: rx,
            })
        })
    }
}

// ===== health fakes =====

pub(crate) struct FakeHealthFactory {
    inner: Arc<Mutex<HealthInner>>,
}

struct HealthInner {
    streams_started: usize,
    current: Option<mpsc::UnboundedSender<Result<ServingStatus, Status>>>,
}

impl FakeHealthFactory {
    pub(crate) fn new() -> Self {
        FakeHealthFactory {
            inner: Arc::new(Mutex::new(HealthInner {
                streams_started: 0,
                current: None,
            })),
        }
    }

    pub(crate) fn streams_started(&self) -> usize {
        self.inner.lock().unwrap().streams_started
    }

    pub(crate) async fn wait_for_streams(&self, count: usize) {
        for _ in 0..1000 {
            if self.streams_started() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!(
            "timed out waiting for {count} health streams; saw {}",
            self.streams_started()
        );
    }

    /// Delivers a response (or stream failure) on the current stream, then
    /// lets the watcher settle.
    pub(crate) async fn push_response(&self, response: Result<ServingStatus, Status>) {
        self.wait_for_streams(1).await;
        let failing = response.is_err();
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(tx) = &inner.current {
                let _ = tx.send(response);
            }
            if failing {
                inner.current = None;
            }
        }
        settle().await;
    }

    /// Cleanly closes the current stream.
    pub(crate) async fn close_stream(&self) {
        self.inner.lock().unwrap().current = None;
        settle().await;
    }
}

struct FakeHealthStream {
    rx: mpsc::UnboundedReceiver<Result<ServingStatus, Status>>,
}

#[async_trait]
impl HealthWatchStream for FakeHealthStream {
    async fn next(&mut self) -> Option<Result<ServingStatus, Status>> {
        self.rx.recv().await
    }
}

impl HealthWatchFactory for FakeHealthFactory {
    fn start_watch(
        &self,
        _transport: &Arc<dyn ConnectedTransport>,
        _service: &str,
    ) -> Result<Box<dyn HealthWatchStream>, Status> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.streams_started += 1;
        inner.current = Some(tx);
        Ok(Box::new(FakeHealthStream { rx }))
    }
}

// ===== balancer fakes =====

pub(crate) struct FakeBalancerFactory {
    inner: Arc<Mutex<BalancerInner>>,
}

#[derive(Default)]
struct BalancerInner {
    streams_started: usize,
    connect_fail: Option<Status>,
    hang_connect: bool,
    current: Option<mpsc::UnboundedSender<Result<BalancerMessage, Status>>>,
    stats: Vec<ClientStats>,
    requests: Vec<(Vec<Address>, String)>,
}

impl FakeBalancerFactory {
    pub(crate) fn new() -> Self {
        FakeBalancerFactory {
            inner: Arc::default(),
        }
    }

    pub(crate) fn streams_started(&self) -> usize {
        self.inner.lock().unwrap().streams_started
    }

    pub(crate) fn hang_connects(&self) {
        self.inner.lock().unwrap().hang_connect = true;
    }

    pub(crate) fn fail_connects(&self, status: Status) {
        self.inner.lock().unwrap().connect_fail = Some(status);
    }

    pub(crate) fn requests(&self) -> Vec<(Vec<Address>, String)> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub(crate) fn reported_stats(&self) -> Vec<ClientStats> {
        self.inner.lock().unwrap().stats.clone()
    }

    pub(crate) async fn wait_for_streams(&self, count: usize) {
        for _ in 0..1000 {
            if self.streams_started() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!(
            "timed out waiting for {count} balancer streams; saw {}",
            self.streams_started()
        );
    }

    pub(crate) fn send(&self, message: BalancerMessage) {
        let inner = self.inner.lock().unwrap();
        if let Some(tx) = &inner.current {
            let _ = tx.send(Ok(message));
        }
    }

    pub(crate) fn close_stream(&self, status: Option<Status>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.current.take() {
            if let Some(status) = status {
                let _ = tx.send(Err(status));
            }
        }
    }
}

struct FakeBalancerSender {
    inner: Arc<Mutex<BalancerInner>>,
}

impl BalanceLoadSender for FakeBalancerSender {
    fn send_client_stats(&self, stats: ClientStats) {
        self.inner.lock().unwrap().stats.push(stats);
    }
}

struct FakeBalancerReceiver {
    rx: mpsc::UnboundedReceiver<Result<BalancerMessage, Status>>,
}

#[async_trait]
impl BalanceLoadReceiver for FakeBalancerReceiver {
    async fn recv(&mut self) -> Option<Result<BalancerMessage, Status>> {
        self.rx.recv().await
    }
}

impl BalancerChannelFactory for FakeBalancerFactory {
    fn start_balance_load(
        &self,
        balancer_addresses: &[Address],
        service_name: &str,
        _deadline: Option<Duration>,
    ) -> ConnectBalancerFuture {
        let inner = self.inner.clone();
        let addresses = balancer_addresses.to_vec();
        let service_name = service_name.to_string();
        Box::pin(async move {
            let (fail, hang) = {
                let mut guard = inner.lock().unwrap();
                guard.requests.push((addresses, service_name));
                (guard.connect_fail.clone(), guard.hang_connect)
            };
            if hang {
                std::future::pending::<()>().await;
            }
            if let Some(status) = fail {
                return Err(status);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut guard = inner.lock().unwrap();
                guard.streams_started += 1;
                guard.current = Some(tx);
            }
            Ok((
                Arc::new(FakeBalancerSender {
                    inner: inner.clone(),
                }) as Arc<dyn BalanceLoadSender>,
                Box::new(FakeBalancerReceiver { rx }) as Box<dyn BalanceLoadReceiver>,
            ))
        })
    }
}

// ===== LB policy harness =====

#[derive(Debug)]
pub(crate) enum TestEvent {
    NewSubchannel(Arc<Subchannel>),
    Connectivity(ConnectivityState),
    RequestResolution,
    ScheduleWork,
}

pub(crate) struct TestPolicyController {
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) events: mpsc::UnboundedSender<TestEvent>,
}

impl PolicyController for TestPolicyController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<Subchannel> {
        let subchannel = Subchannel::new(
            address.clone(),
            self.transport.clone() as Arc<dyn Transport>,
            self.runtime.clone(),
            None,
        );
        let _ = self.events.send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_connectivity_state(&mut self, state: ConnectivityState) {
        let _ = self.events.send(TestEvent::Connectivity(state));
    }

    fn request_resolution(&mut self) {
        let _ = self.events.send(TestEvent::RequestResolution);
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.events.send(TestEvent::ScheduleWork);
    }
}

/// Builds the standard policy test environment: an event channel, a fake
/// transport, a controller, and LbPolicyOptions wired to them.
pub(crate) fn policy_setup(
    balancer_factory: Option<Arc<FakeBalancerFactory>>,
) -> (
    mpsc::UnboundedReceiver<TestEvent>,
    TestPolicyController,
    LbPolicyOptions,
    Arc<FakeTransport>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(FakeTransport::new());
    let controller = TestPolicyController {
        transport: transport.clone(),
        runtime: default_runtime(),
        events: tx.clone(),
    };
    let options = LbPolicyOptions {
        work_scheduler: Arc::new(TestWorkScheduler { events: tx }),
        runtime: default_runtime(),
        grpclb_call_timeout: None,
        grpclb_fallback_timeout: Duration::from_secs(10),
        balancer_channel_factory: balancer_factory
            .map(|f| f as Arc<dyn BalancerChannelFactory>),
        server_name: "lb.test.example.com".to_string(),
    };
    (rx, controller, options, transport)
}

/// A pick whose completion reports into a channel the test can await.
pub(crate) fn test_pick(
    id: u64,
    flags: u32,
    wait_for_ready: bool,
) -> (
    PickState,
    mpsc::UnboundedReceiver<Result<PickOutcome, Status>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_complete: PickCompletion = Box::new(move |result| {
        let _ = tx.send(result);
    });
    let pick = PickState::new(
        "/pkg.Svc/Method".into(),
        Metadata::new(),
        flags,
        wait_for_ready,
        id,
        on_complete,
    );
    (pick, rx)
}

/// Unwraps a completed pick into its subchannel.
pub(crate) fn picked_subchannel(result: Result<PickOutcome, Status>) -> Arc<Subchannel> {
    match result {
        Ok(PickOutcome::Picked(pick)) => pick.subchannel,
        other => panic!("expected a picked subchannel, got {other:?}"),
    }
}
