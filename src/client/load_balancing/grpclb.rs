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

//! The grpclb LB policy.
//!
//! A grpclb policy keeps a streaming BalanceLoad call open to a
//! resolver-supplied set of balancers.  Serverlists received on the stream
//! are handed to an embedded round_robin child that does the actual backend
//! picking; entries marked with the drop bit fail their RPCs locally.  If
//! the balancer never answers, a fallback timer switches the child onto the
//! resolver-provided backend addresses.  Client-side call statistics are
//! reported back on the stream when the balancer asks for them.
//!
//! The protobuf encoding of the `/grpc.lb.v1.LoadBalancer/BalanceLoad`
//! protocol lives behind [`BalancerChannelFactory`]; this module consumes
//! typed messages.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::byte_str::ByteStr;
use crate::client::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::load_balancing::{
    round_robin, CallTracker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, PickOutcome, PickResult,
    PickState, PolicyController, WorkScheduler, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::{Subchannel, SubchannelState};
use crate::client::{ConnectivityState, ConnectivityTracker, StateWatcher};
use crate::rt::{BoxedTaskHandle, Runtime};
use crate::service::OnPingAck;
use crate::status::Status;

pub(crate) static POLICY_NAME: &str = "grpclb";
static START: Once = Once::new();

/// Registers grpclb as an LB policy.
pub fn reg() {
    START.call_once(|| {
        round_robin::reg();
        GLOBAL_LB_REGISTRY.add_builder(GrpclbBuilder {});
    });
}

// ===== balancer wire protocol (typed) =====

/// The first server message on a BalanceLoad stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialResponse {
    /// If set, the client reports [`ClientStats`] on the stream with this
    /// period.
    pub client_stats_report_interval: Option<Duration>,
}

/// One entry of a balancer serverlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    /// Network-order IP address bytes; 4 for IPv4, 16 for IPv6.
    pub ip_addr: Vec<u8>,
    pub port: u32,
    pub load_balance_token: Option<ByteStr>,
    /// The balancer directs the client to fail RPCs routed to this entry
    /// without sending them.
    pub drop: bool,
}

impl ServerEntry {
    fn is_valid(&self) -> bool {
        if self.drop {
            // Drop entries carry no address.
            return true;
        }
        self.port <= u16::MAX as u32 && (self.ip_addr.len() == 4 || self.ip_addr.len() == 16)
    }

    fn address_string(&self) -> Option<String> {
        match self.ip_addr.len() {
            4 => {
                let octets: [u8; 4] = self.ip_addr.as_slice().try_into().ok()?;
                Some(format!("{}:{}", Ipv4Addr::from(octets), self.port))
            }
            16 => {
                let octets: [u8; 16] = self.ip_addr.as_slice().try_into().ok()?;
                Some(format!("[{}]:{}", Ipv6Addr::from(octets), self.port))
            }
            _ => None,
        }
    }
}

/// A server message on a BalanceLoad stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BalancerMessage {
    Initial(InitialResponse),
    ServerList(Vec<ServerEntry>),
}

/// Client-side call statistics reported to the balancer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientStats {
    pub num_calls_started: i64,
    pub num_calls_finished: i64,
    pub num_calls_finished_with_client_failed_to_send: i64,
    pub num_calls_finished_known_received: i64,
    /// Per-token counts of calls dropped at the client's pick stage.
    pub calls_finished_with_drop: Vec<(String, i64)>,
}

/// Sends client messages on an open BalanceLoad stream.
pub trait BalanceLoadSender: Send + Sync {
    fn send_client_stats(&self, stats: ClientStats);
}

/// Receives server messages from an open BalanceLoad stream.  `recv`
/// resolves with each message, an error status if the stream breaks, or
/// `None` on a clean close.
#[async_trait]
pub trait BalanceLoadReceiver: Send {
    async fn recv(&mut self) -> Option<Result<BalancerMessage, Status>>;
}

pub type BalanceLoadCall = (Arc<dyn BalanceLoadSender>, Box<dyn BalanceLoadReceiver>);

pub type ConnectBalancerFuture =
    Pin<Box<dyn Future<Output = Result<BalanceLoadCall, Status>> + Send>>;

/// Establishes BalanceLoad streams against a set of balancer addresses.
/// The channel to the balancer, and the protobuf codec for the protocol,
/// live behind this trait.  The factory sends the stream's InitialRequest
/// carrying `service_name` before returning the call.
pub trait BalancerChannelFactory: Send + Sync {
    fn start_balance_load(
        &self,
        balancer_addresses: &[Address],
        service_name: &str,
        deadline: Option<Duration>,
    ) -> ConnectBalancerFuture;
}

// ===== client stats accounting =====

/// Shared per-policy call accounting, threaded into calls via the pick's
/// [`CallTracker`].  Mutated from call combiners; eventually consistent.
#[derive(Default)]
pub(crate) struct GrpclbClientStats {
    num_calls_started: std::sync::atomic::AtomicI64,
    num_calls_finished: std::sync::atomic::AtomicI64,
    num_calls_finished_with_client_failed_to_send: std::sync::atomic::AtomicI64,
    num_calls_finished_known_received: std::sync::atomic::AtomicI64,
    drops: Mutex<Vec<(String, i64)>>,
}

use std::sync::atomic::Ordering::Relaxed;

impl GrpclbClientStats {
    pub(crate) fn call_started(&self) {
        self.num_calls_started.fetch_add(1, Relaxed);
    }

    pub(crate) fn add_drop(&self, token: &str) {
        let mut drops = self.drops.lock().unwrap();
        if let Some(entry) = drops.iter_mut().find(|(t, _)| t == token) {
            entry.1 += 1;
        } else {
            drops.push((token.to_string(), 1));
        }
        // A dropped call counts as started and finished without ever being
        // sent.
        self.num_calls_started.fetch_add(1, Relaxed);
        self.num_calls_finished.fetch_add(1, Relaxed);
    }

    pub(crate) fn snapshot_and_reset(&self) -> ClientStats {
        ClientStats {
            num_calls_started: self.num_calls_started.swap(0, Relaxed),
            num_calls_finished: self.num_calls_finished.swap(0, Relaxed),
            num_calls_finished_with_client_failed_to_send: self
                .num_calls_finished_with_client_failed_to_send
                .swap(0, Relaxed),
            num_calls_finished_known_received: self
                .num_calls_finished_known_received
                .swap(0, Relaxed),
            calls_finished_with_drop: std::mem::take(&mut *self.drops.lock().unwrap()),
        }
    }
}

impl CallTracker for GrpclbClientStats {
    fn call_finished(&self, failed_to_send: bool, known_received: bool) {
        self.num_calls_finished.fetch_add(1, Relaxed);
        if failed_to_send {
            self.num_calls_finished_with_client_failed_to_send
                .fetch_add(1, Relaxed);
        }
        if known_received {
            self.num_calls_finished_known_received.fetch_add(1, Relaxed);
        }
    }
}

// ===== the policy =====

struct GrpclbBuilder {}

impl LbPolicyBuilder for GrpclbBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        round_robin::reg();
        let child_builder = GLOBAL_LB_REGISTRY
            .get_policy(round_robin::POLICY_NAME)
            .unwrap_or_else(|| unreachable!("round_robin is registered above"));
        Box::new(GrpclbPolicy::new(options, child_builder))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

enum LbEvent {
    StreamEstablished(Arc<dyn BalanceLoadSender>),
    Message(BalancerMessage),
    StreamClosed(Option<Status>),
    FallbackTimerFired,
    RetryTimerFired,
}

impl std::fmt::Debug for LbEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LbEvent::StreamEstablished(_) => write!(f, "StreamEstablished"),
            LbEvent::Message(m) => write!(f, "Message({m:?})"),
            LbEvent::StreamClosed(s) => write!(f, "StreamClosed({s:?})"),
            LbEvent::FallbackTimerFired => write!(f, "FallbackTimerFired"),
            LbEvent::RetryTimerFired => write!(f, "RetryTimerFired"),
        }
    }
}

struct GrpclbPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    factory: Option<Arc<dyn BalancerChannelFactory>>,
    child_builder: Arc<dyn LbPolicyBuilder>,
    call_timeout: Option<Duration>,
    fallback_timeout: Duration,
    server_name: String,

    // Event queue filled by the stream/timer tasks; drained in work().
    events: Arc<Mutex<Vec<LbEvent>>>,

    balancer_addresses: Vec<Address>,
    fallback_backends: Vec<Address>,

    serverlist: Option<Vec<ServerEntry>>,
    serverlist_index: usize,
    in_fallback: bool,

    child: Option<Box<dyn LbPolicy>>,
    pending_picks: Vec<PickState>,

    stream_sender: Option<Arc<dyn BalanceLoadSender>>,
    seen_initial_response: bool,
    backoff: ExponentialBackoff,

    stream_task: Option<BoxedTaskHandle>,
    fallback_task: Option<BoxedTaskHandle>,
    retry_task: Option<BoxedTaskHandle>,
    load_report_task: Option<BoxedTaskHandle>,

    client_stats: Arc<GrpclbClientStats>,
    connectivity: ConnectivityTracker,
    shut_down: bool,
}

// Captures the child's interactions with the channel so grpclb can filter
// them: re-resolution is suppressed while the balancer is delivering
// serverlists, and the child's connectivity becomes the policy's.
struct WrappedController<'a> {
    inner: &'a mut dyn PolicyController,
    suppress_reresolution: bool,
    child_connectivity: Option<ConnectivityState>,
}

impl PolicyController for WrappedController<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<Subchannel> {
        self.inner.new_subchannel(address)
    }

    fn update_connectivity_state(&mut self, state: ConnectivityState) {
        self.child_connectivity = Some(state);
    }

    fn request_resolution(&mut self) {
        if self.suppress_reresolution {
            trace!("grpclb suppressing re-resolution request from child");
        } else {
            self.inner.request_resolution();
        }
    }
}

impl GrpclbPolicy {
    fn new(options: LbPolicyOptions, child_builder: Arc<dyn LbPolicyBuilder>) -> Self {
        // The default connection backoff config is a compile-time constant
        // and always validates.
        let backoff = ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG)
            .unwrap_or_else(|_| unreachable!("default backoff config is valid"));
        GrpclbPolicy {
            work_scheduler: options.work_scheduler.clone(),
            runtime: options.runtime.clone(),
            factory: options.balancer_channel_factory.clone(),
            child_builder,
            call_timeout: options.grpclb_call_timeout,
            fallback_timeout: options.grpclb_fallback_timeout,
            server_name: options.server_name.clone(),
            events: Arc::new(Mutex::new(Vec::new())),
            balancer_addresses: Vec::new(),
            fallback_backends: Vec::new(),
            serverlist: None,
            serverlist_index: 0,
            in_fallback: false,
            child: None,
            pending_picks: Vec::new(),
            stream_sender: None,
            seen_initial_response: false,
            backoff,
            stream_task: None,
            fallback_task: None,
            retry_task: None,
            load_report_task: None,
            client_stats: Arc::new(GrpclbClientStats::default()),
            connectivity: ConnectivityTracker::new(ConnectivityState::Connecting),
            shut_down: false,
        }
    }

    fn push_event(&self, event: LbEvent) {
        self.events.lock().unwrap().push(event);
        self.work_scheduler.schedule_work();
    }

    fn balancer_active(&self) -> bool {
        self.stream_sender.is_some()
    }

    fn set_connectivity(&mut self, state: ConnectivityState, ctl: &mut dyn PolicyController) {
        for watcher in self.connectivity.set_state(state) {
            watcher(state);
        }
        ctl.update_connectivity_state(state);
    }

    // Runs a closure against the child policy behind the wrapped
    // controller, then folds the child's connectivity into our own.
    fn with_child(
        &mut self,
        ctl: &mut dyn PolicyController,
        f: impl FnOnce(&mut dyn LbPolicy, &mut WrappedController<'_>),
    ) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let mut wrapped = WrappedController {
            inner: &mut *ctl,
            suppress_reresolution: self.balancer_active(),
            child_connectivity: None,
        };
        f(child.as_mut(), &mut wrapped);
        let child_state = wrapped.child_connectivity;
        self.child = Some(child);
        if let Some(state) = child_state {
            self.set_connectivity(state, ctl);
        }
    }

    fn ensure_child(&mut self) {
        if self.child.is_some() {
            return;
        }
        self.child = Some(self.child_builder.build(LbPolicyOptions {
            work_scheduler: self.work_scheduler.clone(),
            runtime: self.runtime.clone(),
            grpclb_call_timeout: None,
            grpclb_fallback_timeout: self.fallback_timeout,
            balancer_channel_factory: None,
            server_name: self.server_name.clone(),
        }));
    }

    // Hands the current backend set (serverlist backends or fallback
    // backends) to the round_robin child and re-dispatches queued picks
    // through it.
    fn update_child(&mut self, backends: Vec<Address>, ctl: &mut dyn PolicyController) {
        self.ensure_child();
        self.with_child(ctl, |child, wrapped| {
            child.update(backends, wrapped);
        });
        self.drain_pending_picks(ctl);
    }

    fn drain_pending_picks(&mut self, ctl: &mut dyn PolicyController) {
        for pick in std::mem::take(&mut self.pending_picks) {
            let _ = self.delegate_pick(pick, ctl);
        }
    }

    // Delegates a pick to the child, attaching the client-stats tracker so
    // the call path can account completion.
    fn delegate_pick(&mut self, mut pick: PickState, ctl: &mut dyn PolicyController) -> PickResult {
        let Some(original) = pick.on_complete.take() else {
            return PickResult::Complete;
        };
        let stats = self.client_stats.clone();
        stats.call_started();
        pick.on_complete = Some(Box::new(move |result| match result {
            Ok(PickOutcome::Picked(mut choice)) => {
                choice.call_tracker = Some(stats);
                original(Ok(PickOutcome::Picked(choice)));
            }
            other => {
                // The pick never produced a subchannel, so the call was
                // never sent.
                stats.call_finished(true, false);
                original(other);
            }
        }));
        let mut result = PickResult::Queued;
        self.with_child(ctl, |child, wrapped| {
            result = child.pick(pick, wrapped);
        });
        result
    }

    fn start_balancer_stream(&mut self) {
        let Some(factory) = self.factory.clone() else {
            warn!("grpclb has no balancer channel factory; relying on fallback");
            return;
        };
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.stream_sender = None;
        self.seen_initial_response = false;
        let addresses = self.balancer_addresses.clone();
        let server_name = self.server_name.clone();
        let deadline = self.call_timeout;
        let events = self.events.clone();
        let scheduler = self.work_scheduler.clone();
        let push = move |event: LbEvent| {
            events.lock().unwrap().push(event);
            scheduler.schedule_work();
        };
        self.stream_task = Some(self.runtime.spawn(Box::pin(async move {
            match factory
                .start_balance_load(&addresses, &server_name, deadline)
                .await
            {
                Ok((sender, mut receiver)) => {
                    push(LbEvent::StreamEstablished(sender));
                    loop {
                        match receiver.recv().await {
                            Some(Ok(message)) => push(LbEvent::Message(message)),
                            Some(Err(status)) => {
                                push(LbEvent::StreamClosed(Some(status)));
                                return;
                            }
                            None => {
                                push(LbEvent::StreamClosed(None));
                                return;
                            }
                        }
                    }
                }
                Err(status) => push(LbEvent::StreamClosed(Some(status))),
            }
        })));
    }

    fn arm_fallback_timer(&mut self) {
        if self.fallback_task.is_some() || self.serverlist.is_some() {
            return;
        }
        let timeout = self.fallback_timeout;
        let events = self.events.clone();
        let scheduler = self.work_scheduler.clone();
        let rt = self.runtime.clone();
        self.fallback_task = Some(self.runtime.spawn(Box::pin(async move {
            rt.sleep(timeout).await;
            events.lock().unwrap().push(LbEvent::FallbackTimerFired);
            scheduler.schedule_work();
        })));
    }

    fn start_load_reporting(&mut self, interval: Duration) {
        if self.load_report_task.is_some() {
            return;
        }
        let Some(sender) = self.stream_sender.clone() else {
            return;
        };
        let stats = self.client_stats.clone();
        let rt = self.runtime.clone();
        self.load_report_task = Some(self.runtime.spawn(Box::pin(async move {
            loop {
                rt.sleep(interval).await;
                sender.send_client_stats(stats.snapshot_and_reset());
            }
        })));
    }

    fn handle_serverlist(&mut self, entries: Vec<ServerEntry>, ctl: &mut dyn PolicyController) {
        if entries.is_empty() {
            // Balancers send empty serverlists as keep-alives; they carry
            // no routing information and must not disturb the current
            // serverlist or the fallback machinery.
            debug!("grpclb ignoring empty serverlist");
            return;
        }
        let valid: Vec<ServerEntry> = entries
            .into_iter()
            .filter(|e| {
                if !e.is_valid() {
                    warn!("grpclb discarding invalid serverlist entry {e:?}");
                }
                e.is_valid()
            })
            .collect();
        if self.serverlist.as_ref() == Some(&valid) {
            trace!("grpclb ignoring serverlist identical to the current one");
            return;
        }
        debug!("grpclb installing serverlist with {} entries", valid.len());
        if let Some(task) = self.fallback_task.take() {
            task.abort();
        }
        self.in_fallback = false;
        let backends: Vec<Address> = valid
            .iter()
            .filter(|e| !e.drop)
            .filter_map(|e| {
                e.address_string().map(|addr| Address {
                    address: addr.into(),
                    lb_token: e.load_balance_token.clone(),
                    ..Default::default()
                })
            })
            .collect();
        self.serverlist = Some(valid);
        self.update_child(backends, ctl);
    }

    fn handle_stream_closed(&mut self, status: Option<Status>, ctl: &mut dyn PolicyController) {
        debug!("grpclb balancer stream closed: {status:?}");
        self.stream_sender = None;
        if let Some(task) = self.load_report_task.take() {
            task.abort();
        }
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        // The balancer went away; give the resolver a chance to produce a
        // fresh balancer list.
        ctl.request_resolution();
        if self.seen_initial_response {
            // The stream was healthy long enough to answer; reconnect
            // without delay.
            self.backoff.reset();
            self.start_balancer_stream();
            return;
        }
        let delay = self.backoff.backoff_duration();
        let events = self.events.clone();
        let scheduler = self.work_scheduler.clone();
        let rt = self.runtime.clone();
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        self.retry_task = Some(self.runtime.spawn(Box::pin(async move {
            rt.sleep(delay).await;
            events.lock().unwrap().push(LbEvent::RetryTimerFired);
            scheduler.schedule_work();
        })));
    }
}

impl LbPolicy for GrpclbPolicy {
    fn pick(&mut self, pick: PickState, ctl: &mut dyn PolicyController) -> PickResult {
        if let Some(serverlist) = self.serverlist.as_ref() {
            if !serverlist.is_empty() {
                let entry = serverlist[self.serverlist_index % serverlist.len()].clone();
                self.serverlist_index = self.serverlist_index.wrapping_add(1);
                if entry.drop {
                    let token = entry
                        .load_balance_token
                        .as_deref()
                        .unwrap_or("")
                        .to_string();
                    self.client_stats.add_drop(&token);
                    pick.finish(Ok(PickOutcome::Drop(Status::unavailable(
                        "call dropped by the load balancer",
                    ))));
                    return PickResult::Complete;
                }
                return self.delegate_pick(pick, ctl);
            }
        }
        if self.in_fallback && self.child.is_some() {
            return self.delegate_pick(pick, ctl);
        }
        trace!("grpclb queueing pick until a serverlist or fallback arrives");
        self.pending_picks.push(pick);
        PickResult::Queued
    }

    fn cancel_pick(&mut self, id: u64, reason: Status) {
        if let Some(pos) = self.pending_picks.iter().position(|p| p.id() == id) {
            let pick = self.pending_picks.remove(pos);
            pick.finish(Err(reason));
            return;
        }
        if let Some(child) = self.child.as_mut() {
            child.cancel_pick(id, reason);
        }
    }

    fn cancel_picks_matching(&mut self, mask: u32, eq: u32, reason: Status) {
        crate::client::load_balancing::cancel_matching_picks(
            &mut self.pending_picks,
            mask,
            eq,
            &reason,
        );
        if let Some(child) = self.child.as_mut() {
            child.cancel_picks_matching(mask, eq, reason);
        }
    }

    fn ping_one(&mut self, on_ack: OnPingAck, ctl: &mut dyn PolicyController) {
        match self.child.is_some() {
            true => self.with_child(ctl, |child, wrapped| child.ping_one(on_ack, wrapped)),
            false => on_ack(Err(Status::unavailable("no connected backends"))),
        }
    }

    fn exit_idle(&mut self, ctl: &mut dyn PolicyController) {
        self.with_child(ctl, |child, wrapped| child.exit_idle(wrapped));
    }

    fn check_connectivity(&self) -> ConnectivityState {
        self.connectivity.state()
    }

    fn notify_on_state_change(&mut self, watcher: StateWatcher) {
        self.connectivity.notify_on_state_change(watcher);
    }

    fn update(&mut self, addresses: Vec<Address>, ctl: &mut dyn PolicyController) {
        if self.shut_down {
            return;
        }
        let (balancers, backends): (Vec<Address>, Vec<Address>) =
            addresses.into_iter().partition(|a| a.is_balancer);
        self.fallback_backends = backends;

        if balancers.is_empty() {
            // Nothing to balance against; serve from the fallback backends.
            debug!("grpclb update carried no balancer addresses; entering fallback");
            if let Some(task) = self.stream_task.take() {
                task.abort();
            }
            self.stream_sender = None;
            self.in_fallback = true;
            self.serverlist = None;
            let backends = self.fallback_backends.clone();
            self.update_child(backends, ctl);
            return;
        }

        let balancer_set_changed = balancers != self.balancer_addresses;
        self.balancer_addresses = balancers;
        if balancer_set_changed || self.stream_task.is_none() {
            self.start_balancer_stream();
        }
        self.arm_fallback_timer();
        if self.in_fallback {
            let backends = self.fallback_backends.clone();
            self.update_child(backends, ctl);
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<Subchannel>,
        state: &SubchannelState,
        ctl: &mut dyn PolicyController,
    ) {
        // All subchannels belong to the round_robin child; the balancer
        // channel lives behind the factory seam.
        self.with_child(ctl, |child, wrapped| {
            child.subchannel_update(subchannel, state, wrapped);
        });
    }

    fn work(&mut self, ctl: &mut dyn PolicyController) {
        if self.shut_down {
            return;
        }
        loop {
            let drained: Vec<LbEvent> = std::mem::take(&mut *self.events.lock().unwrap());
            if drained.is_empty() {
                return;
            }
            for event in drained {
                trace!("grpclb processing {event:?}");
                match event {
                    LbEvent::StreamEstablished(sender) => {
                        self.stream_sender = Some(sender);
                    }
                    LbEvent::Message(BalancerMessage::Initial(initial)) => {
                        self.seen_initial_response = true;
                        if let Some(interval) = initial.client_stats_report_interval {
                            if !interval.is_zero() {
                                self.start_load_reporting(interval);
                            }
                        }
                    }
                    LbEvent::Message(BalancerMessage::ServerList(entries)) => {
                        self.handle_serverlist(entries, ctl);
                    }
                    LbEvent::StreamClosed(status) => {
                        self.handle_stream_closed(status, ctl);
                    }
                    LbEvent::FallbackTimerFired => {
                        self.fallback_task = None;
                        if self.serverlist.is_none() {
                            debug!("grpclb fallback timer fired; using resolver backends");
                            self.in_fallback = true;
                            let backends = self.fallback_backends.clone();
                            self.update_child(backends, ctl);
                        }
                    }
                    LbEvent::RetryTimerFired => {
                        self.retry_task = None;
                        if self.stream_sender.is_none() {
                            self.start_balancer_stream();
                        }
                    }
                }
            }
        }
    }

    fn hand_off_pending(&mut self, new_policy: &mut dyn LbPolicy, ctl: &mut dyn PolicyController) {
        for pick in std::mem::take(&mut self.pending_picks) {
            let _ = new_policy.pick(pick, ctl);
        }
        if let Some(mut child) = self.child.take() {
            child.hand_off_pending(new_policy, ctl);
            self.child = Some(child);
        }
    }

    fn shutdown(&mut self, reason: Status) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for task in [
            self.stream_task.take(),
            self.fallback_task.take(),
            self.retry_task.take(),
            self.load_report_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.stream_sender = None;
        for pick in std::mem::take(&mut self.pending_picks) {
            pick.finish(Err(reason.clone()));
        }
        if let Some(child) = self.child.as_mut() {
            child.shutdown(reason);
        }
        for watcher in self.connectivity.set_state(ConnectivityState::Shutdown) {
            watcher(ConnectivityState::Shutdown);
        }
    }
}
