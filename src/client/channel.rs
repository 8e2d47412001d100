/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! The logical channel: the coordination loop between the name resolver and
//! the LB policy.
//!
//! All resolver callbacks, LB policy calls, and channel connectivity
//! transitions are serialized on the channel combiner.  Resolver updates
//! choose a policy name (an explicit option beats the balancer-address rule
//! beats the resolver's suggestion beats pick_first), swap or update the
//! policy, and atomically publish the new service config and retry
//! throttle.  Calls that arrive before the first resolver result queue here
//! until a result lands.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::byte_str::ByteStr;
use crate::client::call::Call;
use crate::client::load_balancing::{
    grpclb, pick_first, round_robin, LbPolicy, LbPolicyOptions, PickCompletion, PickState,
    PolicyController, WorkScheduler, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::{
    global_registry, Address, Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate, Target,
    UpdateSink,
};
use crate::client::retry_throttle::{RetryThrottle, ServerRetryThrottleMap};
use crate::client::service_config::ServiceConfig;
use crate::client::subchannel::{HealthCheckOptions, Subchannel, SubchannelState};
use crate::client::{ConnectivityState, ConnectivityTracker, StateWatcher};
use crate::metadata::Metadata;
use crate::rt::{default_runtime, Runtime};
use crate::service::{OnPingAck, Transport};
use crate::status::Status;
use crate::sync::{Combiner, CombinerState, Effect};

/// The default cap on bytes buffered per RPC for retries: 2^30.
pub const DEFAULT_PER_RPC_RETRY_BUFFER_SIZE: usize = 1 << 30;

/// The default grpclb fallback timeout.
pub const DEFAULT_GRPCLB_FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Static configuration for a channel.
///
/// Field names correspond to the conventional channel arguments:
/// `grpc.lb_policy_name`, `grpc.service_config`,
/// `grpc.per_rpc_retry_buffer_size`, `grpc.grpclb_call_timeout_ms`, and
/// `grpc.grpclb_fallback_timeout_ms`.  The `grpc.server_uri` argument is
/// the `target` parameter of [`Channel::new`].
pub struct ChannelOptions {
    /// Forces an LB policy regardless of what the resolver reports.
    pub lb_policy_name: Option<String>,
    /// A service config used when the resolver does not supply one.
    pub service_config_json: Option<String>,
    /// Cap on per-call buffered sends; once exceeded the call commits and
    /// retries become impossible.
    pub per_rpc_retry_buffer_size: usize,
    /// Deadline for each BalanceLoad stream.  None means no deadline.
    pub grpclb_call_timeout: Option<Duration>,
    /// How long grpclb waits for a balancer response before serving from
    /// the resolver-provided backends.
    pub grpclb_fallback_timeout: Duration,
    /// The transport used to connect subchannels.
    pub transport: Arc<dyn Transport>,
    /// Establishes BalanceLoad streams for grpclb.
    pub balancer_channel_factory: Option<Arc<dyn grpclb::BalancerChannelFactory>>,
    /// When set, subchannel readiness is gated by health checking.
    pub health_check: Option<HealthCheckOptions>,
    /// Overrides the scheme-based resolver registry lookup.
    pub resolver_builder: Option<Arc<dyn ResolverBuilder>>,
}

impl ChannelOptions {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        ChannelOptions {
            lb_policy_name: None,
            service_config_json: None,
            per_rpc_retry_buffer_size: DEFAULT_PER_RPC_RETRY_BUFFER_SIZE,
            grpclb_call_timeout: None,
            grpclb_fallback_timeout: DEFAULT_GRPCLB_FALLBACK_TIMEOUT,
            transport,
            balancer_channel_factory: None,
            health_check: None,
            resolver_builder: None,
        }
    }
}

/// A snapshot of info about the channel, per get-channel-info.
#[derive(Debug, Clone, Default)]
pub struct ChannelInfo {
    pub lb_policy_name: Option<String>,
    pub service_config_json: Option<String>,
    pub state: ConnectivityState,
}

/// The per-call view of the published service config.  Replaced atomically
/// (pointer swap) under the channel combiner; read lock-free-ish by calls.
#[derive(Clone, Default)]
pub(crate) struct ConfigSnapshot {
    pub(crate) service_config: Option<Arc<ServiceConfig>>,
    pub(crate) retry_throttle: Option<Arc<RetryThrottle>>,
}

/// A virtual, persistent connection to a service.  Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Constructs a new gRPC channel for the given target URI.
    pub fn new(target: &str, options: ChannelOptions) -> Result<Channel, Status> {
        pick_first::reg();
        round_robin::reg();
        grpclb::reg();

        let target = Target::from_str(target)
            .map_err(|e| Status::new(crate::status::StatusCode::InvalidArgument, e))?;
        let resolver_builder = match &options.resolver_builder {
            Some(b) => b.clone(),
            None => global_registry().get_scheme(target.scheme()).ok_or_else(|| {
                Status::new(
                    crate::status::StatusCode::InvalidArgument,
                    format!("no resolver registered for scheme {:?}", target.scheme()),
                )
            })?,
        };

        let runtime = default_runtime();
        let server_name = target.server_name();

        // A service config supplied through channel options is published
        // immediately and re-used whenever the resolver omits one.
        let default_config = options
            .service_config_json
            .as_deref()
            .and_then(|json| match ServiceConfig::parse(json) {
                Ok(config) => Some(Arc::new(config)),
                Err(err) => {
                    warn!("ignoring invalid channel-option service config: {err}");
                    None
                }
            });

        let throttle_map = Arc::new(ServerRetryThrottleMap::default());
        let initial_snapshot = ConfigSnapshot {
            retry_throttle: default_config.as_ref().and_then(|config| {
                config.retry_throttling.map(|t| {
                    throttle_map.get_or_create(&server_name, t.max_tokens, t.token_ratio)
                })
            }),
            service_config: default_config.clone(),
        };

        let per_rpc_retry_buffer_size = options.per_rpc_retry_buffer_size;
        let core = ChannelCore {
            shared: Weak::new(),
            options,
            target,
            server_name,
            runtime: runtime.clone(),
            default_config,
            throttle_map,
            resolver: None,
            policy: None,
            policy_name: None,
            policy_generation: 0,
            have_resolver_result: false,
            waiting_for_resolver_result: Vec::new(),
            connectivity: ConnectivityTracker::new(ConnectivityState::Idle),
            shut_down: false,
            effects: Vec::new(),
        };
        let combiner = Combiner::new(core);
        let shared = Arc::new(ChannelShared {
            combiner: combiner.clone(),
            runtime,
            per_rpc_retry_buffer_size,
            config: Mutex::new(initial_snapshot),
            info: Mutex::new(ChannelInfo::default()),
            next_pick_id: AtomicU64::new(1),
        });

        // Wire the back-reference and build the resolver under the combiner
        // so its first update cannot race channel setup.
        let weak = Arc::downgrade(&shared);
        combiner.run(move |core: &mut ChannelCore| {
            core.shared = weak.clone();
            let sink_weak = weak.clone();
            let sink = UpdateSink(Arc::new(move |update| {
                if let Some(shared) = sink_weak.upgrade() {
                    shared
                        .combiner
                        .run(move |core: &mut ChannelCore| core.handle_resolver_update(update));
                }
            }));
            core.resolver =
                Some(resolver_builder.build(&core.target, ResolverOptions { update_sink: sink }));
        });

        Ok(Channel { shared })
    }

    /// Creates a call on the channel.  The call starts when its first batch
    /// carrying `send_initial_metadata` is submitted.
    pub fn create_call(&self, path: &str, deadline: Option<Instant>) -> Call {
        Call::new(self.shared.clone(), ByteStr::from(path), deadline)
    }

    /// The channel's current connectivity state.
    pub fn connectivity_state(&self) -> ConnectivityState {
        self.shared.info.lock().unwrap().state
    }

    /// Registers a one-shot watcher for the next connectivity state change.
    pub fn notify_on_state_change(&self, watcher: StateWatcher) {
        self.shared
            .combiner
            .run(move |core: &mut ChannelCore| core.connectivity.notify_on_state_change(watcher));
    }

    /// Pings one connected backend through the current LB policy.
    pub fn ping(&self, on_ack: OnPingAck) {
        self.shared.combiner.run(move |core: &mut ChannelCore| {
            if core.shut_down {
                on_ack(Err(Status::unavailable("channel is shut down")));
                return;
            }
            let mut on_ack = Some(on_ack);
            core.with_policy(|policy, ctl| {
                if let Some(on_ack) = on_ack.take() {
                    policy.ping_one(on_ack, ctl);
                }
            });
            if let Some(on_ack) = on_ack {
                on_ack(Err(Status::unavailable("channel has no LB policy yet")));
            }
        });
    }

    /// Asks the current policy to leave the Idle state and connect.
    pub fn exit_idle(&self) {
        self.shared.combiner.run(|core: &mut ChannelCore| {
            core.with_policy(|policy, ctl| policy.exit_idle(ctl));
        });
    }

    /// Disconnects the channel: the resolver is released, the LB policy is
    /// shut down, and queued picks fail.  Terminal.
    pub fn disconnect(&self) {
        self.shared
            .combiner
            .run(|core: &mut ChannelCore| core.handle_disconnect());
    }

    /// Returns the current LB policy name, service config, and
    /// connectivity.
    pub fn channel_info(&self) -> ChannelInfo {
        self.shared.info.lock().unwrap().clone()
    }
}

pub(crate) struct ChannelShared {
    pub(crate) combiner: Combiner<ChannelCore>,
    runtime: Arc<dyn Runtime>,
    per_rpc_retry_buffer_size: usize,
    config: Mutex<ConfigSnapshot>,
    info: Mutex<ChannelInfo>,
    next_pick_id: AtomicU64,
}

impl ChannelShared {
    pub(crate) fn runtime(&self) -> Arc<dyn Runtime> {
        self.runtime.clone()
    }

    pub(crate) fn per_rpc_retry_buffer_size(&self) -> usize {
        self.per_rpc_retry_buffer_size
    }

    pub(crate) fn config_snapshot(&self) -> ConfigSnapshot {
        self.config.lock().unwrap().clone()
    }

    /// Starts a pick for a call.  Returns the pick id usable with
    /// [`ChannelShared::cancel_pick`].
    pub(crate) fn pick_subchannel(
        self: &Arc<Self>,
        path: ByteStr,
        initial_metadata: Metadata,
        initial_metadata_flags: u32,
        wait_for_ready: bool,
        on_complete: PickCompletion,
    ) -> u64 {
        let id = self.next_pick_id.fetch_add(1, Ordering::Relaxed);
        let pick = PickState::new(
            path,
            initial_metadata,
            initial_metadata_flags,
            wait_for_ready,
            id,
            on_complete,
        );
        self.combiner
            .run(move |core: &mut ChannelCore| core.handle_pick(pick));
        id
    }

    /// Cancels a queued pick.  Safe to call after the policy that held the
    /// pick was replaced: ids survive the hand-off, and unknown ids are
    /// ignored.
    pub(crate) fn cancel_pick(&self, id: u64, reason: Status) {
        self.combiner
            .run(move |core: &mut ChannelCore| core.handle_cancel_pick(id, reason));
    }
}

pub(crate) struct ChannelCore {
    shared: Weak<ChannelShared>,
    options: ChannelOptions,
    target: Target,
    server_name: String,
    runtime: Arc<dyn Runtime>,
    default_config: Option<Arc<ServiceConfig>>,
    throttle_map: Arc<ServerRetryThrottleMap>,

    resolver: Option<Box<dyn Resolver>>,
    policy: Option<Box<dyn LbPolicy>>,
    policy_name: Option<String>,
    policy_generation: u64,

    have_resolver_result: bool,
    waiting_for_resolver_result: Vec<PickState>,

    connectivity: ConnectivityTracker,
    shut_down: bool,
    effects: Vec<Effect>,
}

impl CombinerState for ChannelCore {
    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

impl ChannelCore {
    fn with_policy(&mut self, f: impl FnOnce(&mut dyn LbPolicy, &mut dyn PolicyController)) {
        let Some(mut policy) = self.policy.take() else {
            return;
        };
        let mut ctl = ControllerImpl { core: &mut *self };
        f(policy.as_mut(), &mut ctl);
        if self.policy.is_none() {
            self.policy = Some(policy);
        }
        // Mirror whatever connectivity the policy reported during the call.
        self.publish_info();
    }

    fn publish_info(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut info = shared.info.lock().unwrap();
        info.state = self.connectivity.state();
        info.lb_policy_name = self.policy_name.clone();
        info.service_config_json = shared
            .config
            .lock()
            .unwrap()
            .service_config
            .as_ref()
            .map(|c| c.raw_json().to_string());
    }

    fn set_connectivity(&mut self, state: ConnectivityState) {
        for watcher in self.connectivity.set_state(state) {
            self.effects.push(Box::new(move || watcher(state)));
        }
    }

    fn handle_resolver_update(&mut self, update: ResolverUpdate) {
        if self.shut_down {
            return;
        }
        let addresses = match update.addresses {
            Ok(addresses) => addresses,
            Err(err) => {
                debug!("resolver reported an error: {err}");
                if !self.have_resolver_result {
                    // No good result yet: calls waiting on the resolver fail.
                    let reason = Status::unavailable(format!("name resolution failed: {err}"));
                    for pick in std::mem::take(&mut self.waiting_for_resolver_result) {
                        let reason = reason.clone();
                        self.effects
                            .push(Box::new(move || pick.finish(Err(reason))));
                    }
                    self.set_connectivity(ConnectivityState::TransientFailure);
                    self.publish_info();
                }
                // With a previous good result, keep using it.
                return;
            }
        };

        // Publish the service config and retry throttle atomically.
        let service_config = update
            .service_config
            .as_deref()
            .and_then(|json| match ServiceConfig::parse(json) {
                Ok(config) => Some(Arc::new(config)),
                Err(err) => {
                    // Malformed configs are ignored, as if none was sent.
                    warn!("ignoring malformed service config from resolver: {err}");
                    None
                }
            })
            .or_else(|| self.default_config.clone());
        let retry_throttle = service_config.as_ref().and_then(|config| {
            config.retry_throttling.map(|t| {
                self.throttle_map
                    .get_or_create(&self.server_name, t.max_tokens, t.token_ratio)
            })
        });
        if let Some(shared) = self.shared.upgrade() {
            *shared.config.lock().unwrap() = ConfigSnapshot {
                service_config,
                retry_throttle,
            };
        }

        // Determine the policy name: explicit option, then the balancer
        // rule, then the resolver's suggestion, then the default.
        let any_balancer = addresses.iter().any(|a| a.is_balancer);
        let name: String = self
            .options
            .lb_policy_name
            .clone()
            .or_else(|| any_balancer.then(|| "grpclb".to_string()))
            .or_else(|| update.lb_policy_name.clone())
            .unwrap_or_else(|| "pick_first".to_string());

        if self.policy.is_none() || self.policy_name.as_deref() != Some(name.as_str()) {
            self.swap_policy(&name);
        }
        self.with_policy(|policy, ctl| policy.update(addresses, ctl));

        self.have_resolver_result = true;
        let waiting = std::mem::take(&mut self.waiting_for_resolver_result);
        if !waiting.is_empty() {
            trace!("dispatching {} picks that waited for the resolver", waiting.len());
            self.with_policy(|policy, ctl| {
                for pick in waiting {
                    let _ = policy.pick(pick, ctl);
                }
            });
        }
        self.publish_info();
    }

    fn swap_policy(&mut self, name: &str) {
        let builder = match GLOBAL_LB_REGISTRY.get_policy(name) {
            Some(builder) => builder,
            None => {
                // An unknown name must not leave the channel without a
                // policy; fall back to the default.
                warn!("unknown LB policy {name:?}; using pick_first");
                let Some(builder) = GLOBAL_LB_REGISTRY.get_policy("pick_first") else {
                    return;
                };
                builder
            }
        };
        debug!(
            "switching LB policy from {:?} to {name:?}",
            self.policy_name
        );
        self.policy_generation += 1;
        let scheduler = Arc::new(WorkSchedulerImpl {
            shared: self.shared.clone(),
            generation: self.policy_generation,
        });
        let mut new_policy = builder.build(LbPolicyOptions {
            work_scheduler: scheduler,
            runtime: self.runtime.clone(),
            grpclb_call_timeout: self.options.grpclb_call_timeout,
            grpclb_fallback_timeout: self.options.grpclb_fallback_timeout,
            balancer_channel_factory: self.options.balancer_channel_factory.clone(),
            server_name: self.server_name.clone(),
        });
        if let Some(mut old) = self.policy.take() {
            let mut ctl = ControllerImpl { core: &mut *self };
            old.hand_off_pending(new_policy.as_mut(), &mut ctl);
            old.shutdown(Status::unavailable("LB policy replaced"));
        }
        self.policy = Some(new_policy);
        self.policy_name = Some(name.to_string());
    }

    fn handle_pick(&mut self, pick: PickState) {
        if self.shut_down {
            self.effects.push(Box::new(move || {
                pick.finish(Err(Status::unavailable("channel is shut down")))
            }));
            return;
        }
        if !self.have_resolver_result {
            trace!("queueing pick {pick:?} until the resolver produces a result");
            self.waiting_for_resolver_result.push(pick);
            return;
        }
        self.with_policy(|policy, ctl| {
            let _ = policy.pick(pick, ctl);
        });
    }

    fn handle_cancel_pick(&mut self, id: u64, reason: Status) {
        if let Some(pos) = self
            .waiting_for_resolver_result
            .iter()
            .position(|p| p.id() == id)
        {
            let pick = self.waiting_for_resolver_result.remove(pos);
            self.effects
                .push(Box::new(move || pick.finish(Err(reason))));
            return;
        }
        self.with_policy(|policy, _| policy.cancel_pick(id, reason));
    }

    fn handle_subchannel_update(
        &mut self,
        generation: u64,
        subchannel: Arc<Subchannel>,
        state: SubchannelState,
    ) {
        if self.shut_down || generation != self.policy_generation {
            return;
        }
        self.with_policy(|policy, ctl| policy.subchannel_update(&subchannel, &state, ctl));
    }

    fn handle_policy_connectivity(&mut self, state: ConnectivityState) {
        if state == ConnectivityState::Shutdown && self.resolver.is_some() && !self.shut_down {
            // A policy that shut down from under a live resolver reads as
            // transient failure; re-resolution will produce a replacement.
            self.set_connectivity(ConnectivityState::TransientFailure);
            if let Some(resolver) = self.resolver.as_mut() {
                resolver.resolve_now();
            }
            return;
        }
        self.set_connectivity(state);
    }

    fn handle_disconnect(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.resolver = None;
        if let Some(mut policy) = self.policy.take() {
            policy.shutdown(Status::unavailable("channel disconnect"));
        }
        for pick in std::mem::take(&mut self.waiting_for_resolver_result) {
            self.effects.push(Box::new(move || {
                pick.finish(Err(Status::unavailable("channel disconnect")))
            }));
        }
        self.set_connectivity(ConnectivityState::Shutdown);
        self.publish_info();
    }

    fn new_subchannel(&mut self, address: &Address) -> Arc<Subchannel> {
        let subchannel = Subchannel::new(
            address.clone(),
            self.options.transport.clone(),
            self.runtime.clone(),
            self.options.health_check.clone(),
        );
        let weak_shared = self.shared.clone();
        let weak_sc = Arc::downgrade(&subchannel);
        let generation = self.policy_generation;
        subchannel.start_connectivity_watch(Arc::new(move |state| {
            let Some(shared) = weak_shared.upgrade() else {
                return;
            };
            let Some(sc) = weak_sc.upgrade() else {
                return;
            };
            shared.combiner.run(move |core: &mut ChannelCore| {
                core.handle_subchannel_update(generation, sc, state)
            });
        }));
        subchannel
    }
}

struct ControllerImpl<'a> {
    core: &'a mut ChannelCore,
}

impl PolicyController for ControllerImpl<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<Subchannel> {
        self.core.new_subchannel(address)
    }

    fn update_connectivity_state(&mut self, state: ConnectivityState) {
        self.core.handle_policy_connectivity(state);
    }

    fn request_resolution(&mut self) {
        if let Some(resolver) = self.core.resolver.as_mut() {
            resolver.resolve_now();
        }
    }
}

struct WorkSchedulerImpl {
    shared: Weak<ChannelShared>,
    generation: u64,
}

impl WorkScheduler for WorkSchedulerImpl {
    fn schedule_work(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let generation = self.generation;
        shared.combiner.run(move |core: &mut ChannelCore| {
            if core.shut_down || generation != core.policy_generation {
                return;
            }
            core.with_policy(|policy, ctl| policy.work(ctl));
        });
    }
}
