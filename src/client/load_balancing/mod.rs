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

//! Load balancing for gRPC channels.
//!
//! An [`LbPolicy`] owns the subchannels for a channel and answers picks:
//! given a request's initial metadata, produce a connected subchannel, defer
//! until one is available, or drop the RPC.  All mutating operations on a
//! policy run under the channel combiner; a policy never needs its own
//! locking.

pub mod grpclb;
pub mod pick_first;
pub mod round_robin;

mod registry;
pub use registry::{LbPolicyRegistry, GLOBAL_LB_REGISTRY};

use std::sync::Arc;

use crate::byte_str::ByteStr;
use crate::client::name_resolution::Address;
use crate::client::subchannel::{Subchannel, SubchannelState};
use crate::client::{ConnectivityState, StateWatcher};
use crate::metadata::Metadata;
use crate::rt::Runtime;
use crate::service::OnPingAck;
use crate::status::Status;

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request a call into its work method without waiting for an update
    /// from the channel first.
    pub work_scheduler: Arc<dyn WorkScheduler>,
    pub(crate) runtime: Arc<dyn Runtime>,
    /// Channel configuration relevant to policies (balancer stream deadline,
    /// fallback timeout).
    pub(crate) grpclb_call_timeout: Option<std::time::Duration>,
    pub(crate) grpclb_fallback_timeout: std::time::Duration,
    pub(crate) balancer_channel_factory: Option<Arc<dyn grpclb::BalancerChannelFactory>>,
    /// The channel's server name, used in balancer requests.
    pub(crate) server_name: String,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already
    // a pending work call that has not yet started, this may not schedule
    // another call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is
    /// delivered via the LbPolicy's update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;
}

/// Grants a policy access to channel facilities while it runs under the
/// channel combiner.
pub trait PolicyController {
    /// Creates a new subchannel in Idle state for the given address.  State
    /// changes of the subchannel are delivered to the policy's
    /// subchannel_update method.
    fn new_subchannel(&mut self, address: &Address) -> Arc<Subchannel>;

    /// Reports the policy's aggregate connectivity state to the channel.
    fn update_connectivity_state(&mut self, state: ConnectivityState);

    /// Signals the name resolver to attempt to re-resolve addresses.
    /// Typically used when connections fail, indicating a possible change in
    /// the overall network configuration.
    fn request_resolution(&mut self);
}

/// The result of an LbPolicy pick operation.
#[derive(Debug, PartialEq, Eq)]
pub enum PickResult {
    /// The pick finished synchronously; its completion has already fired.
    Complete,
    /// The pick was queued; its completion will fire exactly once later,
    /// either with a subchannel or with a cancellation error.
    Queued,
}

/// A successful pick.
pub struct Pick {
    /// The connected subchannel to run the RPC on.
    pub subchannel: Arc<Subchannel>,
    /// The load-balancer token for the chosen backend, to be attached to
    /// the RPC's initial metadata.  Opaque; only grpclb produces it.
    pub lb_token: Option<ByteStr>,
    /// Threaded into the call so per-call completion can be accounted by
    /// the policy that produced the pick.
    pub call_tracker: Option<Arc<dyn CallTracker>>,
}

impl std::fmt::Debug for Pick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pick({:?}, token: {:?})", self.subchannel, self.lb_token)
    }
}

/// What a completed pick produced.
#[derive(Debug)]
pub enum PickOutcome {
    /// Use the subchannel in the Pick for the request.
    Picked(Pick),
    /// The balancer directed this RPC to fail without being sent.  Surfaced
    /// with Unavailable and never retried.
    Drop(Status),
}

pub type PickCompletion = Box<dyn FnOnce(Result<PickOutcome, Status>) + Send>;

/// The state of one pick operation.  Owned by the call until handed to the
/// policy, then owned by the policy until its completion fires.
pub struct PickState {
    pub path: ByteStr,
    pub initial_metadata: Metadata,
    pub initial_metadata_flags: u32,
    /// Queue rather than fail when no subchannel is ready.
    pub wait_for_ready: bool,
    pub(crate) id: u64,
    pub(crate) on_complete: Option<PickCompletion>,
}

impl PickState {
    pub(crate) fn new(
        path: ByteStr,
        initial_metadata: Metadata,
        initial_metadata_flags: u32,
        wait_for_ready: bool,
        id: u64,
        on_complete: PickCompletion,
    ) -> Self {
        PickState {
            path,
            initial_metadata,
            initial_metadata_flags,
            wait_for_ready,
            id,
            on_complete: Some(on_complete),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Fires the pick's completion.  Each pick completes exactly once; a
    /// second call is a no-op.
    pub fn finish(mut self, result: Result<PickOutcome, Status>) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(result);
        }
    }
}

impl std::fmt::Debug for PickState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PickState(id: {}, path: {}, wait_for_ready: {})",
            self.id, self.path, self.wait_for_ready
        )
    }
}

/// Accounts the lifecycle of one RPC for the policy that picked it.
pub trait CallTracker: Send + Sync {
    /// The RPC finished.  `failed_to_send` means no data ever reached the
    /// backend; `known_received` means the backend demonstrably processed
    /// the request (initial metadata or a message came back).
    fn call_finished(&self, failed_to_send: bool, known_received: bool);
}

/// An LB policy instance.
///
/// A policy is single-threaded: the channel serializes every call into it
/// under the channel combiner.
pub trait LbPolicy: Send {
    /// Attempts to choose a connected subchannel for an RPC.
    ///
    /// Returning [`PickResult::Complete`] promises the pick's completion has
    /// fired before returning.  Returning [`PickResult::Queued`] promises it
    /// will fire exactly once later, on success or with a cancellation
    /// error.
    fn pick(&mut self, pick: PickState, ctl: &mut dyn PolicyController) -> PickResult;

    /// Cancels the queued pick with the given id, completing it with the
    /// given error.  A no-op for unknown ids.
    fn cancel_pick(&mut self, id: u64, reason: Status);

    /// Cancels every queued pick whose initial metadata flags match
    /// `flags & mask == eq`.
    fn cancel_picks_matching(&mut self, mask: u32, eq: u32, reason: Status);

    /// Pings one connected backend, acknowledging through `on_ack`.
    fn ping_one(&mut self, on_ack: OnPingAck, ctl: &mut dyn PolicyController);

    /// Asks the policy to leave the Idle state and begin connecting.
    fn exit_idle(&mut self, ctl: &mut dyn PolicyController);

    /// The policy's current aggregate connectivity state.
    fn check_connectivity(&self) -> ConnectivityState;

    /// Registers a one-shot watcher for the policy's next connectivity
    /// state change.
    fn notify_on_state_change(&mut self, watcher: StateWatcher);

    /// Called by the channel when the name resolver produces a new address
    /// list for this policy.
    fn update(&mut self, addresses: Vec<Address>, ctl: &mut dyn PolicyController);

    /// Called by the channel when any subchannel created by this policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: &Arc<Subchannel>,
        state: &SubchannelState,
        ctl: &mut dyn PolicyController,
    );

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, ctl: &mut dyn PolicyController);

    /// Moves this policy's queued picks onto its replacement.  Called under
    /// the channel combiner just before the policy is discarded.
    fn hand_off_pending(&mut self, new_policy: &mut dyn LbPolicy, ctl: &mut dyn PolicyController);

    /// Shuts the policy down: queued picks complete with `reason`, owned
    /// subchannels are released.  Terminal.
    fn shutdown(&mut self, reason: Status);
}

/// Completes every pick in `picks` that matches `flags & mask == eq` with
/// the given error, retaining the rest.  Shared by policy implementations.
pub(crate) fn cancel_matching_picks(
    picks: &mut Vec<PickState>,
    mask: u32,
    eq: u32,
    reason: &Status,
) {
    let mut kept = Vec::with_capacity(picks.len());
    for pick in picks.drain(..) {
        if pick.initial_metadata_flags & mask == eq {
            pick.finish(Err(reason.clone()));
        } else {
            kept.push(pick);
        }
    }
    *picks = kept;
}
