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

//! The round_robin LB policy: rotate picks across every ready subchannel.
//!
//! Address updates build a fresh subchannel list.  While picks are being
//! served from the current list, a new list waits as "latest pending" and is
//! promoted the moment one of its subchannels first reaches Ready; the old
//! list is then shut down atomically, so picks never observe a half-updated
//! rotation.

use std::sync::{Arc, Once};

use tracing::{debug, trace};

use crate::client::load_balancing::{
    cancel_matching_picks, LbPolicy, LbPolicyBuilder, LbPolicyOptions, PickOutcome, PickResult,
    PickState, Pick, PolicyController, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::{Subchannel, SubchannelList, SubchannelState};
use crate::client::{ConnectivityState, ConnectivityTracker, StateWatcher};
use crate::service::OnPingAck;
use crate::status::Status;

pub(crate) static POLICY_NAME: &str = "round_robin";
static START: Once = Once::new();

/// Registers round_robin as an LB policy.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(RoundRobinBuilder {});
    });
}

struct RoundRobinBuilder {}

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy::new())
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

pub(crate) struct RoundRobinPolicy {
    current: Option<SubchannelList>,
    // The latest list from an update that arrived while picking; promoted
    // when one of its subchannels first reaches Ready.
    latest_pending: Option<SubchannelList>,
    last_picked: Option<usize>,
    pending_picks: Vec<PickState>,
    connectivity: ConnectivityTracker,
    started_picking: bool,
    last_error: Option<String>,
    shut_down: bool,
}

impl RoundRobinPolicy {
    pub(crate) fn new() -> Self {
        RoundRobinPolicy {
            current: None,
            latest_pending: None,
            last_picked: None,
            pending_picks: Vec::new(),
            connectivity: ConnectivityTracker::new(ConnectivityState::Connecting),
            started_picking: false,
            last_error: None,
            shut_down: false,
        }
    }

    // Scans the current list from one past the last-picked index for a
    // ready subchannel.
    fn next_ready_index(&self) -> Option<usize> {
        let list = self.current.as_ref()?;
        let n = list.len();
        if n == 0 {
            return None;
        }
        let start = match self.last_picked {
            Some(i) => (i + 1) % n,
            None => 0,
        };
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&idx| list.state_of(idx) == ConnectivityState::Ready)
    }

    fn pick_from_rotation(&mut self) -> Option<Pick> {
        let idx = self.next_ready_index()?;
        self.last_picked = Some(idx);
        let list = self.current.as_ref()?;
        let subchannel = list.get(idx).clone();
        let lb_token = subchannel.address().lb_token.clone();
        Some(Pick {
            subchannel,
            lb_token,
            call_tracker: None,
        })
    }

    fn drain_pending_picks(&mut self) {
        while !self.pending_picks.is_empty() {
            let Some(pick) = self.pick_from_rotation() else {
                return;
            };
            let pending = self.pending_picks.remove(0);
            trace!("round_robin fulfilling queued pick {pending:?}");
            pending.finish(Ok(PickOutcome::Picked(pick)));
        }
    }

    fn set_connectivity(&mut self, state: ConnectivityState, ctl: &mut dyn PolicyController) {
        for watcher in self.connectivity.set_state(state) {
            watcher(state);
        }
        ctl.update_connectivity_state(state);
    }

    // Recomputes the policy state from the current list and reacts to it.
    fn refresh_connectivity(&mut self, ctl: &mut dyn PolicyController) {
        let Some(list) = self.current.as_ref() else {
            return;
        };
        let aggregate = list.aggregate_state();
        if aggregate.request_reresolution {
            ctl.request_resolution();
        }
        let state = aggregate.state;
        self.set_connectivity(state, ctl);
        if state == ConnectivityState::TransientFailure {
            // Wait-for-ready picks stay queued through transient failure;
            // everything else fails now.
            let reason = Status::unavailable(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| "all subchannels failed to connect".to_string()),
            );
            self.fail_non_wait_for_ready_picks(&reason);
        }
    }

    fn fail_non_wait_for_ready_picks(&mut self, reason: &Status) {
        let mut kept = Vec::with_capacity(self.pending_picks.len());
        for pick in self.pending_picks.drain(..) {
            if pick.wait_for_ready {
                kept.push(pick);
            } else {
                pick.finish(Err(reason.clone()));
            }
        }
        self.pending_picks = kept;
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn pick(&mut self, pick: PickState, _ctl: &mut dyn PolicyController) -> PickResult {
        self.started_picking = true;
        if let Some(choice) = self.pick_from_rotation() {
            pick.finish(Ok(PickOutcome::Picked(choice)));
            return PickResult::Complete;
        }
        if self.connectivity.state() == ConnectivityState::TransientFailure && !pick.wait_for_ready
        {
            let err = Status::unavailable(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| "no ready subchannels".to_string()),
            );
            pick.finish(Err(err));
            return PickResult::Complete;
        }
        trace!("round_robin queueing pick {pick:?}");
        self.pending_picks.push(pick);
        PickResult::Queued
    }

    fn cancel_pick(&mut self, id: u64, reason: Status) {
        if let Some(pos) = self.pending_picks.iter().position(|p| p.id() == id) {
            let pick = self.pending_picks.remove(pos);
            pick.finish(Err(reason));
        }
    }

    fn cancel_picks_matching(&mut self, mask: u32, eq: u32, reason: Status) {
        cancel_matching_picks(&mut self.pending_picks, mask, eq, &reason);
    }

    fn ping_one(&mut self, on_ack: OnPingAck, _ctl: &mut dyn PolicyController) {
        match self.next_ready_index() {
            Some(idx) => {
                // A ping does not advance the rotation.
                if let Some(list) = self.current.as_ref() {
                    list.get(idx).ping(on_ack);
                }
            }
            None => on_ack(Err(Status::unavailable("no ready subchannels to ping"))),
        }
    }

    fn exit_idle(&mut self, _ctl: &mut dyn PolicyController) {
        if let Some(list) = self.current.as_ref() {
            list.connect_all();
        }
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
        if addresses.is_empty() {
            // Keep an (empty) list installed so a later update supersedes
            // it, but fail fast until then.
            debug!("round_robin received an empty address list");
            if let Some(mut old) = self.current.replace(SubchannelList::new(Vec::new())) {
                old.shutdown_all();
            }
            if let Some(mut pending) = self.latest_pending.take() {
                pending.shutdown_all();
            }
            self.last_picked = None;
            self.last_error = Some("empty address list from the name resolver".to_string());
            let reason = Status::unavailable(self.last_error.clone().unwrap_or_default());
            self.fail_non_wait_for_ready_picks(&reason);
            self.set_connectivity(ConnectivityState::TransientFailure, ctl);
            ctl.request_resolution();
            return;
        }

        let subchannels: Vec<Arc<Subchannel>> = addresses
            .iter()
            .map(|addr| ctl.new_subchannel(addr))
            .collect();
        let list = SubchannelList::new(subchannels);
        list.connect_all();

        if !self.started_picking || self.current.is_none() {
            // Not picking yet: the new list becomes active directly.
            if let Some(mut old) = self.current.replace(list) {
                old.shutdown_all();
            }
            self.last_picked = None;
        } else {
            // Picking: keep serving from the current list and promote the
            // new one when it first produces a ready subchannel.
            if let Some(mut old) = self.latest_pending.replace(list) {
                old.shutdown_all();
            }
        }
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<Subchannel>,
        state: &SubchannelState,
        ctl: &mut dyn PolicyController,
    ) {
        trace!(
            "round_robin got update for {subchannel}: {}",
            state.connectivity_state
        );
        if let Some(pending) = self.latest_pending.as_mut() {
            if pending.contains(subchannel) {
                pending.update_state(subchannel, state.connectivity_state);
                if state.connectivity_state == ConnectivityState::Ready {
                    // Promote: the pending list replaces the current list
                    // atomically, and the rotation restarts at its head.
                    debug!("round_robin promoting latest pending list");
                    let promoted = self.latest_pending.take();
                    if let Some(mut old) = self.current.take() {
                        old.shutdown_all();
                    }
                    self.current = promoted;
                    self.last_picked = None;
                    self.drain_pending_picks();
                    self.refresh_connectivity(ctl);
                }
                return;
            }
        }

        let Some(list) = self.current.as_mut() else {
            return;
        };
        if list.update_state(subchannel, state.connectivity_state).is_none() {
            // A subchannel from a list that has already been shut down.
            return;
        }
        match state.connectivity_state {
            ConnectivityState::Ready => {
                self.drain_pending_picks();
            }
            ConnectivityState::Idle => {
                // Reconnect subchannels that fall back to idle after a lost
                // connection or an expired backoff.
                subchannel.connect();
            }
            ConnectivityState::TransientFailure => {
                if let Some(err) = &state.last_connection_error {
                    self.last_error = Some(err.clone());
                }
            }
            _ => {}
        }
        self.refresh_connectivity(ctl);
    }

    fn work(&mut self, _ctl: &mut dyn PolicyController) {}

    fn hand_off_pending(&mut self, new_policy: &mut dyn LbPolicy, ctl: &mut dyn PolicyController) {
        for pick in std::mem::take(&mut self.pending_picks) {
            let _ = new_policy.pick(pick, ctl);
        }
    }

    fn shutdown(&mut self, reason: Status) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for pick in std::mem::take(&mut self.pending_picks) {
            pick.finish(Err(reason.clone()));
        }
        if let Some(mut list) = self.current.take() {
            list.shutdown_all();
        }
        if let Some(mut list) = self.latest_pending.take() {
            list.shutdown_all();
        }
        for watcher in self.connectivity.set_state(ConnectivityState::Shutdown) {
            watcher(ConnectivityState::Shutdown);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::load_balancing::PickOutcome;
    use crate::client::test_utils::{
        picked_subchannel, policy_setup, settle, test_pick, TestEvent, TestPolicyController,
    };
    use crate::status::StatusCode;
    use tokio::sync::mpsc;

    fn setup() -> (
        mpsc::UnboundedReceiver<TestEvent>,
        RoundRobinPolicy,
        TestPolicyController,
    ) {
        let (rx_events, controller, _options, _transport) = policy_setup(None);
        (rx_events, RoundRobinPolicy::new(), controller)
    }

    fn backends(n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| Address::backend(format!("10.0.0.{}:443", i + 1)))
            .collect()
    }

    // Sends an address update and collects the subchannels the policy
    // created for it.
    fn send_update(
        policy: &mut RoundRobinPolicy,
        addresses: Vec<Address>,
        ctl: &mut TestPolicyController,
        rx: &mut mpsc::UnboundedReceiver<TestEvent>,
    ) -> Vec<Arc<Subchannel>> {
        let count = addresses.len();
        policy.update(addresses, ctl);
        let mut subchannels = Vec::new();
        while subchannels.len() < count {
            match rx.try_recv().expect("expected subchannel creation") {
                TestEvent::NewSubchannel(sc) => subchannels.push(sc),
                _ => {}
            }
        }
        subchannels
    }

    fn move_to_state(
        policy: &mut RoundRobinPolicy,
        sc: &Arc<Subchannel>,
        state: ConnectivityState,
        ctl: &mut TestPolicyController,
    ) {
        policy.subchannel_update(
            sc,
            &SubchannelState {
                connectivity_state: state,
                last_connection_error: (state == ConnectivityState::TransientFailure)
                    .then(|| "test connection error".to_string()),
            },
            ctl,
        );
    }

    fn drain_connectivity(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Vec<ConnectivityState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TestEvent::Connectivity(state) = event {
                states.push(state);
            }
        }
        states
    }

    // Picks issued against ready subchannels rotate one past the
    // last-picked index, visiting every ready subchannel evenly.
    #[tokio::test]
    async fn roundrobin_rotation_is_fair() {
        let (mut rx, mut policy, mut ctl) = setup();
        let subchannels = send_update(&mut policy, backends(3), &mut ctl, &mut rx);
        for sc in &subchannels {
            move_to_state(&mut policy, sc, ConnectivityState::Ready, &mut ctl);
        }
        assert_eq!(policy.check_connectivity(), ConnectivityState::Ready);

        let mut counts = vec![0usize; 3];
        let mut order = Vec::new();
        for i in 0..9 {
            let (pick, mut result_rx) = test_pick(i, 0, false);
            assert_eq!(policy.pick(pick, &mut ctl), PickResult::Complete);
            let sc = picked_subchannel(result_rx.try_recv().unwrap());
            let idx = subchannels
                .iter()
                .position(|s| Arc::ptr_eq(s, &sc))
                .unwrap();
            counts[idx] += 1;
            order.push(idx);
        }
        assert_eq!(counts, vec![3, 3, 3]);
        // Consecutive picks rotate.
        for window in order.windows(2) {
            assert_eq!(window[1], (window[0] + 1) % 3);
        }
    }

    // Picks made before any subchannel is ready queue, and are fulfilled
    // the moment one becomes ready.
    #[tokio::test]
    async fn roundrobin_queues_picks_until_ready() {
        let (mut rx, mut policy, mut ctl) = setup();
        let subchannels = send_update(&mut policy, backends(2), &mut ctl, &mut rx);

        let (pick, mut result_rx) = test_pick(1, 0, false);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Queued);
        assert!(result_rx.try_recv().is_err());

        move_to_state(&mut policy, &subchannels[1], ConnectivityState::Ready, &mut ctl);
        let sc = picked_subchannel(result_rx.try_recv().unwrap());
        assert!(Arc::ptr_eq(&sc, &subchannels[1]));
    }

    // An update that arrives while picking installs a latest-pending list;
    // picks keep hitting the old list until a new subchannel first reaches
    // ready, at which point the switch is atomic and the rotation restarts
    // at the new list's head.
    #[tokio::test]
    async fn roundrobin_promotes_pending_list_on_first_ready() {
        let (mut rx, mut policy, mut ctl) = setup();
        let old = send_update(&mut policy, backends(1), &mut ctl, &mut rx);
        move_to_state(&mut policy, &old[0], ConnectivityState::Ready, &mut ctl);

        let (pick, mut result_rx) = test_pick(1, 0, false);
        policy.pick(pick, &mut ctl);
        assert!(Arc::ptr_eq(
            &picked_subchannel(result_rx.try_recv().unwrap()),
            &old[0]
        ));

        // New update with two connecting backends.
        let new = send_update(
            &mut policy,
            vec![
                Address::backend("10.0.1.1:443"),
                Address::backend("10.0.1.2:443"),
            ],
            &mut ctl,
            &mut rx,
        );
        move_to_state(&mut policy, &new[0], ConnectivityState::Connecting, &mut ctl);
        move_to_state(&mut policy, &new[1], ConnectivityState::Connecting, &mut ctl);

        // Still picking from the old list.
        let (pick, mut result_rx) = test_pick(2, 0, false);
        policy.pick(pick, &mut ctl);
        assert!(Arc::ptr_eq(
            &picked_subchannel(result_rx.try_recv().unwrap()),
            &old[0]
        ));

        // The first new subchannel to become ready triggers the promotion.
        move_to_state(&mut policy, &new[1], ConnectivityState::Ready, &mut ctl);
        let (pick, mut result_rx) = test_pick(3, 0, false);
        policy.pick(pick, &mut ctl);
        assert!(Arc::ptr_eq(
            &picked_subchannel(result_rx.try_recv().unwrap()),
            &new[1]
        ));

        // The old list was shut down with the promotion.
        settle().await;
        assert_eq!(old[0].state(), ConnectivityState::Shutdown);
    }

    // Empty updates move the policy to transient failure and request
    // re-resolution, but a later update supersedes the empty list.
    #[tokio::test]
    async fn roundrobin_empty_update_is_transient_failure() {
        let (mut rx, mut policy, mut ctl) = setup();
        policy.update(Vec::new(), &mut ctl);
        let states = drain_connectivity(&mut rx);
        assert!(states.contains(&ConnectivityState::TransientFailure));

        // Non-wait-for-ready picks fail immediately.
        let (pick, mut result_rx) = test_pick(1, 0, false);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Complete);
        let err = result_rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code(), StatusCode::Unavailable);

        // Wait-for-ready picks stay queued through the failure.
        let (pick, mut wfr_rx) = test_pick(2, 0, true);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Queued);

        let subchannels = send_update(&mut policy, backends(1), &mut ctl, &mut rx);
        move_to_state(&mut policy, &subchannels[0], ConnectivityState::Ready, &mut ctl);
        let sc = picked_subchannel(wfr_rx.try_recv().unwrap());
        assert!(Arc::ptr_eq(&sc, &subchannels[0]));
    }

    // All subchannels failing aggregates to transient failure and fails
    // queued non-wait-for-ready picks with the connection error.
    #[tokio::test]
    async fn roundrobin_all_failures_is_transient_failure() {
        let (mut rx, mut policy, mut ctl) = setup();
        let subchannels = send_update(&mut policy, backends(2), &mut ctl, &mut rx);

        let (pick, mut result_rx) = test_pick(1, 0, false);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Queued);

        move_to_state(
            &mut policy,
            &subchannels[0],
            ConnectivityState::TransientFailure,
            &mut ctl,
        );
        move_to_state(
            &mut policy,
            &subchannels[1],
            ConnectivityState::TransientFailure,
            &mut ctl,
        );
        assert_eq!(
            policy.check_connectivity(),
            ConnectivityState::TransientFailure
        );
        let err = result_rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code(), StatusCode::Unavailable);
        assert!(err.message().contains("test connection error"));
    }

    // cancel_pick removes exactly the matching pick and completes it with
    // the cancellation error.
    #[tokio::test]
    async fn roundrobin_cancel_pick() {
        let (mut rx, mut policy, mut ctl) = setup();
        let _ = send_update(&mut policy, backends(1), &mut ctl, &mut rx);

        let (pick_a, mut rx_a) = test_pick(1, 0, false);
        let (pick_b, mut rx_b) = test_pick(2, 0, false);
        policy.pick(pick_a, &mut ctl);
        policy.pick(pick_b, &mut ctl);

        policy.cancel_pick(1, Status::cancelled("caller went away"));
        let err = rx_a.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code(), StatusCode::Cancelled);
        assert!(rx_b.try_recv().is_err());

        // Unknown ids are ignored.
        policy.cancel_pick(99, Status::cancelled("nobody"));
        assert!(rx_b.try_recv().is_err());
    }

    // cancel_picks_matching masks the initial-metadata flags.
    #[tokio::test]
    async fn roundrobin_cancel_picks_matching() {
        let (mut rx, mut policy, mut ctl) = setup();
        let _ = send_update(&mut policy, backends(1), &mut ctl, &mut rx);

        let (pick_a, mut rx_a) = test_pick(1, 0x10, false);
        let (pick_b, mut rx_b) = test_pick(2, 0x30, false);
        let (pick_c, mut rx_c) = test_pick(3, 0x00, false);
        policy.pick(pick_a, &mut ctl);
        policy.pick(pick_b, &mut ctl);
        policy.pick(pick_c, &mut ctl);

        policy.cancel_picks_matching(0x10, 0x10, Status::cancelled("mask"));
        assert!(rx_a.try_recv().unwrap().is_err());
        assert!(rx_b.try_recv().unwrap().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    // Queued picks move to a replacement policy and complete there.
    #[tokio::test]
    async fn roundrobin_hand_off_pending() {
        let (mut rx, mut policy, mut ctl) = setup();
        let _ = send_update(&mut policy, backends(1), &mut ctl, &mut rx);
        let (pick, mut result_rx) = test_pick(1, 0, false);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Queued);

        let mut replacement = RoundRobinPolicy::new();
        let new_subchannels = send_update(&mut replacement, backends(1), &mut ctl, &mut rx);
        policy.hand_off_pending(&mut replacement, &mut ctl);
        policy.shutdown(Status::unavailable("replaced"));
        // The pick was not failed by the old policy's shutdown.
        assert!(result_rx.try_recv().is_err());

        move_to_state(
            &mut replacement,
            &new_subchannels[0],
            ConnectivityState::Ready,
            &mut ctl,
        );
        let sc = picked_subchannel(result_rx.try_recv().unwrap());
        assert!(Arc::ptr_eq(&sc, &new_subchannels[0]));
    }

    #[tokio::test]
    async fn roundrobin_shutdown_fails_queued_picks() {
        let (mut rx, mut policy, mut ctl) = setup();
        let _ = send_update(&mut policy, backends(1), &mut ctl, &mut rx);
        let (pick, mut result_rx) = test_pick(1, 0, true);
        policy.pick(pick, &mut ctl);
        policy.shutdown(Status::unavailable("going away"));
        let err = result_rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code(), StatusCode::Unavailable);
        assert_eq!(policy.check_connectivity(), ConnectivityState::Shutdown);
    }
}
