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

//! The pick_first LB policy: connect to addresses in order and route every
//! RPC to the first one that becomes ready.  This is the channel's default
//! policy when the resolver names none.

use std::sync::{Arc, Once};

use tracing::{debug, trace};

use crate::client::load_balancing::{
    cancel_matching_picks, LbPolicy, LbPolicyBuilder, LbPolicyOptions, Pick, PickOutcome,
    PickResult, PickState, PolicyController, GLOBAL_LB_REGISTRY,
};
use crate::client::name_resolution::Address;
use crate::client::subchannel::{Subchannel, SubchannelList, SubchannelState};
use crate::client::{ConnectivityState, ConnectivityTracker, StateWatcher};
use crate::service::OnPingAck;
use crate::status::Status;

pub(crate) static POLICY_NAME: &str = "pick_first";
static START: Once = Once::new();

/// Registers pick_first as an LB policy.
pub fn reg() {
    START.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            list: None,
            selected: None,
            addresses: Vec::new(),
            pending_picks: Vec::new(),
            connectivity: ConnectivityTracker::new(ConnectivityState::Connecting),
            last_error: None,
            shut_down: false,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct PickFirstPolicy {
    // The subchannels we are currently connecting through, in address
    // order.  Dropped once a subchannel is selected.
    list: Option<SubchannelList>,
    // The currently connected subchannel.
    selected: Option<Arc<Subchannel>>,
    // Most recent addresses from the name resolver.
    addresses: Vec<Address>,
    pending_picks: Vec<PickState>,
    connectivity: ConnectivityTracker,
    last_error: Option<String>,
    shut_down: bool,
}

impl PickFirstPolicy {
    fn set_connectivity(&mut self, state: ConnectivityState, ctl: &mut dyn PolicyController) {
        for watcher in self.connectivity.set_state(state) {
            watcher(state);
        }
        ctl.update_connectivity_state(state);
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

    fn move_to_ready(&mut self, sc: Arc<Subchannel>, ctl: &mut dyn PolicyController) {
        debug!("pick_first selected {sc}");
        // Release every other subchannel in the list.
        if let Some(list) = self.list.take() {
            for other in list.iter() {
                if !Arc::ptr_eq(other, &sc) {
                    other.shutdown();
                }
            }
        }
        self.selected = Some(sc.clone());
        self.last_error = None;
        for pick in std::mem::take(&mut self.pending_picks) {
            pick.finish(Ok(PickOutcome::Picked(Pick {
                subchannel: sc.clone(),
                lb_token: sc.address().lb_token.clone(),
                call_tracker: None,
            })));
        }
        self.set_connectivity(ConnectivityState::Ready, ctl);
    }

    fn move_to_transient_failure(&mut self, ctl: &mut dyn PolicyController) {
        let reason = Status::unavailable(
            self.last_error
                .clone()
                .unwrap_or_else(|| "all addresses failed to connect".to_string()),
        );
        self.fail_non_wait_for_ready_picks(&reason);
        self.set_connectivity(ConnectivityState::TransientFailure, ctl);
        ctl.request_resolution();
    }

    fn build_list(&mut self, ctl: &mut dyn PolicyController) {
        let subchannels: Vec<Arc<Subchannel>> = self
            .addresses
            .iter()
            .map(|addr| ctl.new_subchannel(addr))
            .collect();
        let list = SubchannelList::new(subchannels);
        // Start connecting from the first address only; the rest follow as
        // attempts fail.
        if !list.is_empty() {
            list.get(0).connect();
        }
        if let Some(mut old) = self.list.replace(list) {
            old.shutdown_all();
        }
    }

    // Connects the first idle subchannel after `after`, if any.
    fn connect_next(&mut self, after: usize) -> bool {
        let Some(list) = self.list.as_ref() else {
            return false;
        };
        for idx in after + 1..list.len() {
            if list.state_of(idx) == ConnectivityState::Idle {
                list.get(idx).connect();
                return true;
            }
        }
        false
    }
}

impl LbPolicy for PickFirstPolicy {
    fn pick(&mut self, pick: PickState, _ctl: &mut dyn PolicyController) -> PickResult {
        if let Some(sc) = self.selected.clone() {
            let lb_token = sc.address().lb_token.clone();
            pick.finish(Ok(PickOutcome::Picked(Pick {
                subchannel: sc,
                lb_token,
                call_tracker: None,
            })));
            return PickResult::Complete;
        }
        if self.connectivity.state() == ConnectivityState::TransientFailure && !pick.wait_for_ready
        {
            let err = Status::unavailable(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| "no connected subchannel".to_string()),
            );
            pick.finish(Err(err));
            return PickResult::Complete;
        }
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
        match &self.selected {
            Some(sc) => sc.ping(on_ack),
            None => on_ack(Err(Status::unavailable("no connected subchannel to ping"))),
        }
    }

    fn exit_idle(&mut self, ctl: &mut dyn PolicyController) {
        if self.selected.is_none() && self.list.is_none() && !self.addresses.is_empty() {
            self.build_list(ctl);
            self.set_connectivity(ConnectivityState::Connecting, ctl);
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
            debug!("pick_first received an empty address list");
            self.addresses = Vec::new();
            if let Some(mut list) = self.list.take() {
                list.shutdown_all();
            }
            if let Some(sc) = self.selected.take() {
                sc.shutdown();
            }
            self.last_error = Some("empty address list from the name resolver".to_string());
            self.move_to_transient_failure(ctl);
            return;
        }
        self.addresses = addresses;
        if let Some(sc) = self.selected.take() {
            sc.shutdown();
        }
        self.build_list(ctl);
        self.set_connectivity(ConnectivityState::Connecting, ctl);
    }

    fn subchannel_update(
        &mut self,
        subchannel: &Arc<Subchannel>,
        state: &SubchannelState,
        ctl: &mut dyn PolicyController,
    ) {
        trace!(
            "pick_first got update for {subchannel}: {}",
            state.connectivity_state
        );
        // Any state change of the selected subchannel means we are no
        // longer connected.
        if let Some(selected) = &self.selected {
            if Arc::ptr_eq(selected, subchannel) {
                if state.connectivity_state != ConnectivityState::Ready {
                    self.selected = None;
                    ctl.request_resolution();
                    self.build_list(ctl);
                    self.set_connectivity(ConnectivityState::Connecting, ctl);
                }
                return;
            }
        }
        let Some(list) = self.list.as_mut() else {
            return;
        };
        let Some(index) = list.index_of(subchannel) else {
            return;
        };
        list.update_state(subchannel, state.connectivity_state);
        match state.connectivity_state {
            ConnectivityState::Ready => {
                self.move_to_ready(subchannel.clone(), ctl);
            }
            ConnectivityState::TransientFailure => {
                if let Some(err) = &state.last_connection_error {
                    self.last_error = Some(err.clone());
                }
                if !self.connect_next(index) {
                    // End of the list: every address has been tried.
                    self.move_to_transient_failure(ctl);
                }
            }
            ConnectivityState::Idle => {
                // A subchannel whose backoff expired; try it again.
                subchannel.connect();
            }
            ConnectivityState::Connecting => {
                if self.connectivity.state() != ConnectivityState::TransientFailure {
                    self.set_connectivity(ConnectivityState::Connecting, ctl);
                }
            }
            ConnectivityState::Shutdown => {}
        }
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
        if let Some(mut list) = self.list.take() {
            list.shutdown_all();
        }
        if let Some(sc) = self.selected.take() {
            sc.shutdown();
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
        Box<dyn LbPolicy>,
        TestPolicyController,
    ) {
        reg();
        let (rx, controller, options, _transport) = policy_setup(None);
        let policy = GLOBAL_LB_REGISTRY
            .get_policy(POLICY_NAME)
            .unwrap()
            .build(options);
        (rx, policy, controller)
    }

    fn addresses(n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| Address::backend(format!("10.0.0.{}:443", i + 1)))
            .collect()
    }

    fn collect_subchannels(
        rx: &mut mpsc::UnboundedReceiver<TestEvent>,
        count: usize,
    ) -> Vec<Arc<Subchannel>> {
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
        policy: &mut Box<dyn LbPolicy>,
        sc: &Arc<Subchannel>,
        state: ConnectivityState,
        ctl: &mut TestPolicyController,
    ) {
        policy.subchannel_update(
            sc,
            &SubchannelState {
                connectivity_state: state,
                last_connection_error: (state == ConnectivityState::TransientFailure)
                    .then(|| "connection refused".to_string()),
            },
            ctl,
        );
    }

    // The first subchannel to become ready is selected; queued picks
    // complete against it and the rest of the list is released.
    #[tokio::test]
    async fn pickfirst_selects_first_ready() {
        let (mut rx, mut policy, mut ctl) = setup();
        policy.update(addresses(2), &mut ctl);
        let subchannels = collect_subchannels(&mut rx, 2);

        let (pick, mut result_rx) = test_pick(1, 0, false);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Queued);

        move_to_state(&mut policy, &subchannels[0], ConnectivityState::Ready, &mut ctl);
        let sc = picked_subchannel(result_rx.try_recv().unwrap());
        assert!(Arc::ptr_eq(&sc, &subchannels[0]));
        assert_eq!(policy.check_connectivity(), ConnectivityState::Ready);

        // Subsequent picks complete synchronously with the selection.
        let (pick, mut result_rx) = test_pick(2, 0, false);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Complete);
        assert!(Arc::ptr_eq(
            &picked_subchannel(result_rx.try_recv().unwrap()),
            &subchannels[0]
        ));

        // The unused subchannel was shut down.
        settle().await;
        assert_eq!(subchannels[1].state(), ConnectivityState::Shutdown);
    }

    // Failures walk the list in order; exhausting it is a transient
    // failure with a re-resolution request.
    #[tokio::test]
    async fn pickfirst_walks_list_then_fails() {
        let (mut rx, mut policy, mut ctl) = setup();
        policy.update(addresses(2), &mut ctl);
        let subchannels = collect_subchannels(&mut rx, 2);

        let (pick, mut result_rx) = test_pick(1, 0, false);
        policy.pick(pick, &mut ctl);

        move_to_state(
            &mut policy,
            &subchannels[0],
            ConnectivityState::TransientFailure,
            &mut ctl,
        );
        assert!(result_rx.try_recv().is_err());
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
        assert!(err.message().contains("connection refused"));

        let mut requested = false;
        while let Ok(event) = rx.try_recv() {
            requested |= matches!(event, TestEvent::RequestResolution);
        }
        assert!(requested);
    }

    // Losing the selected connection goes back to connecting and asks the
    // resolver for fresh addresses.
    #[tokio::test]
    async fn pickfirst_reconnects_when_selection_drops() {
        let (mut rx, mut policy, mut ctl) = setup();
        policy.update(addresses(1), &mut ctl);
        let subchannels = collect_subchannels(&mut rx, 1);
        move_to_state(&mut policy, &subchannels[0], ConnectivityState::Ready, &mut ctl);
        assert_eq!(policy.check_connectivity(), ConnectivityState::Ready);

        move_to_state(&mut policy, &subchannels[0], ConnectivityState::Idle, &mut ctl);
        assert_eq!(policy.check_connectivity(), ConnectivityState::Connecting);
        let mut requested = false;
        while let Ok(event) = rx.try_recv() {
            requested |= matches!(event, TestEvent::RequestResolution);
        }
        assert!(requested);
    }

    // Empty updates reset everything and report transient failure.
    #[tokio::test]
    async fn pickfirst_empty_update() {
        let (mut rx, mut policy, mut ctl) = setup();
        policy.update(Vec::new(), &mut ctl);
        assert_eq!(
            policy.check_connectivity(),
            ConnectivityState::TransientFailure
        );
        let (pick, mut result_rx) = test_pick(1, 0, false);
        assert_eq!(policy.pick(pick, &mut ctl), PickResult::Complete);
        assert!(result_rx.try_recv().unwrap().is_err());
        let mut requested = false;
        while let Ok(event) = rx.try_recv() {
            requested |= matches!(event, TestEvent::RequestResolution);
        }
        assert!(requested);
    }
}
