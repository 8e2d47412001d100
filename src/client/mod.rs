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

use std::fmt::Display;

pub mod call;
pub mod channel;
pub mod health;
pub mod load_balancing;
pub mod name_resolution;
pub mod service_config;
pub mod subchannel;

pub(crate) mod backoff;
pub(crate) mod retry_throttle;

#[cfg(test)]
pub(crate) mod test_utils;

/// A representation of the current state of a gRPC channel, also used for the
/// state of subchannels (individual connections within the channel).
///
/// A gRPC channel begins in the Idle state.  When an RPC is attempted, the
/// channel will automatically transition to Connecting.  If connections to a
/// backend service are available, the state becomes Ready.  Otherwise, if RPCs
/// would fail due to a lack of connections, the state becomes TransientFailure
/// and continues to attempt to reconnect.
///
/// Shutdown is terminal: nothing transitions out of it.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum ConnectivityState {
    #[default]
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// A one-shot connectivity-state watcher.
pub type StateWatcher = Box<dyn FnOnce(ConnectivityState) + Send>;

/// Tracks a connectivity state and a set of one-shot watchers that fire on
/// the next state change.
pub(crate) struct ConnectivityTracker {
    state: ConnectivityState,
    watchers: Vec<StateWatcher>,
}

impl ConnectivityTracker {
    pub(crate) fn new(initial: ConnectivityState) -> Self {
        ConnectivityTracker {
            state: initial,
            watchers: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Updates the state.  Returns the watchers to notify (empty if the
    /// state did not change); the caller runs them outside its state lock.
    #[must_use]
    pub(crate) fn set_state(&mut self, state: ConnectivityState) -> Vec<StateWatcher> {
        if self.state == ConnectivityState::Shutdown || state == self.state {
            return Vec::new();
        }
        self.state = state;
        std::mem::take(&mut self.watchers)
    }

    /// Registers a one-shot watcher for the next state change.
    pub(crate) fn notify_on_state_change(&mut self, watcher: StateWatcher) {
        self.watchers.push(watcher);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tracker_notifies_once_per_registration() {
        let mut tracker = ConnectivityTracker::new(ConnectivityState::Idle);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        tracker.notify_on_state_change(Box::new(move |state| {
            assert_eq!(state, ConnectivityState::Connecting);
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        // Same state: no notification.
        assert!(tracker.set_state(ConnectivityState::Idle).is_empty());

        for w in tracker.set_state(ConnectivityState::Connecting) {
            w(ConnectivityState::Connecting);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Watcher was one-shot.
        assert!(tracker.set_state(ConnectivityState::Ready).is_empty());
    }

    #[test]
    fn tracker_shutdown_is_terminal() {
        let mut tracker = ConnectivityTracker::new(ConnectivityState::Ready);
        let _ = tracker.set_state(ConnectivityState::Shutdown);
        assert!(tracker.set_state(ConnectivityState::Ready).is_empty());
        assert_eq!(tracker.state(), ConnectivityState::Shutdown);
    }
}
