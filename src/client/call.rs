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

//! The per-RPC call state machine.
//!
//! A call accepts batches of ops from the surface, holds them in one slot
//! per op kind, performs an LB pick on its first send, and runs the ops on
//! a subchannel call.  When the method's service config carries a retry
//! policy, sends are cached for replay, receive completions are
//! intercepted, and a failed attempt may be retried on a new subchannel
//! under exponential backoff until the call commits.  The surface observes
//! every callback exactly once no matter how many attempts ran.
//!
//! All per-call work is serialized on the call combiner.  Surface callbacks
//! run as effects after the combiner state is released.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::byte_str::ByteStr;
use crate::client::backoff::{BackoffConfig, ExponentialBackoff};
use crate::client::channel::ChannelShared;
use crate::client::load_balancing::{CallTracker, PickOutcome};
use crate::client::retry_throttle::RetryThrottle;
use crate::client::service_config::RetryPolicy;
use crate::client::subchannel::SubchannelCall;
use crate::metadata::Metadata;
use crate::service::{
    Batch, BatchOutcome, OpSet, RecvInitialMetadata, StreamArgs, NUM_BATCH_SLOTS,
    WAIT_FOR_READY, WAIT_FOR_READY_EXPLICITLY_SET,
};
use crate::status::{Status, StatusCode};
use crate::sync::{Combiner, CombinerState, Effect};

// The metadata key carrying the grpclb token for the picked backend.
const LB_TOKEN_KEY: &str = "lb-token";

// Retry backoff jitter matches the connection backoff.
const RETRY_BACKOFF_JITTER: f64 = 0.2;

/// One RPC on a channel.
///
/// Ops are submitted in batches via [`Call::start_batch`]; at most one
/// batch per op kind may be outstanding at a time.  Dropping the `Call`
/// handle does not cancel the RPC; submit a cancel batch (or use
/// [`Call::cancel`]) for that.
pub struct Call {
    combiner: Combiner<CallCore>,
}

impl Call {
    pub(crate) fn new(
        channel: Arc<ChannelShared>,
        path: ByteStr,
        deadline: Option<Instant>,
    ) -> Call {
        let core = CallCore {
            channel,
            path,
            api_deadline: deadline,
            deadline,
            phase: CallPhase::NotStarted,
            retry_committed: false,
            pending: Default::default(),
            cancel_error: None,
            config_applied: false,
            retry_policy: None,
            retry_throttle: None,
            wait_for_ready: false,
            deadline_task: None,
            cached_initial_metadata: None,
            cached_messages: Vec::new(),
            send_trailing_cached: false,
            bytes_buffered: 0,
            attempt: None,
            attempt_seq: 0,
            attempts_started: 0,
            retry_backoff: None,
            retry_task: None,
            pick_id: None,
            call_finished_recorded: false,
            handle: None,
            effects: Vec::new(),
        };
        let combiner = Combiner::new(core);
        let handle = combiner.clone();
        combiner.run(move |core: &mut CallCore| core.handle = Some(handle.clone()));
        Call { combiner }
    }

    /// Submits a batch of ops.
    pub fn start_batch(&self, batch: Batch) {
        self.combiner.run(move |core| core.start_batch(batch));
    }

    /// Cancels the call.  Equivalent to a batch carrying only a cancel op.
    pub fn cancel(&self, status: Status) {
        self.start_batch(Batch {
            cancel: Some(status),
            ..Default::default()
        });
    }
}

// The attempt lifecycle of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPhase {
    NotStarted,
    AwaitingPick,
    Dispatching,
    AwaitingRetry,
    Done,
}

struct PendingBatch {
    batch: Batch,
    // The ops the batch carried, snapshotted before they are moved into
    // transport batches.
    ops: OpSet,
    // Retry pre-checks ran and the sends were cached for replay.
    retry_checks_done: bool,
    // Sent down the current attempt (direct mode only).
    in_flight: bool,
    // Index of this batch's message in the cached-messages sequence.
    msg_index: Option<usize>,
    // Receive results not yet returned to the surface.
    initial_metadata_outstanding: bool,
    message_outstanding: bool,
}

impl PendingBatch {
    fn new(batch: Batch) -> Self {
        let ops = batch.ops();
        PendingBatch {
            initial_metadata_outstanding: ops.contains(OpSet::RECV_INITIAL_METADATA),
            message_outstanding: ops.contains(OpSet::RECV_MESSAGE),
            batch,
            ops,
            retry_checks_done: false,
            in_flight: false,
            msg_index: None,
        }
    }
}

// Per-attempt bookkeeping: which ops have been started on the subchannel
// call and which have completed.  A fresh instance accompanies every
// attempt.
#[derive(Default)]
struct AttemptRetryState {
    started_send_initial_metadata: bool,
    completed_send_initial_metadata: bool,
    started_send_message_count: usize,
    completed_send_message_count: usize,
    started_send_trailing_metadata: bool,
    completed_send_trailing_metadata: bool,
    started_recv_initial_metadata: bool,
    completed_recv_initial_metadata: bool,
    started_recv_message_count: usize,
    completed_recv_message_count: usize,
    started_recv_trailing_metadata: bool,
    completed_recv_trailing_metadata: bool,
    // A retry has been dispatched from this attempt; later completions of
    // the same attempt must not dispatch another.
    retry_dispatched: bool,
    // Receive results held back until the trailing metadata decides
    // whether this attempt is retried.
    deferred_initial_metadata: Option<RecvInitialMetadata>,
    deferred_message: Option<Option<Bytes>>,
}

struct Attempt {
    seq: u64,
    subchannel_call: Arc<SubchannelCall>,
    retry_state: AttemptRetryState,
    lb_token: Option<ByteStr>,
    tracker: Option<Arc<dyn CallTracker>>,
}

pub(crate) struct CallCore {
    channel: Arc<ChannelShared>,
    path: ByteStr,

    phase: CallPhase,
    retry_committed: bool,
    pending: [Option<PendingBatch>; NUM_BATCH_SLOTS],
    cancel_error: Option<Status>,

    // Service config application (first attempt only).
    config_applied: bool,
    retry_policy: Option<RetryPolicy>,
    retry_throttle: Option<Arc<RetryThrottle>>,
    wait_for_ready: bool,

    api_deadline: Option<Instant>,
    deadline: Option<Instant>,
    deadline_task: Option<crate::rt::BoxedTaskHandle>,

    // Send caches retained for replay until the call commits.
    cached_initial_metadata: Option<(Metadata, u32)>,
    cached_messages: Vec<Option<Bytes>>,
    send_trailing_cached: bool,
    bytes_buffered: usize,

    attempt: Option<Attempt>,
    attempt_seq: u64,
    attempts_started: u32,
    retry_backoff: Option<ExponentialBackoff>,
    retry_task: Option<crate::rt::BoxedTaskHandle>,
    pick_id: Option<u64>,
    call_finished_recorded: bool,

    // Handle onto our own combiner, used to build interceptors and timer
    // callbacks.  Cleared when the call finishes so the cycle breaks.
    handle: Option<Combiner<CallCore>>,
    effects: Vec<Effect>,
}

impl CombinerState for CallCore {
    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

impl CallCore {
    fn retries_active(&self) -> bool {
        self.retry_policy.is_some() && !self.retry_committed
    }

    fn start_batch(&mut self, batch: Batch) {
        if let Some(status) = batch.cancel {
            self.handle_cancel(status);
            return;
        }
        if let Some(err) = &self.cancel_error {
            let err = err.clone();
            self.fail_batch(batch, err);
            return;
        }
        if self.phase == CallPhase::Done {
            self.fail_batch(
                batch,
                Status::internal("batch submitted after the call completed"),
            );
            return;
        }
        let idx = batch.kind_index();
        debug_assert!(
            self.pending[idx].is_none(),
            "a batch of this kind is already pending"
        );
        let starting = self.phase == CallPhase::NotStarted && batch.send_initial_metadata.is_some();
        self.pending[idx] = Some(PendingBatch::new(batch));
        match self.phase {
            CallPhase::NotStarted => {
                if starting {
                    self.begin_call();
                }
            }
            CallPhase::Dispatching => self.dispatch_pending(),
            // Queued batches replay when the next attempt starts.
            CallPhase::AwaitingPick | CallPhase::AwaitingRetry => {}
            CallPhase::Done => unreachable!("handled above"),
        }
    }

    // ===== call startup =====

    fn begin_call(&mut self) {
        self.apply_service_config();
        self.arm_deadline_timer();
        self.start_pick();
    }

    // Applies the method's service config to the call.  Runs on the first
    // attempt only; retries reuse the values chosen here.
    fn apply_service_config(&mut self) {
        if self.config_applied {
            return;
        }
        self.config_applied = true;
        let snapshot = self.channel.config_snapshot();
        let method_config = snapshot
            .service_config
            .as_ref()
            .and_then(|config| config.method_config(&self.path));

        let flags = self.initial_metadata_flags();
        let config_wait_for_ready = method_config
            .as_ref()
            .and_then(|mc| mc.wait_for_ready)
            .unwrap_or(false);
        // An API-supplied wait-for-ready value overrides the config's.
        self.wait_for_ready = if flags & WAIT_FOR_READY_EXPLICITLY_SET != 0 {
            flags & WAIT_FOR_READY != 0
        } else {
            config_wait_for_ready
        };

        if let Some(mc) = &method_config {
            if let Some(timeout) = mc.timeout {
                // The effective deadline is the tighter of the API's and
                // the config's.
                let config_deadline = Instant::now() + timeout;
                self.deadline = Some(match self.api_deadline {
                    Some(api) => api.min(config_deadline),
                    None => config_deadline,
                });
            }
            self.retry_policy = mc.retry_policy.clone();
            if self.retry_policy.is_some() {
                self.retry_throttle = snapshot.retry_throttle.clone();
            }
        }
    }

    fn initial_metadata_flags(&self) -> u32 {
        if let Some((_, flags)) = &self.cached_initial_metadata {
            return *flags;
        }
        self.pending[0]
            .as_ref()
            .map(|pb| pb.batch.initial_metadata_flags)
            .unwrap_or(0)
    }

    fn pick_initial_metadata(&self) -> Metadata {
        if let Some((md, _)) = &self.cached_initial_metadata {
            return md.clone();
        }
        self.pending[0]
            .as_ref()
            .and_then(|pb| pb.batch.send_initial_metadata.clone())
            .unwrap_or_default()
    }

    fn arm_deadline_timer(&mut self) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if self.deadline_task.is_some() {
            return;
        }
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let delay = deadline.saturating_duration_since(Instant::now());
        let runtime = self.channel.runtime();
        self.deadline_task = Some(runtime.clone().spawn(Box::pin(async move {
            runtime.sleep(delay).await;
            handle.run(|core: &mut CallCore| {
                core.handle_cancel(Status::deadline_exceeded("deadline exceeded"));
            });
        })));
    }

    fn start_pick(&mut self) {
        self.phase = CallPhase::AwaitingPick;
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let seq = self.attempt_seq;
        let id = self.channel.clone().pick_subchannel(
            self.path.clone(),
            self.pick_initial_metadata(),
            self.initial_metadata_flags(),
            self.wait_for_ready,
            Box::new(move |result| {
                handle.run(move |core: &mut CallCore| core.on_pick_complete(seq, result));
            }),
        );
        self.pick_id = Some(id);
    }

    fn on_pick_complete(&mut self, seq: u64, result: Result<PickOutcome, Status>) {
        if self.phase != CallPhase::AwaitingPick || seq != self.attempt_seq {
            return;
        }
        self.pick_id = None;
        if self.cancel_error.is_some() {
            // The call was cancelled while the pick raced to completion.
            if let Ok(PickOutcome::Picked(pick)) = result {
                if let Some(tracker) = pick.call_tracker {
                    self.effects
                        .push(Box::new(move || tracker.call_finished(true, false)));
                }
            }
            return;
        }
        match result {
            Ok(PickOutcome::Picked(pick)) => {
                let stream_args = StreamArgs {
                    path: self.path.clone(),
                    deadline: self.deadline,
                };
                match pick.subchannel.create_call(stream_args) {
                    Ok(subchannel_call) => {
                        self.create_attempt(subchannel_call, pick.lb_token, pick.call_tracker);
                    }
                    Err(status) => {
                        if !self.maybe_retry(status.clone()) {
                            self.fail_call(status);
                        }
                    }
                }
            }
            Ok(PickOutcome::Drop(status)) => {
                // Balancer-directed drops are never retried.
                debug!("call {} dropped by the load balancer", self.path);
                self.commit();
                self.fail_call(Status::unavailable(status.message().to_string()));
            }
            Err(status) => {
                if !self.maybe_retry(status.clone()) {
                    self.fail_call(status);
                }
            }
        }
    }

    fn create_attempt(
        &mut self,
        subchannel_call: Arc<SubchannelCall>,
        lb_token: Option<ByteStr>,
        tracker: Option<Arc<dyn CallTracker>>,
    ) {
        self.attempt_seq += 1;
        self.attempts_started += 1;
        trace!("call {} starting attempt {}", self.path, self.attempts_started);
        self.attempt = Some(Attempt {
            seq: self.attempt_seq,
            subchannel_call,
            retry_state: AttemptRetryState::default(),
            lb_token,
            tracker,
        });
        self.phase = CallPhase::Dispatching;
        // Everything queued replays onto the fresh attempt.
        for pb in self.pending.iter_mut().flatten() {
            pb.in_flight = false;
            pb.initial_metadata_outstanding = pb.ops.contains(OpSet::RECV_INITIAL_METADATA);
            pb.message_outstanding = pb.ops.contains(OpSet::RECV_MESSAGE);
        }
        self.dispatch_pending();
    }

    // ===== dispatch =====

    fn dispatch_pending(&mut self) {
        if self.phase != CallPhase::Dispatching {
            return;
        }
        // Run retry pre-checks for send batches that have not seen them.
        if self.retries_active() {
            for idx in 0..NUM_BATCH_SLOTS {
                let needs_check = matches!(
                    &self.pending[idx],
                    Some(pb) if !pb.retry_checks_done && !pb.in_flight && pb.batch.has_send_ops()
                );
                if needs_check {
                    self.run_retry_checks(idx);
                    if !self.retries_active() {
                        // The buffer cap committed the call.
                        break;
                    }
                }
            }
        }
        if self.retries_active() {
            self.maybe_start_ops();
        } else {
            // Committed or no retry policy: batches flow through as
            // submitted, and cached sends still finish replaying.
            self.maybe_start_ops();
            for idx in 0..NUM_BATCH_SLOTS {
                let ready = matches!(
                    &self.pending[idx],
                    Some(pb) if !pb.in_flight && !pb.retry_checks_done
                );
                if ready {
                    self.dispatch_batch_direct(idx);
                }
            }
        }
    }

    // Caches a send batch's payloads for replay: the metadata is copied,
    // each message is retained, and the accumulated size is charged against
    // the per-RPC retry buffer.  Exceeding the cap commits the call.
    fn run_retry_checks(&mut self, idx: usize) {
        let Some(pb) = self.pending[idx].as_mut() else {
            return;
        };
        let mut added = 0;
        if let Some(md) = &pb.batch.send_initial_metadata {
            added += md.byte_size();
        }
        if let Some(msg) = &pb.batch.send_message {
            added += msg.len();
        }
        if self.bytes_buffered + added > self.channel.per_rpc_retry_buffer_size() {
            debug!(
                "call {} exceeded the retry buffer cap; committing",
                self.path
            );
            self.commit();
            return;
        }
        self.bytes_buffered += added;
        pb.retry_checks_done = true;
        if let Some(md) = pb.batch.send_initial_metadata.take() {
            self.cached_initial_metadata = Some((md, pb.batch.initial_metadata_flags));
        }
        if let Some(msg) = pb.batch.send_message.take() {
            self.cached_messages.push(Some(msg));
            pb.msg_index = Some(self.cached_messages.len() - 1);
        }
        if pb.batch.send_trailing_metadata {
            self.send_trailing_cached = true;
        }
    }

    // Replays cached sends and starts pending receives on the current
    // attempt, honoring the ordering discipline: initial metadata first, at
    // most one message in flight, trailing metadata only once every cached
    // message has been issued.
    fn maybe_start_ops(&mut self) {
        if self.attempt.is_none() {
            return;
        }
        // Receives claimed by this replay engine: ops of batches whose
        // pre-checks cached them, plus recv-only batches while retries are
        // still possible.  Direct-mode batches carry their own receives.
        let retries_active = self.retries_active();
        let claimed = |pb: &PendingBatch| {
            pb.retry_checks_done || (!pb.batch.has_send_ops() && retries_active)
        };
        let want_initial = self
            .pending
            .iter()
            .flatten()
            .any(|pb| claimed(pb) && pb.ops.contains(OpSet::RECV_INITIAL_METADATA));
        let want_message = self
            .pending
            .iter()
            .flatten()
            .any(|pb| claimed(pb) && pb.message_outstanding);
        let want_trailing = self
            .pending
            .iter()
            .flatten()
            .any(|pb| claimed(pb) && pb.ops.contains(OpSet::RECV_TRAILING_METADATA));

        let attempt = self
            .attempt
            .as_mut()
            .unwrap_or_else(|| unreachable!("checked above"));
        let rs = &mut attempt.retry_state;
        let mut tb = Batch::default();
        let mut ops = OpSet::empty();

        if !rs.started_send_initial_metadata {
            if let Some((md, flags)) = &self.cached_initial_metadata {
                let mut md = md.clone();
                if let Some(token) = &attempt.lb_token {
                    md.replace(LB_TOKEN_KEY, token.clone());
                }
                tb.send_initial_metadata = Some(md);
                tb.initial_metadata_flags = *flags;
                rs.started_send_initial_metadata = true;
                ops = ops.with(OpSet::SEND_INITIAL_METADATA);
            }
        }
        let sends_quiet = rs.started_send_message_count == rs.completed_send_message_count;
        if sends_quiet && rs.started_send_message_count < self.cached_messages.len() {
            if let Some(msg) = &self.cached_messages[rs.started_send_message_count] {
                tb.send_message = Some(msg.clone());
                rs.started_send_message_count += 1;
                ops = ops.with(OpSet::SEND_MESSAGE);
            }
        }
        if self.send_trailing_cached
            && !rs.started_send_trailing_metadata
            && rs.started_send_message_count == self.cached_messages.len()
        {
            tb.send_trailing_metadata = true;
            rs.started_send_trailing_metadata = true;
            ops = ops.with(OpSet::SEND_TRAILING_METADATA);
        }

        if want_initial && !rs.started_recv_initial_metadata {
            tb.recv_initial_metadata = true;
            rs.started_recv_initial_metadata = true;
            ops = ops.with(OpSet::RECV_INITIAL_METADATA);
        }
        let recvs_quiet = rs.started_recv_message_count == rs.completed_recv_message_count;
        if want_message && recvs_quiet {
            tb.recv_message = true;
            rs.started_recv_message_count += 1;
            ops = ops.with(OpSet::RECV_MESSAGE);
        }
        if want_trailing && !rs.started_recv_trailing_metadata {
            tb.recv_trailing_metadata = true;
            rs.started_recv_trailing_metadata = true;
            ops = ops.with(OpSet::RECV_TRAILING_METADATA);
        }

        if ops.is_empty() {
            return;
        }
        self.submit_intercepted(tb, ops);
    }

    // Passes a surface batch through to the current attempt as-is.  Used
    // when retries are not configured or no longer possible; completions
    // still route through the interceptors for bookkeeping.
    fn dispatch_batch_direct(&mut self, idx: usize) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let rs = &mut attempt.retry_state;
        let Some(pb) = self.pending[idx].as_mut() else {
            return;
        };
        pb.in_flight = true;
        let mut tb = Batch::default();
        let mut ops = OpSet::empty();
        if let Some(mut md) = pb.batch.send_initial_metadata.take() {
            if let Some(token) = &attempt.lb_token {
                md.replace(LB_TOKEN_KEY, token.clone());
            }
            tb.send_initial_metadata = Some(md);
            tb.initial_metadata_flags = pb.batch.initial_metadata_flags;
            rs.started_send_initial_metadata = true;
            ops = ops.with(OpSet::SEND_INITIAL_METADATA);
        }
        if let Some(msg) = pb.batch.send_message.take() {
            tb.send_message = Some(msg);
            pb.msg_index = Some(rs.started_send_message_count);
            rs.started_send_message_count += 1;
            ops = ops.with(OpSet::SEND_MESSAGE);
        }
        if pb.batch.send_trailing_metadata && !rs.started_send_trailing_metadata {
            tb.send_trailing_metadata = true;
            rs.started_send_trailing_metadata = true;
            ops = ops.with(OpSet::SEND_TRAILING_METADATA);
        }
        // Skip receive ops the replay engine already started on this
        // attempt; their completions route to this batch regardless.
        if pb.batch.recv_initial_metadata && !rs.started_recv_initial_metadata {
            tb.recv_initial_metadata = true;
            rs.started_recv_initial_metadata = true;
            ops = ops.with(OpSet::RECV_INITIAL_METADATA);
        }
        if pb.batch.recv_message && rs.started_recv_message_count == rs.completed_recv_message_count
        {
            tb.recv_message = true;
            rs.started_recv_message_count += 1;
            ops = ops.with(OpSet::RECV_MESSAGE);
        }
        if pb.batch.recv_trailing_metadata && !rs.started_recv_trailing_metadata {
            tb.recv_trailing_metadata = true;
            rs.started_recv_trailing_metadata = true;
            ops = ops.with(OpSet::RECV_TRAILING_METADATA);
        }
        if ops.is_empty() {
            return;
        }
        self.submit_intercepted(tb, ops);
    }

    // Installs the call's interceptors on a constructed batch and submits
    // it to the subchannel call outside the combiner state.
    fn submit_intercepted(&mut self, mut tb: Batch, ops: OpSet) {
        let Some(attempt) = self.attempt.as_ref() else {
            return;
        };
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let seq = attempt.seq;
        if ops.contains(OpSet::RECV_INITIAL_METADATA) {
            let handle = handle.clone();
            tb.on_initial_metadata = Some(Box::new(move |result| {
                handle.run(move |core: &mut CallCore| {
                    core.on_recv_initial_metadata_ready(seq, result)
                });
            }));
        }
        if ops.contains(OpSet::RECV_MESSAGE) {
            let handle = handle.clone();
            tb.on_message = Some(Box::new(move |result| {
                handle.run(move |core: &mut CallCore| core.on_recv_message_ready(seq, result));
            }));
        }
        {
            let handle = handle.clone();
            tb.on_complete = Some(Box::new(move |outcome| {
                handle.run(move |core: &mut CallCore| core.on_subbatch_complete(seq, ops, outcome));
            }));
        }
        let subchannel_call = attempt.subchannel_call.clone();
        trace!("call {} submitting {:?}", self.path, ops);
        self.effects
            .push(Box::new(move || subchannel_call.process_op(tb)));
    }

    // ===== intercepted receive completions =====

    fn attempt_matches(&self, seq: u64) -> bool {
        matches!(&self.attempt, Some(a) if a.seq == seq)
    }

    fn on_recv_initial_metadata_ready(
        &mut self,
        seq: u64,
        result: Result<RecvInitialMetadata, Status>,
    ) {
        if !self.attempt_matches(seq) {
            return;
        }
        let rs = &mut self
            .attempt
            .as_mut()
            .unwrap_or_else(|| unreachable!("attempt_matches checked"))
            .retry_state;
        rs.completed_recv_initial_metadata = true;
        match result {
            Err(status) => {
                if self.retries_active() && self.maybe_retry(status.clone()) {
                    return;
                }
                self.deliver_initial_metadata(Err(status));
            }
            Ok(rim) => {
                if rim.trailers_only
                    && self.retries_active()
                    && !self
                        .attempt
                        .as_ref()
                        .map(|a| a.retry_state.completed_recv_trailing_metadata)
                        .unwrap_or(true)
                {
                    // Trailers-Only: hold the callback until the trailing
                    // metadata decides whether this attempt is retried.
                    trace!("call {} deferring trailers-only initial metadata", self.path);
                    if let Some(a) = self.attempt.as_mut() {
                        a.retry_state.deferred_initial_metadata = Some(rim);
                    }
                    return;
                }
                self.commit();
                self.deliver_initial_metadata(Ok(rim));
            }
        }
    }

    fn on_recv_message_ready(&mut self, seq: u64, result: Result<Option<Bytes>, Status>) {
        if !self.attempt_matches(seq) {
            return;
        }
        let rs = &mut self
            .attempt
            .as_mut()
            .unwrap_or_else(|| unreachable!("attempt_matches checked"))
            .retry_state;
        rs.completed_recv_message_count += 1;
        match result {
            Err(status) => {
                if self.retries_active() && self.maybe_retry(status.clone()) {
                    return;
                }
                self.deliver_message(Err(status));
            }
            Ok(None) => {
                let trailing_done = self
                    .attempt
                    .as_ref()
                    .map(|a| a.retry_state.completed_recv_trailing_metadata)
                    .unwrap_or(true);
                if self.retries_active() && !trailing_done {
                    // An empty stream may still be retried; wait for the
                    // trailing metadata.
                    if let Some(a) = self.attempt.as_mut() {
                        a.retry_state.deferred_message = Some(None);
                    }
                    return;
                }
                self.commit();
                self.deliver_message(Ok(None));
            }
            Ok(Some(bytes)) => {
                self.commit();
                self.deliver_message(Ok(Some(bytes)));
            }
        }
    }

    fn on_subbatch_complete(&mut self, seq: u64, ops: OpSet, outcome: BatchOutcome) {
        if !self.attempt_matches(seq) {
            return;
        }
        {
            let rs = &mut self
                .attempt
                .as_mut()
                .unwrap_or_else(|| unreachable!("attempt_matches checked"))
                .retry_state;
            if ops.contains(OpSet::SEND_INITIAL_METADATA) {
                rs.completed_send_initial_metadata = true;
            }
            if ops.contains(OpSet::SEND_MESSAGE) {
                rs.completed_send_message_count += 1;
            }
            if ops.contains(OpSet::SEND_TRAILING_METADATA) {
                rs.completed_send_trailing_metadata = true;
            }
            if ops.contains(OpSet::RECV_TRAILING_METADATA) {
                rs.completed_recv_trailing_metadata = true;
            }
        }

        let call_over = ops.contains(OpSet::RECV_TRAILING_METADATA) || outcome.result.is_err();
        if call_over {
            let status = match &outcome.result {
                Err(status) => status.clone(),
                Ok(()) => match &outcome.rpc_status {
                    Some(status) => status.clone(),
                    None => outcome
                        .trailing_metadata
                        .as_ref()
                        .map(Status::from_trailing_metadata)
                        .unwrap_or_else(|| Status::new(StatusCode::Unknown, "stream ended")),
                },
            };
            if self.retries_active() && self.maybe_retry(status.clone()) {
                return;
            }
            self.finish_attempt(status, outcome);
            return;
        }

        // A send-only sub-batch finished: surface whatever became complete,
        // release cached payloads the commit no longer needs, and keep the
        // replay moving.
        self.fire_completed_batches(None);
        self.free_cached_sends();
        self.dispatch_pending();
    }

    // ===== completion =====

    // The attempt's final status is in: flush deferred receives, surface
    // every finished batch, and close out the call.
    fn finish_attempt(&mut self, status: Status, outcome: BatchOutcome) {
        if self.retries_active() {
            // The retry decision passed on this status; no later attempt
            // will run.
            self.commit();
        }
        self.record_call_finished();
        let transport_failed = outcome.result.is_err();
        let (deferred_initial, deferred_message) = match self.attempt.as_mut() {
            Some(a) => (
                a.retry_state.deferred_initial_metadata.take(),
                a.retry_state.deferred_message.take(),
            ),
            None => (None, None),
        };
        if let Some(rim) = deferred_initial {
            self.deliver_initial_metadata(Ok(rim));
        }
        if let Some(msg) = deferred_message {
            self.deliver_message(Ok(msg));
        }
        if transport_failed {
            // Receive ops that never produced a result carry the error.
            while self
                .pending
                .iter()
                .flatten()
                .any(|pb| pb.initial_metadata_outstanding)
            {
                self.deliver_initial_metadata(Err(status.clone()));
            }
            while self.pending.iter().flatten().any(|pb| pb.message_outstanding) {
                self.deliver_message(Err(status.clone()));
            }
        }
        let trailing = outcome.trailing_metadata.clone();
        self.fire_completed_batches(Some((status.clone(), trailing)));
        if transport_failed {
            // Batches whose other ops died with the stream fail as units.
            self.fail_all_pending(status);
        }
        self.phase = CallPhase::Done;
        self.finish_call();
    }

    fn record_call_finished(&mut self) {
        if self.call_finished_recorded {
            return;
        }
        let Some(attempt) = self.attempt.as_ref() else {
            return;
        };
        let Some(tracker) = attempt.tracker.clone() else {
            self.call_finished_recorded = true;
            return;
        };
        self.call_finished_recorded = true;
        let rs = &attempt.retry_state;
        let failed_to_send = !rs.completed_send_initial_metadata;
        let known_received =
            rs.completed_recv_initial_metadata || rs.completed_recv_message_count > 0;
        self.effects
            .push(Box::new(move || tracker.call_finished(failed_to_send, known_received)));
    }

    fn deliver_initial_metadata(&mut self, result: Result<RecvInitialMetadata, Status>) {
        if result.is_ok() {
            // Metadata handed to the surface cannot be un-received.
            self.commit();
        }
        let Some(pb) = self
            .pending
            .iter_mut()
            .flatten()
            .find(|pb| pb.initial_metadata_outstanding)
        else {
            return;
        };
        pb.initial_metadata_outstanding = false;
        if let Some(cb) = pb.batch.on_initial_metadata.take() {
            self.effects.push(Box::new(move || cb(result)));
        }
        self.fire_completed_batches(None);
    }

    fn deliver_message(&mut self, result: Result<Option<Bytes>, Status>) {
        if matches!(&result, Ok(Some(_))) {
            self.commit();
        }
        let Some(pb) = self
            .pending
            .iter_mut()
            .flatten()
            .find(|pb| pb.message_outstanding)
        else {
            return;
        };
        pb.message_outstanding = false;
        if let Some(cb) = pb.batch.on_message.take() {
            self.effects.push(Box::new(move || cb(result)));
        }
        self.fire_completed_batches(None);
    }

    // Whether every op of the pending batch has completed on the current
    // attempt.
    fn batch_is_complete(&self, pb: &PendingBatch) -> bool {
        let Some(attempt) = self.attempt.as_ref() else {
            return false;
        };
        let rs = &attempt.retry_state;
        if pb.ops.contains(OpSet::SEND_INITIAL_METADATA) && !rs.completed_send_initial_metadata {
            return false;
        }
        if pb.ops.contains(OpSet::SEND_MESSAGE) {
            match pb.msg_index {
                Some(index) if index < rs.completed_send_message_count => {}
                _ => return false,
            }
        }
        if pb.ops.contains(OpSet::SEND_TRAILING_METADATA) && !rs.completed_send_trailing_metadata {
            return false;
        }
        if pb.initial_metadata_outstanding || pb.message_outstanding {
            return false;
        }
        if pb.ops.contains(OpSet::RECV_TRAILING_METADATA) && !rs.completed_recv_trailing_metadata {
            return false;
        }
        true
    }

    // Fires on_complete for every pending batch whose ops have all
    // completed.  `finality` carries the RPC status and trailing metadata
    // for the batch that carried recv_trailing_metadata.
    fn fire_completed_batches(&mut self, finality: Option<(Status, Option<Metadata>)>) {
        for idx in 0..NUM_BATCH_SLOTS {
            let complete = matches!(&self.pending[idx], Some(pb) if self.batch_is_complete(pb));
            if !complete {
                continue;
            }
            let Some(pb) = self.pending[idx].take() else {
                continue;
            };
            let outcome = if pb.ops.contains(OpSet::RECV_TRAILING_METADATA) {
                let (status, trailing) = match &finality {
                    Some((status, trailing)) => (status.clone(), trailing.clone()),
                    None => (Status::ok(), None),
                };
                BatchOutcome {
                    result: Ok(()),
                    rpc_status: Some(status),
                    trailing_metadata: trailing,
                }
            } else {
                BatchOutcome::completed()
            };
            if let Some(cb) = pb.batch.on_complete {
                self.effects.push(Box::new(move || cb(outcome)));
            }
        }
    }

    // ===== retries =====

    // The retry decision.  Returns true when a retry was dispatched (or one
    // is already in flight) and the surface must not observe this failure.
    fn maybe_retry(&mut self, status: Status) -> bool {
        if let Some(attempt) = self.attempt.as_ref() {
            if attempt.retry_state.retry_dispatched {
                return true;
            }
        }
        if status.is_ok() {
            if let Some(throttle) = &self.retry_throttle {
                throttle.record_success();
            }
            return false;
        }
        let Some(policy) = self.retry_policy.clone() else {
            return false;
        };
        if !policy.is_retryable(status.code()) {
            return false;
        }
        if let Some(throttle) = &self.retry_throttle {
            if !throttle.record_failure() {
                debug!("call {} retry suppressed by the retry throttle", self.path);
                return false;
            }
        }
        if self.retry_committed {
            return false;
        }
        // attempts_started counts the original attempt too, so the retry
        // budget is exhausted once it exceeds the configured maximum.
        if self.attempts_started > policy.max_retry_attempts {
            trace!(
                "call {} exhausted its {} retry attempts",
                self.path,
                policy.max_retry_attempts
            );
            return false;
        }
        if self.cancel_error.is_some() {
            return false;
        }

        // Dispose of the current attempt and arm the retry timer.
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.retry_state.retry_dispatched = true;
        }
        let old = self.attempt.take();
        if let Some(old) = old {
            let subchannel_call = old.subchannel_call;
            self.effects.push(Box::new(move || {
                subchannel_call.cancel(Status::cancelled("attempt superseded by a retry"));
            }));
        }
        if self.retry_backoff.is_none() {
            self.retry_backoff = ExponentialBackoff::new(BackoffConfig {
                base_delay: policy.initial_backoff,
                multiplier: policy.backoff_multiplier,
                jitter: RETRY_BACKOFF_JITTER,
                max_delay: policy.max_backoff,
            })
            .ok();
        }
        let delay = match self.retry_backoff.as_mut() {
            Some(backoff) => backoff.backoff_duration(),
            None => policy.initial_backoff,
        };
        debug!(
            "call {} retrying after {:?} (status {})",
            self.path,
            delay,
            status.code()
        );
        self.phase = CallPhase::AwaitingRetry;
        let Some(handle) = self.handle.clone() else {
            return false;
        };
        let runtime = self.channel.runtime();
        self.retry_task = Some(runtime.clone().spawn(Box::pin(async move {
            runtime.sleep(delay).await;
            handle.run(|core: &mut CallCore| core.on_retry_timer());
        })));
        true
    }

    fn on_retry_timer(&mut self) {
        self.retry_task = None;
        if self.phase != CallPhase::AwaitingRetry || self.cancel_error.is_some() {
            return;
        }
        self.start_pick();
    }

    // ===== commit =====

    // Commits the call: retries become impossible and buffered sends are
    // released as soon as their replays complete.
    fn commit(&mut self) {
        if self.retry_committed {
            return;
        }
        trace!("call {} committed", self.path);
        self.retry_committed = true;
        self.free_cached_sends();
    }

    fn free_cached_sends(&mut self) {
        if !self.retry_committed {
            return;
        }
        match self.attempt.as_ref() {
            Some(attempt) => {
                let rs = &attempt.retry_state;
                if rs.completed_send_initial_metadata {
                    self.cached_initial_metadata = None;
                }
                for idx in 0..rs.completed_send_message_count.min(self.cached_messages.len()) {
                    self.cached_messages[idx] = None;
                }
                if self.phase == CallPhase::Done {
                    self.cached_initial_metadata = None;
                    self.cached_messages.clear();
                }
            }
            None => {
                self.cached_initial_metadata = None;
                self.cached_messages.clear();
            }
        }
    }

    // ===== cancellation, deadline, failure =====

    fn handle_cancel(&mut self, status: Status) {
        if self.phase == CallPhase::Done || self.cancel_error.is_some() {
            return;
        }
        debug!("call {} cancelled: {status}", self.path);
        self.cancel_error = Some(status.clone());
        self.commit();
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        if let Some(task) = self.deadline_task.take() {
            task.abort();
        }
        if let Some(id) = self.pick_id.take() {
            let channel = self.channel.clone();
            let reason = status.clone();
            self.effects
                .push(Box::new(move || channel.cancel_pick(id, reason)));
        }
        match self.attempt.as_ref() {
            Some(attempt) => {
                // The subchannel call tears down its transport state; its
                // completions carry the error back through the
                // interceptors.
                let subchannel_call = attempt.subchannel_call.clone();
                self.effects
                    .push(Box::new(move || subchannel_call.cancel(status)));
            }
            None => {
                self.fail_all_pending(status);
                self.phase = CallPhase::Done;
                self.finish_call();
            }
        }
    }

    fn fail_call(&mut self, status: Status) {
        self.commit();
        self.record_call_finished();
        self.cancel_error = Some(status.clone());
        self.fail_all_pending(status);
        self.phase = CallPhase::Done;
        self.finish_call();
    }

    fn fail_batch(&mut self, mut batch: Batch, status: Status) {
        if let Some(cb) = batch.on_initial_metadata.take() {
            let status = status.clone();
            self.effects.push(Box::new(move || cb(Err(status))));
        }
        if let Some(cb) = batch.on_message.take() {
            let status = status.clone();
            self.effects.push(Box::new(move || cb(Err(status))));
        }
        if let Some(cb) = batch.on_complete.take() {
            self.effects
                .push(Box::new(move || cb(BatchOutcome::failed(status))));
        }
    }

    fn fail_all_pending(&mut self, status: Status) {
        for idx in 0..NUM_BATCH_SLOTS {
            if let Some(pb) = self.pending[idx].take() {
                self.fail_batch(pb.batch, status.clone());
            }
        }
    }

    fn finish_call(&mut self) {
        if let Some(task) = self.deadline_task.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        // Anything still pending can never complete now.
        if self.pending.iter().any(Option::is_some) {
            let status = self
                .cancel_error
                .clone()
                .unwrap_or_else(|| Status::internal("call completed with unfinished ops"));
            self.fail_all_pending(status);
        }
        self.free_cached_sends();
        self.cached_initial_metadata = None;
        self.cached_messages.clear();
        self.bytes_buffered = 0;
        // Break the combiner cycle so the call core can drop.
        self.handle = None;
    }
}
