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

//! The per-call surface vocabulary and the transport seams.
//!
//! An RPC progresses as batches of up to seven ops.  The same [`Batch`] type
//! flows at two levels: the application submits batches to a
//! [`Call`](crate::client::call::Call), and the call state machine submits
//! (possibly reconstructed) batches to a [`TransportStream`].  The HTTP/2
//! transport itself lives behind [`Transport`] and [`ConnectedTransport`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::byte_str::ByteStr;
use crate::client::name_resolution::Address;
use crate::metadata::Metadata;
use crate::status::Status;

/// Initial-metadata flag: queue the RPC instead of failing it when no
/// subchannel is ready.
pub const WAIT_FOR_READY: u32 = 0x10;
/// Initial-metadata flag: the wait-for-ready value was supplied through the
/// API and overrides any service-config value.
pub const WAIT_FOR_READY_EXPLICITLY_SET: u32 = 0x20;

pub type OnComplete = Box<dyn FnOnce(BatchOutcome) + Send>;
pub type OnInitialMetadata = Box<dyn FnOnce(Result<RecvInitialMetadata, Status>) + Send>;
pub type OnMessage = Box<dyn FnOnce(Result<Option<Bytes>, Status>) + Send>;
pub type OnPingAck = Box<dyn FnOnce(Result<(), Status>) + Send>;

/// The payload of a completed `recv_initial_metadata` op.
#[derive(Debug, Clone)]
pub struct RecvInitialMetadata {
    pub metadata: Metadata,
    /// Set when the server produced a Trailers-Only response: there is no
    /// initial-metadata phase distinct from the trailing-metadata phase.
    pub trailers_only: bool,
}

/// The payload of a batch's `on_complete` callback.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Whether the ops in the batch were processed.  An error means the ops
    /// did not complete normally (the call was cancelled or the transport
    /// failed); callbacks for individual receive ops have already reported
    /// the same error.
    pub result: Result<(), Status>,
    /// The RPC's final status.  Present iff the batch carried
    /// `recv_trailing_metadata`.
    pub rpc_status: Option<Status>,
    /// The trailing metadata received from the server, if the batch carried
    /// `recv_trailing_metadata` and the stream produced any.
    pub trailing_metadata: Option<Metadata>,
}

impl BatchOutcome {
    pub fn completed() -> Self {
        BatchOutcome {
            result: Ok(()),
            rpc_status: None,
            trailing_metadata: None,
        }
    }

    pub fn failed(status: Status) -> Self {
        BatchOutcome {
            result: Err(status),
            rpc_status: None,
            trailing_metadata: None,
        }
    }
}

/// A set of op kinds, used to describe which ops a constructed sub-batch
/// carried when its completion comes back.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OpSet {
    bits: u8,
}

impl OpSet {
    pub const SEND_INITIAL_METADATA: OpSet = OpSet { bits: 1 << 0 };
    pub const SEND_MESSAGE: OpSet = OpSet { bits: 1 << 1 };
    pub const SEND_TRAILING_METADATA: OpSet = OpSet { bits: 1 << 2 };
    pub const RECV_INITIAL_METADATA: OpSet = OpSet { bits: 1 << 3 };
    pub const RECV_MESSAGE: OpSet = OpSet { bits: 1 << 4 };
    pub const RECV_TRAILING_METADATA: OpSet = OpSet { bits: 1 << 5 };

    pub fn empty() -> OpSet {
        OpSet::default()
    }

    pub fn with(self, other: OpSet) -> OpSet {
        OpSet {
            bits: self.bits | other.bits,
        }
    }

    pub fn contains(&self, other: OpSet) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

impl std::fmt::Debug for OpSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = vec![];
        for (bit, name) in [
            (OpSet::SEND_INITIAL_METADATA, "send_initial_metadata"),
            (OpSet::SEND_MESSAGE, "send_message"),
            (OpSet::SEND_TRAILING_METADATA, "send_trailing_metadata"),
            (OpSet::RECV_INITIAL_METADATA, "recv_initial_metadata"),
            (OpSet::RECV_MESSAGE, "recv_message"),
            (OpSet::RECV_TRAILING_METADATA, "recv_trailing_metadata"),
        ] {
            if self.contains(bit) {
                parts.push(name);
            }
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

/// A batch of RPC ops, submitted by the application to a call or by the call
/// state machine to a transport stream.
///
/// At most one batch per op kind may be pending on a call at any time; a
/// batch's kind is determined by its highest-priority op (send before
/// receive, metadata before message).
#[derive(Default)]
pub struct Batch {
    pub send_initial_metadata: Option<Metadata>,
    /// Flags accompanying `send_initial_metadata`; see [`WAIT_FOR_READY`].
    pub initial_metadata_flags: u32,
    pub send_message: Option<Bytes>,
    /// Half-closes the sending side once all preceding messages are sent.
    pub send_trailing_metadata: bool,
    pub recv_initial_metadata: bool,
    pub recv_message: bool,
    pub recv_trailing_metadata: bool,
    /// Cancels the call with the given status.  A cancel batch must not
    /// carry any other op.
    pub cancel: Option<Status>,

    pub on_initial_metadata: Option<OnInitialMetadata>,
    pub on_message: Option<OnMessage>,
    pub on_complete: Option<OnComplete>,
}

/// Number of pending-batch slots on a call: one per op kind plus one for
/// cancellation.
pub(crate) const NUM_BATCH_SLOTS: usize = 7;

impl Batch {
    /// The pending-batch slot this batch occupies, keyed by its
    /// highest-priority op.
    pub(crate) fn kind_index(&self) -> usize {
        if self.cancel.is_some() {
            return 6;
        }
        if self.send_initial_metadata.is_some() {
            return 0;
        }
        if self.send_message.is_some() {
            return 1;
        }
        if self.send_trailing_metadata {
            return 2;
        }
        if self.recv_initial_metadata {
            return 3;
        }
        if self.recv_message {
            return 4;
        }
        debug_assert!(self.recv_trailing_metadata, "empty batch");
        5
    }

    pub(crate) fn has_send_ops(&self) -> bool {
        self.send_initial_metadata.is_some()
            || self.send_message.is_some()
            || self.send_trailing_metadata
    }

    pub(crate) fn ops(&self) -> OpSet {
        let mut ops = OpSet::empty();
        if self.send_initial_metadata.is_some() {
            ops = ops.with(OpSet::SEND_INITIAL_METADATA);
        }
        if self.send_message.is_some() {
            ops = ops.with(OpSet::SEND_MESSAGE);
        }
        if self.send_trailing_metadata {
            ops = ops.with(OpSet::SEND_TRAILING_METADATA);
        }
        if self.recv_initial_metadata {
            ops = ops.with(OpSet::RECV_INITIAL_METADATA);
        }
        if self.recv_message {
            ops = ops.with(OpSet::RECV_MESSAGE);
        }
        if self.recv_trailing_metadata {
            ops = ops.with(OpSet::RECV_TRAILING_METADATA);
        }
        ops
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(status) = &self.cancel {
            return write!(f, "Batch(cancel: {status})");
        }
        write!(f, "Batch({:?})", self.ops())
    }
}

/// Arguments for starting a stream on a connected transport.
#[derive(Debug, Clone)]
pub struct StreamArgs {
    pub path: ByteStr,
    pub deadline: Option<Instant>,
}

/// One logical RPC stream on a connected transport.  Batches submitted here
/// complete through the callbacks they carry; completions for distinct
/// submissions may arrive in any order the protocol allows.
pub trait TransportStream: Send + Sync {
    fn submit(&self, batch: Batch);

    /// Tears down the stream.  Ops still in flight complete with the given
    /// status through their callbacks.
    fn cancel(&self, status: Status);
}

/// A connected transport to one backend address.
pub trait ConnectedTransport: Send + Sync {
    fn start_stream(&self, args: StreamArgs) -> Result<Arc<dyn TransportStream>, Status>;

    fn ping(&self, on_ack: OnPingAck);
}

pub type ConnectFuture =
    Pin<Box<dyn Future<Output = Result<TransportConnection, String>> + Send>>;

/// The result of a successful connection attempt.
pub struct TransportConnection {
    pub transport: Arc<dyn ConnectedTransport>,
    /// Resolves when the connection terminates, with a description of why.
    pub disconnection: tokio::sync::oneshot::Receiver<String>,
}

/// A transport factory: knows how to establish a connection to an address.
/// The HTTP/2 framer, TLS, and socket plumbing all live behind this trait.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &Address) -> ConnectFuture;
}
