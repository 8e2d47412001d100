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

//! The client-side call pipeline of a gRPC channel.
//!
//! This crate implements the pieces of a gRPC client that sit between the
//! application surface and a connected transport: the logical channel that
//! coordinates name resolution with load balancing, the per-RPC pick and
//! retry state machine, the `round_robin` and `grpclb` load-balancing
//! policies, and the subchannel health-check watcher.
//!
//! The HTTP/2 transport, TLS, credentials, and DNS mechanics are external
//! collaborators.  Their contracts are captured by the traits in [`service`]
//! and [`client::name_resolution`]; everything above those seams lives here.

pub mod client;
pub mod metadata;
pub mod service;
pub mod status;

pub(crate) mod byte_str;
pub(crate) mod rt;
pub(crate) mod sync;
