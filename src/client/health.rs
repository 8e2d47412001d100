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

//! Subchannel health checking.
//!
//! A [`HealthCheckClient`] keeps a `/grpc.health.v1.Health/Watch` stream
//! open on a connected transport and projects the responses onto a
//! connectivity signal: SERVING means ready, everything else means
//! transient failure.  A server that does not implement the health service
//! is assumed always healthy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::client::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::ConnectivityState;
use crate::rt::{BoxedTaskHandle, Runtime};
use crate::service::ConnectedTransport;
use crate::status::{Status, StatusCode};

/// The serving status carried by a health-check response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

/// One open watch stream.  `next` resolves with each streamed response, an
/// error status if the call fails, or `None` when the server closes the
/// stream cleanly.
#[async_trait]
pub trait HealthWatchStream: Send {
    async fn next(&mut self) -> Option<Result<ServingStatus, Status>>;
}

/// Starts watch streams on a connected transport.  The protobuf codec for
/// the health protocol lives behind this trait.
pub trait HealthWatchFactory: Send + Sync {
    fn start_watch(
        &self,
        transport: &Arc<dyn ConnectedTransport>,
        service: &str,
    ) -> Result<Box<dyn HealthWatchStream>, Status>;
}

pub(crate) type HealthStateSink = Arc<dyn Fn(ConnectivityState, Option<String>) + Send + Sync>;

/// Watches the health of one connected subchannel.  Dropping the client
/// cancels the in-flight stream and any pending retry timer.
pub(crate) struct HealthCheckClient {
    task: Option<BoxedTaskHandle>,
}

impl HealthCheckClient {
    pub(crate) fn new(
        service_name: String,
        transport: Arc<dyn ConnectedTransport>,
        factory: Arc<dyn HealthWatchFactory>,
        runtime: Arc<dyn Runtime>,
        sink: HealthStateSink,
    ) -> Self {
        let rt = runtime.clone();
        let task = runtime.spawn(Box::pin(async move {
            watch_loop(service_name, transport, factory, rt, sink).await;
        }));
        HealthCheckClient { task: Some(task) }
    }
}

impl Drop for HealthCheckClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn watch_loop(
    service_name: String,
    transport: Arc<dyn ConnectedTransport>,
    factory: Arc<dyn HealthWatchFactory>,
    runtime: Arc<dyn Runtime>,
    sink: HealthStateSink,
) {
    // Health-check retries use the standard connection backoff parameters.
    // The config is a compile-time constant, so this cannot fail.
    let Ok(mut backoff) = ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG) else {
        return;
    };
    loop {
        let mut saw_response = false;
        let failure: Option<Status> = match factory.start_watch(&transport, &service_name) {
            Ok(mut stream) => {
                let mut failure = None;
                loop {
                    match stream.next().await {
                        Some(Ok(status)) => {
                            saw_response = true;
                            trace!("health watch for {service_name:?} reported {status:?}");
                            if status == ServingStatus::Serving {
                                sink(ConnectivityState::Ready, None);
                            } else {
                                sink(
                                    ConnectivityState::TransientFailure,
                                    Some(format!("backend unhealthy: {status:?}")),
                                );
                            }
                        }
                        Some(Err(status)) => {
                            failure = Some(status);
                            break;
                        }
                        None => break,
                    }
                }
                failure
            }
            Err(status) => Some(status),
        };

        if let Some(status) = &failure {
            if status.code() == StatusCode::Unimplemented {
                // The server does not expose the health service; assume it
                // is always healthy and stop watching.
                debug!("health checking unimplemented for {service_name:?}; assuming healthy");
                sink(ConnectivityState::Ready, None);
                return;
            }
        }

        if saw_response {
            // The stream was healthy for a while; reconnect immediately.
            backoff.reset();
            continue;
        }
        let message = failure
            .map(|s| s.to_string())
            .unwrap_or_else(|| "health watch stream closed".to_string());
        sink(ConnectivityState::TransientFailure, Some(message));
        runtime.sleep(backoff.backoff_duration()).await;
    }
}
