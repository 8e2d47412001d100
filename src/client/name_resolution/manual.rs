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

//! A programmatic resolver.  The owner pushes address lists and service
//! configs; the channel sees them exactly as it would see updates from a
//! polling resolver.

use std::sync::{Arc, Mutex};

use super::{Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate, Target, UpdateSink};

/// A shared handle through which updates are pushed into any channel built
/// against this resolver.  The most recent update is replayed to a channel
/// that attaches after it was pushed.
#[derive(Clone, Default)]
pub struct ManualResolver {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    sink: Option<UpdateSink>,
    last_update: Option<ResolverUpdate>,
    resolve_now_count: usize,
}

impl ManualResolver {
    pub fn new() -> Self {
        ManualResolver::default()
    }

    /// Delivers an update to the attached channel, or stores it for replay
    /// if no channel is attached yet.
    pub fn push(&self, update: ResolverUpdate) {
        let sink = {
            let mut state = self.inner.state.lock().unwrap();
            state.last_update = Some(update.clone());
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.send(update);
        }
    }

    /// Delivers a resolution error.
    pub fn push_error(&self, error: impl Into<String>) {
        self.push(ResolverUpdate {
            addresses: Err(error.into()),
            ..Default::default()
        });
    }

    /// The number of times the channel has requested re-resolution.
    pub fn resolve_now_count(&self) -> usize {
        self.inner.state.lock().unwrap().resolve_now_count
    }

    /// Returns a builder that attaches channels to this resolver.
    pub fn builder(&self) -> ManualResolverBuilder {
        ManualResolverBuilder {
            inner: self.inner.clone(),
        }
    }
}

pub struct ManualResolverBuilder {
    inner: Arc<Inner>,
}

impl ResolverBuilder for ManualResolverBuilder {
    fn build(&self, _target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let replay = {
            let mut state = self.inner.state.lock().unwrap();
            state.sink = Some(options.update_sink.clone());
            state.last_update.clone()
        };
        if let Some(update) = replay {
            options.update_sink.send(update);
        }
        Box::new(AttachedResolver {
            inner: self.inner.clone(),
        })
    }

    fn scheme(&self) -> &'static str {
        "manual"
    }
}

struct AttachedResolver {
    inner: Arc<Inner>,
}

impl Resolver for AttachedResolver {
    fn resolve_now(&mut self) {
        self.inner.state.lock().unwrap().resolve_now_count += 1;
    }
}

impl Drop for AttachedResolver {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().sink = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::name_resolution::Address;
    use std::sync::mpsc;

    fn sink_into(tx: mpsc::Sender<ResolverUpdate>) -> UpdateSink {
        UpdateSink(Arc::new(move |update| {
            tx.send(update).unwrap();
        }))
    }

    #[test]
    fn pushes_updates_to_attached_sink() {
        let resolver = ManualResolver::new();
        let (tx, rx) = mpsc::channel();
        let target: Target = "manual:///svc".parse().unwrap();
        let _attached = resolver.builder().build(
            &target,
            ResolverOptions {
                update_sink: sink_into(tx),
            },
        );
        resolver.push(ResolverUpdate {
            addresses: Ok(vec![Address::backend("1.2.3.4:443")]),
            ..Default::default()
        });
        let update = rx.try_recv().unwrap();
        assert_eq!(update.addresses.unwrap().len(), 1);
    }

    #[test]
    fn replays_last_update_on_attach() {
        let resolver = ManualResolver::new();
        resolver.push(ResolverUpdate {
            addresses: Ok(vec![Address::backend("1.2.3.4:443")]),
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel();
        let target: Target = "manual:///svc".parse().unwrap();
        let _attached = resolver.builder().build(
            &target,
            ResolverOptions {
                update_sink: sink_into(tx),
            },
        );
        let update = rx.try_recv().unwrap();
        assert_eq!(update.addresses.unwrap().len(), 1);
    }

    #[test]
    fn counts_resolve_now() {
        let resolver = ManualResolver::new();
        let (tx, _rx) = mpsc::channel();
        let target: Target = "manual:///svc".parse().unwrap();
        let mut attached = resolver.builder().build(
            &target,
            ResolverOptions {
                update_sink: sink_into(tx),
            },
        );
        attached.resolve_now();
        attached.resolve_now();
        assert_eq!(resolver.resolve_now_count(), 2);
    }
}
