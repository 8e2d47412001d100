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

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted
//! into network addresses used by the channel to connect to a service.  The
//! mechanics of DNS live behind the [`Resolver`] trait; this crate ships a
//! [`manual`] resolver for programmatic address lists.

use core::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::byte_str::ByteStr;

pub mod manual;

mod registry;
pub use registry::global_registry;

/// Target represents a target for gRPC, parsed from the target string that
/// gets passed during channel creation by the user. gRPC passes it to the
/// resolver and the balancer.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Url>() {
            Ok(url) => Ok(Target { url }),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl Target {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The host part of the authority.
    pub fn authority_host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// The port part of the authority.
    pub fn authority_port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Retrieves the endpoint from the URL path.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The server name picks the retry-throttle bucket and names the service
    /// in balancer and health-check requests: the path with its leading
    /// slash removed, falling back to the authority host.
    pub fn server_name(&self) -> String {
        let path = self.path();
        let name = path.strip_prefix('/').unwrap_or(path);
        if name.is_empty() {
            return self.authority_host().to_string();
        }
        name.to_string()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// An Address is an identifier that indicates how to connect to a server.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Address {
    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: ByteStr,

    /// Set when this address points at a load balancer speaking the grpclb
    /// protocol rather than a backend.  Any balancer address in a resolver
    /// update forces the channel's LB policy to grpclb.
    pub is_balancer: bool,

    /// The balancer's name, for balancer addresses.
    pub balancer_name: Option<ByteStr>,

    /// An opaque token attached by a load balancer to a backend address.
    /// Only grpclb picks consume it.
    pub lb_token: Option<ByteStr>,
}

impl Address {
    pub fn backend(address: impl Into<ByteStr>) -> Self {
        Address {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn balancer(address: impl Into<ByteStr>, name: impl Into<ByteStr>) -> Self {
        Address {
            address: address.into(),
            is_balancer: true,
            balancer_name: Some(name.into()),
            ..Default::default()
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.is_balancer == other.is_balancer
    }
}

impl Eq for Address {}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_balancer {
            write!(f, "balancer:{}", self.address)
        } else {
            write!(f, "{}", self.address)
        }
    }
}

/// ResolverUpdate contains the current Resolver state relevant to the
/// channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// The addresses that serve the target, or the error that prevented
    /// resolution.
    pub addresses: Result<Vec<Address>, String>,

    /// The LB policy the resolver asks the channel to use, if any.  A
    /// balancer address anywhere in `addresses` takes precedence and forces
    /// grpclb.
    pub lb_policy_name: Option<String>,

    /// The service config for the target as a JSON document, if the
    /// resolver provides one.  A config that fails to parse is ignored.
    pub service_config: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            addresses: Ok(Vec::new()),
            lb_policy_name: None,
            service_config: None,
        }
    }
}

/// Resolver watches for updates on the specified target, delivering address
/// lists and service configs through the sink it was built with.
pub trait Resolver: Send {
    /// Asks the resolver to obtain an updated result, if applicable.
    ///
    /// This is useful for polling resolvers to decide when to re-resolve.
    /// However, the implementation is not required to re-resolve immediately
    /// upon receiving this call; it may instead elect to delay based on some
    /// configured minimum time between queries, to avoid hammering the name
    /// service with queries.
    fn resolve_now(&mut self);
}

/// Receives updates produced by a resolver.  The channel installs a sink
/// that schedules each update onto its combiner.
#[derive(Clone)]
pub struct UpdateSink(pub(crate) Arc<dyn Fn(ResolverUpdate) + Send + Sync>);

impl UpdateSink {
    pub fn send(&self, update: ResolverUpdate) {
        (self.0)(update)
    }
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// Where the resolver delivers its updates.
    pub update_sink: UpdateSink,
}

/// A name resolver factory that produces Resolver instances used by the
/// channel to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver instance.
    ///
    /// Note that build must not fail.  Instead, an erroring Resolver may be
    /// returned that delivers an Err value through the sink.
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &'static str;
}
