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

//! Adaptive retry throttling, shared by every call a channel makes to the
//! same server name.
//!
//! A token bucket scaled by 1000 to allow fractional ratios: a success adds
//! `token_ratio` tokens up to `max_tokens`, a failure subtracts a whole
//! token, and retries are forbidden while the bucket is at or below half
//! capacity.  Counters are atomics; calls mutate them from their own
//! combiners and observe them eventually-consistently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Throttle state for one server name.
pub(crate) struct RetryThrottle {
    max_milli_tokens: i64,
    milli_token_ratio: i64,
    milli_tokens: AtomicI64,
}

impl RetryThrottle {
    pub(crate) fn new(max_tokens: u32, token_ratio: f64) -> Self {
        let max_milli_tokens = max_tokens as i64 * 1000;
        // Ratios carry at most 3 decimal digits, so the scaling is exact.
        let milli_token_ratio = (token_ratio * 1000.0).round() as i64;
        RetryThrottle {
            max_milli_tokens,
            milli_token_ratio,
            milli_tokens: AtomicI64::new(max_milli_tokens),
        }
    }

    pub(crate) fn max_tokens(&self) -> u32 {
        (self.max_milli_tokens / 1000) as u32
    }

    pub(crate) fn token_ratio(&self) -> f64 {
        self.milli_token_ratio as f64 / 1000.0
    }

    pub(crate) fn milli_tokens(&self) -> i64 {
        self.milli_tokens.load(Ordering::Relaxed)
    }

    /// Records a success: adds token_ratio tokens, saturating at max.
    pub(crate) fn record_success(&self) {
        let _ = self
            .milli_tokens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tokens| {
                Some((tokens + self.milli_token_ratio).min(self.max_milli_tokens))
            });
    }

    /// Records a failure: subtracts one token, saturating at zero.  Returns
    /// whether a retry is still permitted afterwards.
    pub(crate) fn record_failure(&self) -> bool {
        let _ = self
            .milli_tokens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tokens| {
                Some((tokens - 1000).max(0))
            });
        self.retries_permitted()
    }

    /// Retries are forbidden while the token count is at or below half of
    /// the maximum.
    pub(crate) fn retries_permitted(&self) -> bool {
        self.milli_tokens.load(Ordering::Relaxed) > self.max_milli_tokens / 2
    }
}

/// Throttle instances keyed by server name.  Each channel owns one map, so
/// all of its calls to the same server name share one bucket.
#[derive(Default)]
pub(crate) struct ServerRetryThrottleMap {
    map: Mutex<HashMap<String, Arc<RetryThrottle>>>,
}

impl ServerRetryThrottleMap {
    /// Returns the throttle for `server_name`, creating or replacing it if
    /// the configured parameters changed.
    pub(crate) fn get_or_create(
        &self,
        server_name: &str,
        max_tokens: u32,
        token_ratio: f64,
    ) -> Arc<RetryThrottle> {
        let mut map = self.map.lock().unwrap();
        if let Some(existing) = map.get(server_name) {
            if existing.max_tokens() == max_tokens && existing.token_ratio() == token_ratio {
                return existing.clone();
            }
        }
        let throttle = Arc::new(RetryThrottle::new(max_tokens, token_ratio));
        map.insert(server_name.to_string(), throttle.clone());
        throttle
    }
}
