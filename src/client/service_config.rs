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

//! Service config parsing.
//!
//! A service config is a JSON document, typically provided by the name
//! resolver, carrying per-method parameters (timeout, wait-for-ready, retry
//! policy) and the global retry-throttling knobs.  Unknown keys are
//! ignored; duplicate keys at the same level are a parse error; a config
//! that fails to parse is discarded by the channel as if none was given.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::status::StatusCode;

/// A malformed service config.  The channel treats this as "no config".
#[derive(Debug)]
pub struct ConfigError(String);

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid service config: {}", self.0)
    }
}

impl Error for ConfigError {}

impl From<String> for ConfigError {
    fn from(msg: String) -> Self {
        ConfigError(msg)
    }
}

impl From<&str> for ConfigError {
    fn from(msg: &str) -> Self {
        ConfigError(msg.to_string())
    }
}

/// Per-method retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts beyond the original; at least 1.
    pub max_retry_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// When present, only these codes are retryable; when absent, every
    /// non-OK status is.
    pub retryable_status_codes: Option<Vec<StatusCode>>,
}

impl RetryPolicy {
    pub fn is_retryable(&self, code: StatusCode) -> bool {
        match &self.retryable_status_codes {
            Some(codes) => codes.contains(&code),
            None => code != StatusCode::Ok,
        }
    }
}

/// Parameters applied to calls of one method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodConfig {
    pub timeout: Option<Duration>,
    pub wait_for_ready: Option<bool>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Global retry throttling parameters, keyed by server name at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryThrottlingConfig {
    pub max_tokens: u32,
    pub token_ratio: f64,
}

/// A parsed service config.  Immutable after parse; the channel swaps whole
/// instances.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    // Keyed by "/service/method" for exact entries and "/service/" for
    // service-wide defaults.
    methods: HashMap<String, Arc<MethodConfig>>,
    pub retry_throttling: Option<RetryThrottlingConfig>,
    raw_json: String,
}

impl ServiceConfig {
    pub fn parse(json: &str) -> Result<ServiceConfig, ConfigError> {
        let parsed: ServiceConfigJson =
            serde_json::from_str(json).map_err(|e| ConfigError(e.to_string()))?;

        let mut methods = HashMap::new();
        for mc in &parsed.method_config {
            let config = Arc::new(mc.validate()?);
            for name in &mc.name {
                let service = name.service.as_deref().unwrap_or_default();
                if service.is_empty() {
                    return Err("methodConfig name entry is missing a service".into());
                }
                let key = match name.method.as_deref() {
                    Some(method) if !method.is_empty() => format!("/{service}/{method}"),
                    _ => format!("/{service}/"),
                };
                if methods.insert(key.clone(), config.clone()).is_some() {
                    return Err(format!("duplicate methodConfig entry for {key}").into());
                }
            }
        }

        let retry_throttling = parsed
            .retry_throttling
            .as_ref()
            .map(RetryThrottlingJson::validate)
            .transpose()?;

        Ok(ServiceConfig {
            methods,
            retry_throttling,
            raw_json: json.to_string(),
        })
    }

    /// Looks up the parameters for an RPC path of the form
    /// "/service/method".  An exact entry wins over the service-wide
    /// default.
    pub fn method_config(&self, path: &str) -> Option<Arc<MethodConfig>> {
        if let Some(config) = self.methods.get(path) {
            return Some(config.clone());
        }
        let service_end = path.rfind('/')?;
        let wildcard = format!("{}/", &path[..service_end]);
        self.methods.get(&wildcard).cloned()
    }

    pub fn raw_json(&self) -> &str {
        &self.raw_json
    }
}

// ===== JSON shapes =====
//
// serde's derived deserializers reject duplicate fields and skip unknown
// ones, which is the contract for service config documents.

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServiceConfigJson {
    #[serde(default)]
    method_config: Vec<MethodConfigJson>,
    retry_throttling: Option<RetryThrottlingJson>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MethodConfigJson {
    #[serde(default)]
    name: Vec<MethodNameJson>,
    wait_for_ready: Option<bool>,
    timeout: Option<String>,
    retry_policy: Option<RetryPolicyJson>,
}

impl MethodConfigJson {
    fn validate(&self) -> Result<MethodConfig, ConfigError> {
        Ok(MethodConfig {
            timeout: self.timeout.as_deref().map(parse_duration).transpose()?,
            wait_for_ready: self.wait_for_ready,
            retry_policy: self
                .retry_policy
                .as_ref()
                .map(RetryPolicyJson::validate)
                .transpose()?,
        })
    }
}

#[derive(Deserialize, Debug)]
struct MethodNameJson {
    service: Option<String>,
    method: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RetryPolicyJson {
    max_retry_attempts: i64,
    initial_backoff_ms: i64,
    max_backoff_ms: i64,
    backoff_multiplier: f64,
    retryable_status_codes: Option<Vec<String>>,
}

impl RetryPolicyJson {
    fn validate(&self) -> Result<RetryPolicy, ConfigError> {
        if self.max_retry_attempts <= 0 {
            return Err("maxRetryAttempts must be greater than 0".into());
        }
        if self.initial_backoff_ms <= 0 {
            return Err("initialBackoffMs must be greater than 0".into());
        }
        if self.max_backoff_ms <= 0 {
            return Err("maxBackoffMs must be greater than 0".into());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initialBackoffMs must not exceed maxBackoffMs".into());
        }
        if self.backoff_multiplier <= 1.0 {
            return Err("backoffMultiplier must be greater than 1".into());
        }
        let retryable_status_codes = self
            .retryable_status_codes
            .as_ref()
            .map(|names| {
                names
                    .iter()
                    .map(|name| {
                        StatusCode::from_name(name)
                            .ok_or_else(|| ConfigError(format!("unknown status code {name:?}")))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        Ok(RetryPolicy {
            max_retry_attempts: self.max_retry_attempts as u32,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms as u64),
            max_backoff: Duration::from_millis(self.max_backoff_ms as u64),
            backoff_multiplier: self.backoff_multiplier,
            retryable_status_codes,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RetryThrottlingJson {
    max_tokens: i64,
    token_ratio: serde_json::Number,
}

impl RetryThrottlingJson {
    fn validate(&self) -> Result<RetryThrottlingConfig, ConfigError> {
        if self.max_tokens <= 0 {
            return Err("retryThrottling.maxTokens must be greater than 0".into());
        }
        let repr = self.token_ratio.to_string();
        if let Some((_, fraction)) = repr.split_once('.') {
            if fraction.len() > 3 {
                return Err("retryThrottling.tokenRatio allows at most 3 decimal digits".into());
            }
        }
        let ratio = self
            .token_ratio
            .as_f64()
            .ok_or_else(|| ConfigError("retryThrottling.tokenRatio is not a number".to_string()))?;
        if ratio <= 0.0 {
            return Err("retryThrottling.tokenRatio must be greater than 0".into());
        }
        Ok(RetryThrottlingConfig {
            max_tokens: self.max_tokens as u32,
            token_ratio: ratio,
        })
    }
}

/// Parses a proto-style duration string: decimal seconds with an `s`
/// suffix.  Fractions carry exactly 3, 6, or 9 digits.
fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let body = s
        .strip_suffix('s')
        .ok_or_else(|| ConfigError(format!("duration {s:?} must end in 's'")))?;
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (body, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("duration {s:?} has an invalid integer part").into());
    }
    let secs: u64 = int_part
        .parse()
        .map_err(|_| ConfigError(format!("duration {s:?} is out of range")))?;
    let nanos: u32 = match frac_part {
        None => 0,
        Some(f) => {
            if !matches!(f.len(), 3 | 6 | 9) || !f.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!(
                    "duration {s:?} must carry 3, 6, or 9 fractional digits"
                )
                .into());
            }
            let digits: u32 = f
                .parse()
                .map_err(|_| ConfigError(format!("duration {s:?} has an invalid fraction")))?;
            digits * 10u32.pow(9 - f.len() as u32)
        }
    };
    Ok(Duration::new(secs, nanos))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_full_config() {
        let config = ServiceConfig::parse(
            r#"{
                "methodConfig": [{
                    "name": [{"service": "pkg.Svc", "method": "Method"}],
                    "waitForReady": true,
                    "timeout": "1.500s",
                    "retryPolicy": {
                        "maxRetryAttempts": 3,
                        "initialBackoffMs": 100,
                        "maxBackoffMs": 1000,
                        "backoffMultiplier": 2.0,
                        "retryableStatusCodes": ["UNAVAILABLE", "ABORTED"]
                    }
                }],
                "retryThrottling": {"maxTokens": 10, "tokenRatio": 0.1}
            }"#,
        )
        .unwrap();

        let mc = config.method_config("/pkg.Svc/Method").unwrap();
        assert_eq!(mc.wait_for_ready, Some(true));
        assert_eq!(mc.timeout, Some(Duration::from_millis(1500)));
        let rp = mc.retry_policy.as_ref().unwrap();
        assert_eq!(rp.max_retry_attempts, 3);
        assert_eq!(rp.initial_backoff, Duration::from_millis(100));
        assert_eq!(rp.max_backoff, Duration::from_millis(1000));
        assert!(rp.is_retryable(StatusCode::Unavailable));
        assert!(rp.is_retryable(StatusCode::Aborted));
        assert!(!rp.is_retryable(StatusCode::InvalidArgument));

        let throttling = config.retry_throttling.unwrap();
        assert_eq!(throttling.max_tokens, 10);
        assert_eq!(throttling.token_ratio, 0.1);
    }

    #[test]
    fn absent_retryable_codes_means_all_non_ok() {
        let rp = RetryPolicy {
            max_retry_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 1.5,
            retryable_status_codes: None,
        };
        assert!(rp.is_retryable(StatusCode::Unavailable));
        assert!(rp.is_retryable(StatusCode::Internal));
        assert!(!rp.is_retryable(StatusCode::Ok));
    }

    #[test]
    fn service_wildcard_lookup() {
        let config = ServiceConfig::parse(
            r#"{
                "methodConfig": [
                    {"name": [{"service": "pkg.Svc"}], "timeout": "10s"},
                    {"name": [{"service": "pkg.Svc", "method": "Fast"}], "timeout": "1s"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.method_config("/pkg.Svc/Fast").unwrap().timeout,
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            config.method_config("/pkg.Svc/Other").unwrap().timeout,
            Some(Duration::from_secs(10))
        );
        assert!(config.method_config("/other.Svc/Method").is_none());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = ServiceConfig::parse(
            r#"{"unknownTopLevel": 42, "methodConfig": [{"name": [{"service": "s"}], "mystery": {}}]}"#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn duplicate_keys_are_an_error() {
        let result = ServiceConfig::parse(
            r#"{"retryThrottling": {"maxTokens": 1, "tokenRatio": 0.5}, "retryThrottling": {"maxTokens": 2, "tokenRatio": 0.5}}"#,
        );
        assert!(result.is_err());

        let result = ServiceConfig::parse(
            r#"{"methodConfig": [{"name": [{"service": "s"}], "timeout": "1s", "timeout": "2s"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn retry_policy_validation() {
        let base = r#"{"methodConfig": [{"name": [{"service": "s"}], "retryPolicy": {
            "maxRetryAttempts": MAX, "initialBackoffMs": INIT, "maxBackoffMs": CAP,
            "backoffMultiplier": MULT}}]}"#;
        let build = |max: &str, init: &str, cap: &str, mult: &str| {
            ServiceConfig::parse(
                &base
                    .replace("MAX", max)
                    .replace("INIT", init)
                    .replace("CAP", cap)
                    .replace("MULT", mult),
            )
        };
        assert!(build("3", "100", "1000", "2.0").is_ok());
        assert!(build("0", "100", "1000", "2.0").is_err());
        assert!(build("3", "0", "1000", "2.0").is_err());
        assert!(build("3", "100", "0", "2.0").is_err());
        assert!(build("3", "2000", "1000", "2.0").is_err());
        assert!(build("3", "100", "1000", "1.0").is_err());
    }

    #[test]
    fn unknown_status_code_is_an_error() {
        let result = ServiceConfig::parse(
            r#"{"methodConfig": [{"name": [{"service": "s"}], "retryPolicy": {
                "maxRetryAttempts": 2, "initialBackoffMs": 1, "maxBackoffMs": 2,
                "backoffMultiplier": 1.5, "retryableStatusCodes": ["NOT_A_CODE"]}}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn token_ratio_digit_limit() {
        let ok = ServiceConfig::parse(r#"{"retryThrottling": {"maxTokens": 1, "tokenRatio": 0.125}}"#);
        assert!(ok.is_ok());
        let too_precise =
            ServiceConfig::parse(r#"{"retryThrottling": {"maxTokens": 1, "tokenRatio": 0.1255}}"#);
        assert!(too_precise.is_err());
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(
            parse_duration("1.500s").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            parse_duration("0.000001s").unwrap(),
            Duration::from_micros(1)
        );
        assert_eq!(
            parse_duration("2.000000001s").unwrap(),
            Duration::new(2, 1)
        );
        // Fractions must carry 3, 6, or 9 digits.
        assert!(parse_duration("1.5s").is_err());
        assert!(parse_duration("1.05s").is_err());
        assert!(parse_duration("1.0000s").is_err());
        assert!(parse_duration("1").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-1s").is_err());
    }
}
