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

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::metadata::Metadata;

const GRPC_STATUS_KEY: &str = "grpc-status";
const GRPC_MESSAGE_KEY: &str = "grpc-message";

/// Represents a gRPC status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl From<i32> for StatusCode {
    fn from(i: i32) -> Self {
        match i {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }
}

impl StatusCode {
    /// The canonical upper-snake-case name of the code, as it appears in
    /// service configs and on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Parses a canonical code name.  Used for the `retryableStatusCodes`
    /// entries of a service config.
    pub fn from_name(name: &str) -> Option<StatusCode> {
        Some(match name {
            "OK" => StatusCode::Ok,
            "CANCELLED" => StatusCode::Cancelled,
            "UNKNOWN" => StatusCode::Unknown,
            "INVALID_ARGUMENT" => StatusCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => StatusCode::DeadlineExceeded,
            "NOT_FOUND" => StatusCode::NotFound,
            "ALREADY_EXISTS" => StatusCode::AlreadyExists,
            "PERMISSION_DENIED" => StatusCode::PermissionDenied,
            "RESOURCE_EXHAUSTED" => StatusCode::ResourceExhausted,
            "FAILED_PRECONDITION" => StatusCode::FailedPrecondition,
            "ABORTED" => StatusCode::Aborted,
            "OUT_OF_RANGE" => StatusCode::OutOfRange,
            "UNIMPLEMENTED" => StatusCode::Unimplemented,
            "INTERNAL" => StatusCode::Internal,
            "UNAVAILABLE" => StatusCode::Unavailable,
            "DATA_LOSS" => StatusCode::DataLoss,
            "UNAUTHENTICATED" => StatusCode::Unauthenticated,
            _ => return None,
        })
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Represents a gRPC status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Create a new `Status` with the given code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Status::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Status::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Internal, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unimplemented, message)
    }

    /// Get the `StatusCode` of this `Status`.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Get the message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Extracts the RPC status carried by a trailing metadata batch via the
    /// `grpc-status` and `grpc-message` keys.  A missing or unparsable
    /// `grpc-status` maps to `Unknown`, matching what a transport reports
    /// for a stream that ended without a proper status.
    pub fn from_trailing_metadata(md: &Metadata) -> Status {
        let code = match md.get(GRPC_STATUS_KEY) {
            Some(v) => match v.parse::<i32>() {
                Ok(i) => StatusCode::from(i),
                Err(_) => StatusCode::Unknown,
            },
            None => StatusCode::Unknown,
        };
        let message = md.get(GRPC_MESSAGE_KEY).unwrap_or_default().to_string();
        Status { code, message }
    }

    /// Writes this status into a metadata batch as `grpc-status` and
    /// `grpc-message` entries, replacing any existing ones.
    pub fn to_trailing_metadata(&self, md: &mut Metadata) {
        md.replace(GRPC_STATUS_KEY, (self.code as i32).to_string());
        if self.message.is_empty() {
            md.remove(GRPC_MESSAGE_KEY);
        } else {
            md.replace(GRPC_MESSAGE_KEY, self.message.clone());
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Error for Status {}
