// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt;

/// Errors that can occur while turning a message into its wire
/// representation.
#[derive(Clone, Debug)]
pub enum EncodeError {
    /// The body, once JSON-encoded, does not fit in the 16-bit length
    /// field of the frame header.
    BodyTooLarge(usize),

    /// `serde_json` refused to serialize the body.
    Json(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BodyTooLarge(len) => {
                write!(f, "encoded body of {} bytes exceeds the 65535 byte limit", len)
            }
            Self::Json(msg) => write!(f, "failed to encode message body: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> Self {
        EncodeError::Json(err.to_string())
    }
}

/// Errors that can occur while turning a frame back into a message.
#[derive(Clone, Debug)]
pub enum DecodeError {
    /// Fewer than 3 bytes were supplied for a header.
    HeaderTooShort(usize),

    /// The body slice handed to `unpack_body` doesn't match the length
    /// the header advertised.
    BodyLengthMismatch { expected: usize, got: usize },

    /// The type tag in the header doesn't match any known message type.
    UnknownMessageType(u8),

    /// `serde_json` couldn't parse the body, or a required field was
    /// missing from it.
    Json(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::HeaderTooShort(len) => write!(f, "header is {} bytes, expected 3", len),
            Self::BodyLengthMismatch { expected, got } => write!(
                f,
                "body length mismatch: header says {}, got {}",
                expected, got
            ),
            Self::UnknownMessageType(tag) => write!(f, "unknown message type tag {}", tag),
            Self::Json(msg) => write!(f, "failed to decode message body: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Json(err.to_string())
    }
}
