// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use pubsub_codec::{DecodeError, EncodeError, TopicError};

/// Represent the types of errors.
#[derive(Clone, Debug)]
pub enum ErrorKind {
    /// Error occurred while performing I/O on the socket.
    IoError,

    /// A topic string failed validation.
    InvalidTopic,

    /// `send` was attempted after the connection had already ended.
    CommunicationClosed,

    /// The remote end closed the connection cleanly between frames.
    ConnectionClosed,

    /// A short read left a frame half-delivered.
    PartialMessage,

    /// `unsubscribe` was given an id with no registered subscription.
    UnknownSubscription,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error.
    DecodeError,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Error {
            kind,
            message: message.to_owned(),
        }
    }

    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Error { kind, message }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_string(ErrorKind::IoError, format!("IoError {}", err))
    }
}

impl From<TopicError> for Error {
    fn from(err: TopicError) -> Self {
        Error::from_string(ErrorKind::InvalidTopic, format!("{}", err))
    }
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        Error::from_string(ErrorKind::EncodeError, format!("{}", err))
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::from_string(ErrorKind::DecodeError, format!("{}", err))
    }
}
