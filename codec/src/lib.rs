// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Wire framing and topic utilities shared by publishers and
//! subscribers of the notifier protocol: a fixed 3-byte frame header
//! (message type + body length) followed by a JSON body, and the
//! dot-separated topic grammar used to address messages.

pub mod error;
pub mod message;
pub mod topic;

pub use error::{DecodeError, EncodeError};
pub use message::{pack, unpack_body, unpack_header, Message, MessageType, PublishBody, HEADER_LEN, MAX_BODY_LEN};
pub use topic::{validate as validate_topic, chain as topic_chain, TopicError};
