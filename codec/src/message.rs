// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{DecodeError, EncodeError};

/// Number of bytes in a frame header: one type tag byte, two
/// big-endian body-length bytes.
pub const HEADER_LEN: usize = 3;

/// Upper bound on the JSON body of a single frame, imposed by the
/// 16-bit length field in the header.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// The five message types that travel over the wire. `introduce_myself`,
/// `goodbye`, `subscribe` and `unsubscribe` only ever travel
/// endpoint -> broker; `publish` travels in both directions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    IntroduceMyself = 1,
    Goodbye = 2,
    Subscribe = 3,
    Unsubscribe = 4,
    Publish = 5,
}

impl MessageType {
    fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            1 => Ok(Self::IntroduceMyself),
            2 => Ok(Self::Goodbye),
            3 => Ok(Self::Subscribe),
            4 => Ok(Self::Unsubscribe),
            5 => Ok(Self::Publish),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

/// The payload of a `publish` message's `obj` field.
///
/// `Raw` carries a byte sequence that is already valid JSON and must
/// be forwarded verbatim, without being reparsed or re-serialized.
/// `Value` carries a structured value that the codec will JSON-encode
/// itself. This distinction exists so intermediaries can relay
/// payloads opaquely.
#[derive(Clone, Debug)]
pub enum PublishBody {
    Raw(Box<RawValue>),
    Value(serde_json::Value),
}

impl PartialEq for PublishBody {
    fn eq(&self, other: &Self) -> bool {
        // Compare by parsed value so a `Raw` and a `Value` carrying the
        // same JSON are considered equal, matching the codec round-trip
        // guarantee regardless of which direction produced the frame.
        self.as_value() == other.as_value()
    }
}

impl PublishBody {
    fn as_value(&self) -> serde_json::Value {
        match self {
            Self::Raw(raw) => serde_json::from_str(raw.get()).unwrap_or(serde_json::Value::Null),
            Self::Value(value) => value.clone(),
        }
    }
}

/// A single decoded or to-be-encoded message, one variant per
/// `MessageType`.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    IntroduceMyself { name: String },
    Goodbye { name: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, obj: PublishBody },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::IntroduceMyself { .. } => MessageType::IntroduceMyself,
            Self::Goodbye { .. } => MessageType::Goodbye,
            Self::Subscribe { .. } => MessageType::Subscribe,
            Self::Unsubscribe { .. } => MessageType::Unsubscribe,
            Self::Publish { .. } => MessageType::Publish,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct NameBody<'a> {
    name: &'a str,
}

#[derive(Serialize, Deserialize)]
struct TopicBody<'a> {
    topic: &'a str,
}

#[derive(Serialize)]
struct PublishBodyOut<'a, T: Serialize> {
    topic: &'a str,
    obj: T,
}

#[derive(Deserialize)]
struct PublishBodyIn<'a> {
    topic: String,
    #[serde(borrow)]
    obj: &'a RawValue,
}

fn encode_body(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let body = match message {
        Message::IntroduceMyself { name } | Message::Goodbye { name } => {
            serde_json::to_vec(&NameBody { name })?
        }
        Message::Subscribe { topic } | Message::Unsubscribe { topic } => {
            serde_json::to_vec(&TopicBody { topic })?
        }
        Message::Publish {
            topic,
            obj: PublishBody::Raw(raw),
        } => serde_json::to_vec(&PublishBodyOut { topic, obj: raw })?,
        Message::Publish {
            topic,
            obj: PublishBody::Value(value),
        } => serde_json::to_vec(&PublishBodyOut { topic, obj: value })?,
    };
    Ok(body)
}

/// Assemble a full frame (header + body) for `message`.
pub fn pack(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let body = encode_body(message)?;
    if body.len() > MAX_BODY_LEN {
        return Err(EncodeError::BodyTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(message.message_type() as u8);
    let mut len_bytes = [0u8; 2];
    BigEndian::write_u16(&mut len_bytes, body.len() as u16);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a 3-byte frame header into its message type and the number
/// of body bytes that follow.
pub fn unpack_header(header: &[u8]) -> Result<(MessageType, usize), DecodeError> {
    if header.len() != HEADER_LEN {
        return Err(DecodeError::HeaderTooShort(header.len()));
    }
    let message_type = MessageType::from_tag(header[0])?;
    let body_len = BigEndian::read_u16(&header[1..3]) as usize;
    Ok((message_type, body_len))
}

/// Decode a message body given the type its header announced.
///
/// When `message_type` is `Publish` and `raw_obj` is true, the `obj`
/// field is kept as an unparsed raw JSON fragment rather than being
/// turned into a `serde_json::Value`; this mirrors `pack`'s ability to
/// forward an already-serialized payload without touching it.
pub fn unpack_body(
    message_type: MessageType,
    body: &[u8],
    raw_obj: bool,
) -> Result<Message, DecodeError> {
    match message_type {
        MessageType::IntroduceMyself => {
            let NameBody { name } = serde_json::from_slice(body)?;
            Ok(Message::IntroduceMyself {
                name: name.to_string(),
            })
        }
        MessageType::Goodbye => {
            let NameBody { name } = serde_json::from_slice(body)?;
            Ok(Message::Goodbye {
                name: name.to_string(),
            })
        }
        MessageType::Subscribe => {
            let TopicBody { topic } = serde_json::from_slice(body)?;
            Ok(Message::Subscribe {
                topic: topic.to_string(),
            })
        }
        MessageType::Unsubscribe => {
            let TopicBody { topic } = serde_json::from_slice(body)?;
            Ok(Message::Unsubscribe {
                topic: topic.to_string(),
            })
        }
        MessageType::Publish => {
            let decoded: PublishBodyIn = serde_json::from_slice(body)?;
            let obj = if raw_obj {
                PublishBody::Raw(RawValue::from_string(decoded.obj.get().to_string())
                    .map_err(|err| DecodeError::Json(err.to_string()))?)
            } else {
                PublishBody::Value(serde_json::from_str(decoded.obj.get())?)
            };
            Ok(Message::Publish {
                topic: decoded.topic,
                obj,
            })
        }
    }
}
