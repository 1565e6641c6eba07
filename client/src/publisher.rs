// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashSet;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pubsub_codec::{pack, validate_topic, Message, PublishBody};

use crate::connection::Connection;
use crate::error::Error;

/// Introduces itself to the broker on construction and can publish
/// messages and say goodbye on close. `EventHandler` builds on top of
/// this rather than duplicating it.
pub struct Publisher {
    connection: Arc<Connection>,
    name: String,
    safe_topics: Mutex<HashSet<String>>,
    said_goodbye: AtomicBool,
}

impl Publisher {
    /// Connect to `address`, then immediately send `introduce_myself`
    /// before returning.
    pub fn new<A: ToSocketAddrs>(name: &str, address: A) -> Result<Self, Error> {
        let connection = Connection::connect(address, name)?;
        let publisher = Self {
            connection: Arc::new(connection),
            name: name.to_string(),
            safe_topics: Mutex::new(HashSet::new()),
            said_goodbye: AtomicBool::new(false),
        };
        publisher.send_message(&Message::IntroduceMyself {
            name: publisher.name.clone(),
        })?;
        Ok(publisher)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn said_goodbye(&self) -> bool {
        self.said_goodbye.load(Ordering::SeqCst)
    }

    pub(crate) fn send_message(&self, message: &Message) -> Result<(), Error> {
        let frame = pack(message)?;
        self.connection.send(&frame)?;
        Ok(())
    }

    fn ensure_topic_valid(&self, topic: &str) -> Result<(), Error> {
        let mut safe_topics = self.safe_topics.lock().unwrap();
        if !safe_topics.contains(topic) {
            validate_topic(topic, false)?;
            safe_topics.insert(topic.to_string());
        }
        Ok(())
    }

    /// Publish `data` (an arbitrary JSON value) to `topic`.
    pub fn publish(&self, topic: &str, data: serde_json::Value) -> Result<(), Error> {
        self.ensure_topic_valid(topic)?;
        self.send_message(&Message::Publish {
            topic: topic.to_string(),
            obj: PublishBody::Value(data),
        })
    }

    /// Publish an already-serialized JSON fragment to `topic` without
    /// reparsing or re-encoding it, so intermediaries can forward
    /// payloads opaquely.
    pub fn publish_raw(&self, topic: &str, raw_json: Box<serde_json::value::RawValue>) -> Result<(), Error> {
        self.ensure_topic_valid(topic)?;
        self.send_message(&Message::Publish {
            topic: topic.to_string(),
            obj: PublishBody::Raw(raw_json),
        })
    }

    /// Idempotent. Sends `goodbye` if the connection is still open,
    /// then closes it.
    pub fn close(&self) {
        if !self.connection.is_closed() {
            match self.send_message(&Message::Goodbye {
                name: self.name.clone(),
            }) {
                Ok(()) => self.said_goodbye.store(true, Ordering::SeqCst),
                Err(err) => log::warn!("{}: failed to send goodbye: {}", self.name, err),
            }
        }
        self.connection.close();
    }
}
