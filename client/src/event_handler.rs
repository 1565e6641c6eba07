// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashSet;
use std::net::ToSocketAddrs;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pubsub_codec::{topic_chain, validate_topic, Message, MessageType, PublishBody};

use crate::error::{Error, ErrorKind};
use crate::publisher::Publisher;
use crate::registry::{Callback, Registry};

/// A publish/subscribe event endpoint: a [`Publisher`] plus a
/// subscription registry and the background thread that keeps it fed.
///
/// Built with composition rather than inheritance: shared
/// introduce/goodbye/publish behavior lives on `Publisher`; the
/// registry and the receiver thread are owned here. Always held behind
/// an `Arc` because the receiver thread and one-shot subscription
/// wrappers need to call back into it.
pub struct EventHandler {
    publisher: Publisher,
    registry: Mutex<Registry>,
    receiver_thread: Mutex<Option<JoinHandle<()>>>,
    safe_subscribe_topics: Mutex<HashSet<String>>,
}

impl EventHandler {
    /// Connect to `address`, introduce `name`, and start the
    /// background receiver before returning.
    pub fn new<A: ToSocketAddrs>(name: &str, address: A) -> Result<Arc<Self>, Error> {
        let publisher = Publisher::new(name, address)?;
        let handler = Arc::new(Self {
            publisher,
            registry: Mutex::new(Registry::new()),
            receiver_thread: Mutex::new(None),
            safe_subscribe_topics: Mutex::new(HashSet::new()),
        });

        let worker_handler = Arc::clone(&handler);
        let thread_name = format!("{}-receiver", handler.publisher.name());
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_handler.run_receiver())
            .map_err(Error::from)?;
        *handler.receiver_thread.lock().unwrap() = Some(worker);

        Ok(handler)
    }

    pub fn name(&self) -> &str {
        self.publisher.name()
    }

    /// Publish `data` to `topic`, same as [`Publisher::publish`].
    pub fn publish(&self, topic: &str, data: serde_json::Value) -> Result<(), Error> {
        self.publisher.publish(topic, data)
    }

    fn send_message(&self, message: &Message) -> Result<(), Error> {
        self.publisher.send_message(message)
    }

    /// Subscribe `callback` to `topic`. When `send_and_wait_echo` is
    /// true (the default a caller should pass unless chaining from
    /// inside another subscribe), this blocks until the broker has
    /// confirmed the subscription via the echo handshake, so any
    /// `publish` the caller issues immediately after is guaranteed to
    /// be seen by the broker after this subscription took effect.
    pub fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        callback: impl Fn(serde_json::Value) + Send + Sync + 'static,
        return_id: bool,
        send_and_wait_echo: bool,
    ) -> Result<Option<u64>, Error> {
        self.subscribe_inner(topic, Arc::new(callback), return_id, send_and_wait_echo)
    }

    /// Validate `topic` with `allow_empty=true`, caching non-empty
    /// topics so repeat subscriptions to the same topic skip
    /// re-validation, mirroring `Publisher`'s own cache for `publish`.
    fn ensure_subscribe_topic_valid(&self, topic: &str) -> Result<(), Error> {
        if topic.is_empty() {
            return validate_topic(topic, true).map_err(Error::from);
        }
        let mut safe_topics = self.safe_subscribe_topics.lock().unwrap();
        if !safe_topics.contains(topic) {
            validate_topic(topic, true)?;
            safe_topics.insert(topic.to_string());
        }
        Ok(())
    }

    fn subscribe_inner(
        self: &Arc<Self>,
        topic: &str,
        callback: Callback,
        return_id: bool,
        send_and_wait_echo: bool,
    ) -> Result<Option<u64>, Error> {
        self.ensure_subscribe_topic_valid(topic)?;

        let issued_id = {
            let mut registry = self.registry.lock().unwrap();
            if !registry.topic_exists(topic) {
                self.send_message(&Message::Subscribe {
                    topic: topic.to_string(),
                })?;
            }
            registry.insert(topic, callback)
        };

        if send_and_wait_echo {
            self.send_and_wait_echo()?;
        }

        Ok(if return_id { Some(issued_id) } else { None })
    }

    /// Round-trip an `echo-<cookie>` message through the broker and
    /// block until it comes back, guaranteeing every frame sent before
    /// this call has been processed by the broker.
    fn send_and_wait_echo(self: &Arc<Self>) -> Result<(), Error> {
        let cookie: u32 = rand::random::<u32>() & ((1u32 << 30) - 1);
        let cookie_topic = format!("echo-{}", cookie);

        let (tx, rx) = mpsc::sync_channel::<()>(1);
        self.subscribe_for_once_call_inner(
            &cookie_topic,
            Arc::new(move |_data| {
                let _ = tx.send(());
            }),
            false,
            false,
        )?;

        self.publish(&cookie_topic, serde_json::Value::String(String::new()))?;

        rx.recv().map_err(|_| {
            Error::new(
                ErrorKind::ConnectionClosed,
                "connection closed while waiting for the subscribe echo",
            )
        })
    }

    /// Remove the subscription with `id`. Sends `unsubscribe` on the
    /// wire if this was the last local subscriber to its topic.
    pub fn unsubscribe(&self, id: u64) -> Result<(), Error> {
        let mut registry = self.registry.lock().unwrap();
        let removed = registry.remove(id)?;
        if removed.topic_now_empty {
            self.send_message(&Message::Unsubscribe {
                topic: removed.topic,
            })?;
        }
        Ok(())
    }

    /// Subscribe `callback` so that it fires once and then
    /// unsubscribes itself.
    pub fn subscribe_for_once_call(
        self: &Arc<Self>,
        topic: &str,
        callback: impl Fn(serde_json::Value) + Send + Sync + 'static,
        return_id: bool,
        send_and_wait_echo: bool,
    ) -> Result<Option<u64>, Error> {
        self.subscribe_for_once_call_inner(topic, Arc::new(callback), return_id, send_and_wait_echo)
    }

    fn subscribe_for_once_call_inner(
        self: &Arc<Self>,
        topic: &str,
        callback: Callback,
        return_id: bool,
        send_and_wait_echo: bool,
    ) -> Result<Option<u64>, Error> {
        // The wrapper may be invoked by the receiver thread before
        // `subscribe_inner` below has returned the id it needs to
        // unsubscribe itself, since the broker can echo the publish
        // back immediately. This gate makes the wrapper wait for the
        // id to be recorded before it acts on it.
        let gate: Arc<(Mutex<Option<u64>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let wrapper_gate = Arc::clone(&gate);
        let handler = Arc::clone(self);
        let topic_owned = topic.to_string();

        let wrapper: Callback = Arc::new(move |data: serde_json::Value| {
            callback(data);

            let (lock, cvar) = &*wrapper_gate;
            let mut guard = lock.lock().unwrap();
            while guard.is_none() {
                guard = cvar.wait(guard).unwrap();
            }
            let id = guard.expect("gate only ever holds Some once notified");

            if let Err(err) = handler.unsubscribe(id) {
                log::error!(
                    "{}: failed to auto-unsubscribe one-shot subscription on '{}': {}",
                    handler.publisher.name(),
                    topic_owned,
                    err
                );
            }
        });

        let issued_id = self.subscribe_inner(topic, wrapper, true, send_and_wait_echo)?;
        let id = issued_id.expect("subscribe_inner always returns an id when return_id is true");

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = Some(id);
            cvar.notify_all();
        }

        Ok(if return_id { Some(id) } else { None })
    }

    /// Block until a message is published to `topic`, then return its
    /// payload.
    pub fn wait(self: &Arc<Self>, topic: &str) -> Result<serde_json::Value, Error> {
        let (tx, rx) = mpsc::sync_channel::<serde_json::Value>(1);
        self.subscribe_for_once_call(
            topic,
            move |data| {
                let _ = tx.send(data);
            },
            false,
            true,
        )?;
        rx.recv().map_err(|_| {
            Error::new(
                ErrorKind::ConnectionClosed,
                "connection closed while waiting for an event",
            )
        })
    }

    fn dispatch(&self, topic: &str, obj: serde_json::Value) {
        let chain = topic_chain(topic);
        let snapshot = {
            let registry = self.registry.lock().unwrap();
            registry.snapshot_for_chain(&chain)
        };

        for (matched_topic, callbacks) in snapshot {
            for (_, callback) in callbacks {
                let obj = obj.clone();
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(obj)));
                if outcome.is_err() {
                    let label = if matched_topic.is_empty() {
                        "(the empty topic)"
                    } else {
                        matched_topic.as_str()
                    };
                    log::error!(
                        "{}: a callback for topic '{}' panicked",
                        self.publisher.name(),
                        label
                    );
                }
            }
        }
    }

    fn run_receiver(self: Arc<Self>) {
        loop {
            match self.publisher.connection().receive() {
                Ok((MessageType::Publish, body)) => {
                    match pubsub_codec::unpack_body(MessageType::Publish, &body, false) {
                        Ok(Message::Publish { topic, obj }) => {
                            let value = match obj {
                                PublishBody::Value(value) => value,
                                PublishBody::Raw(raw) => serde_json::from_str(raw.get())
                                    .unwrap_or(serde_json::Value::Null),
                            };
                            self.dispatch(&topic, value);
                        }
                        Ok(_) => unreachable!("unpack_body(Publish, ..) always yields a Publish"),
                        Err(err) => {
                            log::error!(
                                "{}: failed to decode a publish body: {}",
                                self.publisher.name(),
                                err
                            );
                        }
                    }
                }
                Ok((message_type, _)) => {
                    log::error!(
                        "{}: unexpected message of type {:?} (expecting publish), dropping",
                        self.publisher.name(),
                        message_type
                    );
                }
                Err(err) => match err.kind() {
                    ErrorKind::ConnectionClosed if self.publisher.said_goodbye() => {
                        log::info!(
                            "{}: the connection was closed, it's ok, we said goodbye",
                            self.publisher.name()
                        );
                        break;
                    }
                    ErrorKind::DecodeError | ErrorKind::EncodeError => {
                        log::error!(
                            "{}: malformed frame header, dropping: {}",
                            self.publisher.name(),
                            err
                        );
                    }
                    _ => {
                        log::error!(
                            "{}: exception while receiving a message: {}",
                            self.publisher.name(),
                            err
                        );
                        break;
                    }
                },
            }
        }
        self.publisher.connection().close();
    }

    /// Say goodbye, close the connection, then join the receiver
    /// thread. `join_timeout` is honored best-effort: `JoinHandle` has
    /// no timed join, so this polls for completion and detaches if the
    /// deadline passes (the thread still runs to completion on its
    /// own, since the socket is already shut down by this point).
    pub fn close(&self, join_timeout: Option<Duration>) {
        self.publisher.close();

        let handle = self.receiver_thread.lock().unwrap().take();
        let Some(handle) = handle else { return };

        match join_timeout {
            None => {
                let _ = handle.join();
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(20));
                }
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    log::warn!(
                        "{}: receiver thread did not exit within {:?}, detaching",
                        self.publisher.name(),
                        timeout
                    );
                }
            }
        }
    }
}
