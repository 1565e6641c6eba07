// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use pubsub_codec::{unpack_header, MessageType, HEADER_LEN};

use crate::error::{Error, ErrorKind};

/// How many times `Connection::connect` retries before giving up.
pub const CONNECT_RETRY_ATTEMPTS: u32 = 100;

/// Delay between connect attempts (~50s total across all attempts).
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Owns exactly one TCP stream socket and the framing state machine
/// layered on top of it: whole-frame `send`/`receive`, and the
/// end-of-communication latch that governs both.
pub struct Connection {
    write_stream: Mutex<TcpStream>,
    read_stream: TcpStream,
    closed: AtomicBool,
    end_of_communication: AtomicBool,
    whoami: String,
}

impl Connection {
    /// Connect to `addr`, retrying every [`CONNECT_RETRY_DELAY`] up to
    /// [`CONNECT_RETRY_ATTEMPTS`] times before propagating the last
    /// error.
    pub fn connect<A: ToSocketAddrs>(addr: A, whoami: &str) -> Result<Self, Error> {
        let mut last_err = None;
        for attempt in 0..CONNECT_RETRY_ATTEMPTS {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    log::debug!("{}: established a connection with the notifier server", whoami);
                    return Self::from_socket(stream, whoami);
                }
                Err(err) => {
                    log::debug!(
                        "{}: connect attempt {} failed: {}",
                        whoami,
                        attempt + 1,
                        err
                    );
                    last_err = Some(err);
                    if attempt + 1 < CONNECT_RETRY_ATTEMPTS {
                        thread::sleep(CONNECT_RETRY_DELAY);
                    }
                }
            }
        }
        let err = last_err.expect("loop runs at least once");
        log::error!("{}: error when creating a connection: {}", whoami, err);
        Err(Error::from(err))
    }

    /// Wrap an already-open socket (the server-accepted case).
    pub fn from_socket(stream: TcpStream, whoami: &str) -> Result<Self, Error> {
        let read_stream = stream.try_clone()?;
        Ok(Self {
            write_stream: Mutex::new(stream),
            read_stream,
            closed: AtomicBool::new(false),
            end_of_communication: AtomicBool::new(false),
            whoami: whoami.to_string(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write the whole `frame` in one call. Fails with
    /// `CommunicationClosed` once the connection has ended.
    pub fn send(&self, frame: &[u8]) -> Result<(), Error> {
        if self.end_of_communication.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::CommunicationClosed,
                "the communication is already closed",
            ));
        }
        let mut stream = self.write_stream.lock().unwrap();
        stream.write_all(frame)?;
        Ok(())
    }

    /// Read exactly one frame: a 3-byte header followed by its body.
    pub fn receive(&self) -> Result<(MessageType, Vec<u8>), Error> {
        if self.end_of_communication.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::CommunicationClosed,
                "the communication is already closed",
            ));
        }

        let header = self.recv_all(HEADER_LEN)?;
        if header.len() < HEADER_LEN {
            self.end_of_communication.store(true, Ordering::SeqCst);
            return if header.is_empty() {
                Err(Error::new(
                    ErrorKind::ConnectionClosed,
                    "the connection was closed between messages",
                ))
            } else {
                Err(Error::new(
                    ErrorKind::PartialMessage,
                    &format!(
                        "received {} of {} header bytes before the connection closed",
                        header.len(),
                        HEADER_LEN
                    ),
                ))
            };
        }

        let (message_type, body_len) = unpack_header(&header)?;

        let body = self.recv_all(body_len)?;
        if body.len() < body_len {
            self.end_of_communication.store(true, Ordering::SeqCst);
            return Err(Error::new(
                ErrorKind::PartialMessage,
                &format!(
                    "received {} of {} body bytes before the connection closed",
                    body.len(),
                    body_len
                ),
            ));
        }

        Ok((message_type, body))
    }

    fn recv_all(&self, to_receive: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; to_receive];
        let mut received = 0;
        while received < to_receive {
            let n = (&self.read_stream).read(&mut buf[received..])?;
            if n == 0 {
                break;
            }
            received += n;
        }
        buf.truncate(received);
        Ok(buf)
    }

    /// Idempotent. Shuts the socket down in both directions and marks
    /// the connection ended; errors from the shutdown syscall are
    /// logged, not propagated, matching a socket teardown that must
    /// always succeed from the caller's point of view.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.end_of_communication.store(true, Ordering::SeqCst);

        let stream = self.write_stream.lock().unwrap();
        if let Err(err) = stream.shutdown(Shutdown::Both) {
            log::error!("{}: error shutting down the connection: {}", self.whoami, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn send_after_close_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || listener.accept().unwrap());
        let conn = Connection::connect(addr, "test").unwrap();
        let _ = server.join().unwrap();

        conn.close();
        let err = conn.send(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CommunicationClosed));
    }

    #[test]
    fn close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || listener.accept().unwrap());
        let conn = Connection::connect(addr, "test").unwrap();
        let _ = server.join().unwrap();

        conn.close();
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn clean_close_between_frames_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let conn = Connection::connect(addr, "test").unwrap();
        server.join().unwrap();

        let err = conn.receive().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionClosed));
    }

    #[test]
    fn partial_header_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[1]).unwrap();
            drop(stream);
        });
        let conn = Connection::connect(addr, "test").unwrap();
        server.join().unwrap();

        let err = conn.receive().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PartialMessage));
    }
}
