// A trivial stub broker used only by this test suite. It is not part
// of the library: it exists to exercise `Publisher`/`EventHandler`
// against something that speaks the wire protocol, the way the spec's
// scenarios call for "a trivial stub broker that echoes all publishes
// to all matching subscribers".

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use pubsub_codec::{pack, topic_chain, unpack_body, unpack_header, Message, HEADER_LEN};

struct ClientState {
    stream: TcpStream,
    topics: Vec<String>,
}

#[derive(Default)]
struct Shared {
    clients: Mutex<HashMap<u64, ClientState>>,
    subscribe_count: Mutex<HashMap<String, u32>>,
    unsubscribe_count: Mutex<HashMap<String, u32>>,
}

/// A minimal thread-per-connection broker for tests: tracks each
/// connection's subscribed topics and fans out `publish` frames to any
/// connection subscribed to the published topic or one of its
/// ancestors, as the real broker is specified to do.
pub struct StubBroker {
    addr: std::net::SocketAddr,
    shared: Arc<Shared>,
    next_client_id: AtomicUsize,
}

impl StubBroker {
    pub fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub broker");
        let addr = listener.local_addr().expect("local addr");
        let broker = Arc::new(Self {
            addr,
            shared: Arc::new(Shared::default()),
            next_client_id: AtomicUsize::new(0),
        });

        let accept_broker = Arc::clone(&broker);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let client_id = accept_broker.next_client_id.fetch_add(1, Ordering::SeqCst) as u64;
                let handler_stream = stream.try_clone().expect("clone client stream");
                accept_broker.shared.clients.lock().unwrap().insert(
                    client_id,
                    ClientState {
                        stream: handler_stream,
                        topics: Vec::new(),
                    },
                );
                let broker = Arc::clone(&accept_broker);
                thread::spawn(move || broker.serve(client_id, stream));
            }
        });

        broker
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn subscribe_count(&self, topic: &str) -> u32 {
        *self
            .shared
            .subscribe_count
            .lock()
            .unwrap()
            .get(topic)
            .unwrap_or(&0)
    }

    pub fn unsubscribe_count(&self, topic: &str) -> u32 {
        *self
            .shared
            .unsubscribe_count
            .lock()
            .unwrap()
            .get(topic)
            .unwrap_or(&0)
    }

    fn serve(&self, client_id: u64, mut stream: TcpStream) {
        loop {
            let mut header = [0u8; HEADER_LEN];
            if read_exact_or_eof(&mut stream, &mut header).is_none() {
                break;
            }
            let Ok((message_type, body_len)) = unpack_header(&header) else {
                break;
            };
            let mut body = vec![0u8; body_len];
            if read_exact_or_eof(&mut stream, &mut body).is_none() {
                break;
            }
            let Ok(message) = unpack_body(message_type, &body, true) else {
                break;
            };

            match message {
                Message::IntroduceMyself { .. } => {}
                Message::Goodbye { .. } => break,
                Message::Subscribe { topic } => {
                    *self
                        .shared
                        .subscribe_count
                        .lock()
                        .unwrap()
                        .entry(topic.clone())
                        .or_insert(0) += 1;
                    let mut clients = self.shared.clients.lock().unwrap();
                    if let Some(state) = clients.get_mut(&client_id) {
                        state.topics.push(topic);
                    }
                }
                Message::Unsubscribe { topic } => {
                    *self
                        .shared
                        .unsubscribe_count
                        .lock()
                        .unwrap()
                        .entry(topic.clone())
                        .or_insert(0) += 1;
                    let mut clients = self.shared.clients.lock().unwrap();
                    if let Some(state) = clients.get_mut(&client_id) {
                        state.topics.retain(|t| t != &topic);
                    }
                }
                Message::Publish { topic, obj } => {
                    let chain = topic_chain(&topic);
                    let frame = pack(&Message::Publish {
                        topic: topic.clone(),
                        obj,
                    })
                    .expect("pack publish for fan-out");

                    let mut clients = self.shared.clients.lock().unwrap();
                    for state in clients.values_mut() {
                        if state.topics.iter().any(|t| chain.contains(t)) {
                            let _ = std::io::Write::write_all(&mut state.stream, &frame);
                        }
                    }
                }
            }
        }

        self.shared.clients.lock().unwrap().remove(&client_id);
    }
}

fn read_exact_or_eof(stream: &mut TcpStream, buf: &mut [u8]) -> Option<()> {
    use std::io::Read;
    let mut received = 0;
    while received < buf.len() {
        match stream.read(&mut buf[received..]) {
            Ok(0) => return None,
            Ok(n) => received += n,
            Err(_) => return None,
        }
    }
    Some(())
}
