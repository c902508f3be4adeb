//! The peer hub: synchronous TCP RPC between peers.
//!
//! One accept thread feeds inbound connections to a fixed pool of worker
//! threads; outbound requests open a fresh connection per call. Frames are
//! `u32`-length-prefixed JSON envelopes. The hub merges the Lamport clock on
//! every received envelope and reply.
//!
//! Handlers run on the worker pool and must never block on another peer's
//! lock; anything that needs a distributed lock is pushed onto a detached
//! thread by the handler itself.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{CartaError, Result};
use crate::net::message::{Envelope, Reply, Request, Response};
use crate::net::peer::PeerId;
use crate::time::LogicalTime;

/// Request dispatcher installed by the table manager.
pub type Handler = Arc<dyn Fn(&PeerId, Request) -> Response + Send + Sync>;

const IDLE_POLL: Duration = Duration::from_millis(100);

pub struct PeerHub {
    own_id: PeerId,
    handler: RwLock<Option<Handler>>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PeerHub {
    /// Bind the listener and start the accept thread plus `workers` handler
    /// threads. `listen_addr` may use port 0; the advertised id carries the
    /// actually bound port.
    pub fn bind(listen_addr: &str, workers: usize) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr)
            .map_err(|e| CartaError::Transport(format!("bind {listen_addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| CartaError::Transport(e.to_string()))?;
        let own_id = PeerId::new(local.to_string());

        let hub = Arc::new(Self {
            own_id,
            handler: RwLock::new(None),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let (tx, rx): (Sender<TcpStream>, Receiver<TcpStream>) = bounded(128);
        let mut threads = hub.threads.lock();
        for i in 0..workers.max(1) {
            let hub_ref = Arc::clone(&hub);
            let rx = rx.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("hub-worker-{i}"))
                    .spawn(move || hub_ref.worker_loop(rx))
                    .expect("spawn hub worker"),
            );
        }
        let hub_ref = Arc::clone(&hub);
        threads.push(
            thread::Builder::new()
                .name("hub-accept".into())
                .spawn(move || hub_ref.accept_loop(listener, tx))
                .expect("spawn hub accept thread"),
        );
        drop(threads);
        Ok(hub)
    }

    pub fn own_id(&self) -> &PeerId {
        &self.own_id
    }

    /// Install the single request dispatcher.
    pub fn register_handler(&self, handler: Handler) {
        *self.handler.write() = Some(handler);
    }

    /// Send a request and wait for the typed response.
    pub fn request(&self, peer: &PeerId, request: &Request) -> Result<Response> {
        let mut stream = TcpStream::connect(peer.address())
            .map_err(|e| CartaError::Transport(format!("connect {peer}: {e}")))?;
        let envelope = Envelope {
            sender: self.own_id.clone(),
            clock: LogicalTime::sample().serialize(),
            request: request.clone(),
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| CartaError::Invariant(format!("request encode: {e}")))?;
        write_frame(&mut stream, &bytes).map_err(|e| CartaError::Transport(e.to_string()))?;

        let frame = read_frame(&mut stream)
            .map_err(|e| CartaError::Transport(e.to_string()))?
            .ok_or_else(|| CartaError::Transport(format!("{peer} closed the connection")))?;
        let reply: Reply = serde_json::from_slice(&frame)
            .map_err(|e| CartaError::Transport(format!("reply decode: {e}")))?;
        LogicalTime::update(LogicalTime(reply.clock));
        Ok(reply.response)
    }

    /// Like `request`, but swallows transport failures.
    pub fn try_request(&self, peer: &PeerId, request: &Request) -> Option<Response> {
        self.request(peer, request).ok()
    }

    /// Broadcast that tolerates no dissent: every peer must ack.
    pub fn undisputable_broadcast(&self, peers: &[PeerId], request: &Request) -> Result<()> {
        for peer in peers {
            match self.request(peer, request)? {
                Response::Ack => {}
                other => {
                    return Err(CartaError::Decline(format!(
                        "{peer} answered {other:?} to an undisputable broadcast"
                    )))
                }
            }
        }
        Ok(())
    }

    /// True if the peer answers a ping.
    pub fn has_peer(&self, peer: &PeerId) -> bool {
        matches!(self.try_request(peer, &Request::Ping), Some(Response::Ack))
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the accept thread.
        let _ = TcpStream::connect(self.own_id.address());
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn accept_loop(&self, listener: TcpListener, tx: Sender<TcpStream>) {
        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match stream {
                Ok(stream) => {
                    if tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("accept error: {e}"),
            }
        }
        debug!("hub accept thread exiting");
    }

    fn worker_loop(&self, rx: Receiver<TcpStream>) {
        loop {
            match rx.recv_timeout(IDLE_POLL) {
                Ok(stream) => self.serve_connection(stream),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn serve_connection(&self, mut stream: TcpStream) {
        let _ = stream.set_read_timeout(Some(IDLE_POLL));
        loop {
            let frame = match read_frame(&mut stream) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    debug!("connection error: {e}");
                    return;
                }
            };
            let envelope: Envelope = match serde_json::from_slice(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("dropping undecodable frame: {e}");
                    return;
                }
            };
            LogicalTime::update(LogicalTime(envelope.clock));

            let handler = self.handler.read().clone();
            let response = match handler {
                Some(handler) => handler(&envelope.sender, envelope.request),
                None => Response::Decline,
            };
            let reply = Reply {
                clock: LogicalTime::sample().serialize(),
                response,
            };
            let bytes = match serde_json::to_vec(&reply) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("reply encode failed: {e}");
                    return;
                }
            };
            if let Err(e) = write_frame(&mut stream, &bytes) {
                debug!("reply write failed: {e}");
                return;
            }
        }
    }
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32_le(payload.len() as u32);
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

/// Reads one frame; `Ok(None)` on clean EOF before a header.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    // The payload follows the header immediately; a timeout mid-payload is a
    // real error, not an idle poll.
    let previous = stream.read_timeout()?;
    stream.set_read_timeout(None)?;
    let result = stream.read_exact(&mut payload);
    stream.set_read_timeout(previous)?;
    result?;
    Ok(Some(payload))
}
