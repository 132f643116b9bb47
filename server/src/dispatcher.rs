//! The receive loop that turns datagrams into stored readings.
//!
//! Datagrams are handled one at a time, in the order the socket delivers them: decode, add to
//! the reassembler, and, if that completes a reading, store it. Nothing here stops the loop
//! except the shutdown flag. Undecodable datagrams are logged and dropped, and a reading that a
//! sink fails to store is logged and not retried.
//!
//! # Examples
//!
//! ```no_run
//! # extern crate server;
//! # fn main() {
//! use server::{Config, Dispatcher};
//! let config = Config::default();
//! let fanout = server::fanout(&config).unwrap();
//! let mut dispatcher = Dispatcher::bind(&config, fanout).unwrap();
//! let stats = dispatcher.run().unwrap();
//! # }
//! ```

use chrono::{DateTime, Utc};
use failure::Error;
use sink::Sink;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::reading::Reassembler;
use telemetry::{Fragment, Reading};
use Config;

const READ_TIMEOUT_MILLIS: u64 = 100;

/// Receives datagrams and dispatches completed readings to a sink.
#[derive(Debug)]
pub struct Dispatcher<S> {
    socket: UdpSocket,
    buffer: Vec<u8>,
    reassembler: Reassembler,
    sink: S,
    running: Arc<AtomicBool>,
    verify_sender: bool,
    origins: HashMap<String, SocketAddr>,
    stats: Stats,
}

/// Counters kept by a dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
    /// Datagrams received.
    pub datagrams: u64,

    /// Datagrams that could not be decoded.
    pub decode_errors: u64,

    /// Fragments handed to the reassembler.
    pub fragments: u64,

    /// Fragments dropped because they came from the wrong sender.
    pub rejected: u64,

    /// Readings completed.
    pub readings: u64,

    /// Readings that the sink failed to store.
    pub sink_errors: u64,
}

impl<S: Sink> Dispatcher<S> {
    /// Binds a socket as configured and creates a dispatcher around it.
    pub fn bind(config: &Config, sink: S) -> Result<Dispatcher<S>, Error> {
        let socket = UdpSocket::bind((config.address.as_str(), config.port))?;
        Dispatcher::new(socket, config, sink)
    }

    /// Creates a dispatcher around an already bound socket.
    ///
    /// The socket's read timeout is set so that the run loop can notice a shutdown request.
    pub fn new(socket: UdpSocket, config: &Config, sink: S) -> Result<Dispatcher<S>, Error> {
        if config.max_datagram_size == 0 {
            return Err(format_err!("the maximum datagram size must be positive"));
        }
        socket.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MILLIS)))?;
        info!("listening for datagrams on {}", socket.local_addr()?);
        Ok(Dispatcher {
            socket: socket,
            buffer: vec![0; config.max_datagram_size],
            reassembler: Reassembler::with_limits(config.reassembly.limits()),
            sink: sink,
            running: Arc::new(AtomicBool::new(true)),
            verify_sender: config.verify_sender,
            origins: HashMap::new(),
            stats: Stats::default(),
        })
    }

    /// Returns a flag that stops the run loop when cleared.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.socket.local_addr().map_err(Error::from)
    }

    /// Returns this dispatcher's counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Returns a reference to the reassembler.
    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Returns a reference to the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Receives and handles datagrams until the shutdown flag is cleared.
    ///
    /// Pending transmissions are abandoned on shutdown.
    pub fn run(&mut self) -> Result<Stats, Error> {
        while self.running.load(Ordering::SeqCst) {
            let (len, sender) = match self.socket.recv_from(&mut self.buffer) {
                Ok(received) => received,
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    self.evict_idle(Utc::now());
                    continue;
                }
                Err(err) => {
                    error!("could not receive a datagram: {}", err);
                    continue;
                }
            };
            let datagram = self.buffer[..len].to_vec();
            self.handle(&datagram, sender, Utc::now());
        }
        info!(
            "shutting down, abandoning {} pending transmissions",
            self.reassembler.pending()
        );
        info!("{:?}", self.stats);
        Ok(self.stats)
    }

    /// Handles one datagram that arrived at the provided time.
    ///
    /// Returns the reading if the datagram completed one. The reading has already been passed
    /// to the sink, whether or not the sink stored it.
    pub fn handle(
        &mut self,
        bytes: &[u8],
        sender: SocketAddr,
        now: DateTime<Utc>,
    ) -> Option<Reading> {
        self.stats.datagrams += 1;
        let fragment = match Fragment::new(bytes) {
            Ok(fragment) => fragment,
            Err(err) => {
                warn!("dropping datagram from {}: {}", sender, err);
                self.stats.decode_errors += 1;
                return None;
            }
        };
        debug!(
            "fragment from {} at {} with {} channels",
            fragment.device_id(),
            sender,
            fragment.channels().len()
        );
        self.evict_idle(now);
        if !self.accept(&fragment, sender) {
            self.stats.rejected += 1;
            return None;
        }
        self.stats.fragments += 1;
        let reading = self.reassembler.add_at(fragment, now);
        self.forget_origins();
        let reading = reading?;
        self.stats.readings += 1;
        info!(
            "reading from {} with {} channels from {} fragments",
            reading.device_id,
            reading.channels.len(),
            reading.raw_fragments.len()
        );
        if let Err(err) = self.sink.store(&reading) {
            warn!("reading from {} was not stored: {}", reading.device_id, err);
            self.stats.sink_errors += 1;
        }
        Some(reading)
    }

    fn evict_idle(&mut self, now: DateTime<Utc>) {
        for device_id in self.reassembler.evict_idle(now) {
            self.origins.remove(&device_id);
        }
    }

    fn accept(&mut self, fragment: &Fragment, sender: SocketAddr) -> bool {
        if !self.verify_sender {
            return true;
        }
        let device_id = fragment.device_id();
        if self.reassembler.is_pending(device_id) {
            if let Some(origin) = self.origins.get(device_id) {
                if *origin != sender {
                    warn!(
                        "dropping fragment claiming to be from {}: sent by {}, expected {}",
                        device_id, sender, origin
                    );
                    return false;
                }
            }
        } else if !fragment.is_terminator() {
            self.origins.insert(device_id.to_string(), sender);
        }
        true
    }

    fn forget_origins(&mut self) {
        if self.origins.len() > self.reassembler.pending() {
            let reassembler = &self.reassembler;
            self.origins
                .retain(|device_id, _| reassembler.is_pending(device_id));
        }
    }
}
