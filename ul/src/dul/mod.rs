//! DICOM Upper Layer service provider.
//!
//! A [`DulServiceProvider`] drives one association's [state machine](fsm)
//! over a TCP connection.
//! It runs two threads:
//! a socket reader, which turns incoming bytes into PDU events,
//! and a worker, which owns the state machine, the response timer
//! and the write half of the connection.
//! Local primitives and received PDUs meet in the worker's event queue,
//! so PDUs reach the wire in the order they were submitted.
//! Indications travel back to the owner through a second queue.
pub mod fsm;

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use snafu::ResultExt;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportSnafu, UnexpectedEventSnafu};
use crate::pdu::{read_pdu_from_buffer, write_pdu, Pdu, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};
use crate::timer::Timer;

pub use self::fsm::{AbortReason, Effect, Event, EventKind, Indication, State, StateMachine};

/// Time given to the peer to close its end
/// after a local abort, before the connection is torn down.
const ABORT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Size of the chunks read from the socket.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Options for a [`DulServiceProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct DulOptions {
    /// the maximum length of the PDUs this node accepts,
    /// 0 meaning no limit
    pub max_pdu_length: u32,
    /// whether to refuse incoming PDUs longer than `max_pdu_length`
    pub strict: bool,
    /// the response timer (ARTIM) timeout
    pub artim_timeout: Option<Duration>,
    /// the timeout for opening the transport connection
    pub connect_timeout: Option<Duration>,
}

impl Default for DulOptions {
    fn default() -> Self {
        DulOptions {
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            artim_timeout: Some(Duration::from_secs(30)),
            connect_timeout: None,
        }
    }
}

impl DulOptions {
    /// The PDU length limit handed to the decoder,
    /// 0 when this node advertised no limit.
    fn receive_limit(&self) -> u32 {
        if self.max_pdu_length == 0 {
            0
        } else {
            self.max_pdu_length.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE)
        }
    }
}

/// The Upper Layer service provider of one association.
#[derive(Debug)]
pub struct DulServiceProvider {
    events: Sender<Event>,
    indications: Receiver<Indication>,
    /// indications taken out of the queue but not consumed yet
    pending: VecDeque<Indication>,
    state: Arc<AtomicU8>,
    /// a handle to the connection, for tearing it down from outside
    transport: Arc<Mutex<Option<TcpStream>>>,
    worker: Option<JoinHandle<()>>,
    /// disconnected once the worker is done
    exited: Receiver<()>,
    requestor: bool,
}

impl DulServiceProvider {
    /// Create a provider for requesting an association.
    ///
    /// No connection is made until an
    /// [`AssociateRequest`](Event::AssociateRequest) is submitted.
    pub fn new_requestor(address: SocketAddr, options: DulOptions) -> Result<Self> {
        Self::spawn(Endpoint::Remote(address), options, None, true)
    }

    /// Create a provider for a connection accepted from a peer.
    ///
    /// The state machine is told of the new connection right away
    /// and starts waiting for the association request.
    pub fn new_acceptor(stream: TcpStream, options: DulOptions) -> Result<Self> {
        Self::spawn(
            Endpoint::Connected(stream),
            options,
            Some(Event::TransportConnectIndication),
            false,
        )
    }

    fn spawn(
        endpoint: Endpoint,
        options: DulOptions,
        initial: Option<Event>,
        requestor: bool,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel();
        let (indication_tx, indication_rx) = mpsc::channel();
        let (exit_tx, exit_rx) = mpsc::channel();
        let state = Arc::new(AtomicU8::new(state_index(State::Sta1)));
        let transport = Arc::new(Mutex::new(None));

        let mut worker = Worker {
            machine: StateMachine::new(),
            timer: Timer::new(options.artim_timeout),
            events: event_rx,
            event_sender: event_tx.clone(),
            indications: indication_tx,
            stream: None,
            endpoint_address: None,
            transport: Arc::clone(&transport),
            state: Arc::clone(&state),
            options,
            _exit: exit_tx,
        };
        // queued ahead of anything the socket reader may produce
        if let Some(event) = initial {
            event_tx.send(event).ok();
        }
        match endpoint {
            Endpoint::Connected(stream) => worker.attach(stream).context(TransportSnafu)?,
            Endpoint::Remote(address) => worker.endpoint_address = Some(address),
        }

        let handle = std::thread::Builder::new()
            .name("dul-worker".to_string())
            .spawn(move || worker.run())
            .context(TransportSnafu)?;

        Ok(DulServiceProvider {
            events: event_tx,
            indications: indication_rx,
            pending: VecDeque::new(),
            state,
            transport,
            worker: Some(handle),
            exited: exit_rx,
            requestor,
        })
    }

    /// Submit a local service primitive to the state machine.
    pub fn send(&self, event: Event) -> Result<()> {
        let kind = event.kind();
        self.events.send(event).map_err(|_| {
            UnexpectedEventSnafu {
                description: format!("{:?} submitted after the provider stopped", kind),
            }
            .build()
        })
    }

    /// Obtain the next indication,
    /// waiting up to the given timeout (or indefinitely if `None`).
    ///
    /// Returns `None` if the timeout expires
    /// or the provider stops with no indications left.
    pub fn next_indication(&mut self, timeout: Option<Duration>) -> Option<Indication> {
        if let Some(indication) = self.pending.pop_front() {
            return Some(indication);
        }
        match timeout {
            Some(timeout) => self.indications.recv_timeout(timeout).ok(),
            None => self.indications.recv().ok(),
        }
    }

    /// Take the first indication matching the given predicate,
    /// without blocking.
    ///
    /// Indications which do not match stay in place,
    /// in their order of arrival.
    pub fn take_indication<F>(&mut self, predicate: F) -> Option<Indication>
    where
        F: Fn(&Indication) -> bool,
    {
        self.drain_queue();
        let position = self.pending.iter().position(predicate)?;
        self.pending.remove(position)
    }

    /// Peek at the oldest indication not consumed yet, without blocking.
    pub fn peek_indication(&mut self) -> Option<&Indication> {
        self.drain_queue();
        self.pending.front()
    }

    /// Block until at least one indication is available
    /// or the timeout expires.
    ///
    /// Returns whether an indication is available.
    pub fn wait_indication(&mut self, timeout: Option<Duration>) -> bool {
        self.drain_queue();
        if !self.pending.is_empty() {
            return true;
        }
        let received = match timeout {
            Some(timeout) => self.indications.recv_timeout(timeout).ok(),
            None => self.indications.recv().ok(),
        };
        match received {
            Some(indication) => {
                self.pending.push_back(indication);
                true
            }
            None => false,
        }
    }

    /// Wait up to `timeout` for an indication matching the predicate.
    ///
    /// Other indications arriving meanwhile are kept for later.
    pub fn wait_for<F>(&mut self, predicate: F, timeout: Option<Duration>) -> Option<Indication>
    where
        F: Fn(&Indication) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(indication) = self.take_indication(&predicate) {
                return Some(indication);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match remaining {
                Some(remaining) => match self.indications.recv_timeout(remaining) {
                    Ok(indication) => self.pending.push_back(indication),
                    Err(RecvTimeoutError::Timeout) => return None,
                    Err(RecvTimeoutError::Disconnected) => {
                        return self.take_indication(&predicate)
                    }
                },
                None => match self.indications.recv() {
                    Ok(indication) => self.pending.push_back(indication),
                    Err(_) => return self.take_indication(&predicate),
                },
            }
        }
    }

    fn drain_queue(&mut self) {
        self.pending.extend(self.indications.try_iter());
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// The current state of the state machine.
    pub fn state(&self) -> State {
        let index = self.state.load(Ordering::Acquire) as usize;
        State::ALL.get(index).copied().unwrap_or(State::Sta1)
    }

    pub fn is_requestor(&self) -> bool {
        self.requestor
    }

    /// Wait up to `timeout` for the worker thread to finish.
    ///
    /// Returns whether the worker is gone.
    pub fn join(&mut self, timeout: Duration) -> bool {
        if let Err(RecvTimeoutError::Timeout) = self.exited.recv_timeout(timeout) {
            return false;
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("DUL worker panicked");
            }
        }
        true
    }

    /// Stop the provider: give the worker a moment to wind down,
    /// then tear down the connection if it is still running.
    pub fn stop(&mut self) {
        if !self.join(ABORT_GRACE_PERIOD) {
            self.kill();
            self.join(ABORT_GRACE_PERIOD);
        }
    }

    /// Shut down the transport connection immediately.
    ///
    /// The socket reader sees the connection close,
    /// which brings the state machine back to idle.
    pub fn kill(&self) {
        if let Ok(guard) = self.transport.lock() {
            if let Some(stream) = guard.as_ref() {
                debug!("Shutting down transport connection");
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Drop for DulServiceProvider {
    fn drop(&mut self) {
        if self.is_alive() {
            self.kill();
            // the worker holds a sender of its own, so it may still be
            // waiting for an event when no connection was ever made
            let _ = self.events.send(Event::TransportClosed);
        }
    }
}

enum Endpoint {
    Remote(SocketAddr),
    Connected(TcpStream),
}

fn state_index(state: State) -> u8 {
    State::ALL.iter().position(|s| *s == state).unwrap_or(0) as u8
}

/// The state owned by the DUL worker thread.
struct Worker {
    machine: StateMachine,
    timer: Timer,
    events: Receiver<Event>,
    /// handed over to the socket reader
    event_sender: Sender<Event>,
    indications: Sender<Indication>,
    stream: Option<TcpStream>,
    endpoint_address: Option<SocketAddr>,
    transport: Arc<Mutex<Option<TcpStream>>>,
    state: Arc<AtomicU8>,
    options: DulOptions,
    /// dropped along with the worker, waking up `join`
    _exit: Sender<()>,
}

impl Worker {
    fn run(mut self) {
        let mut queue: VecDeque<Event> = VecDeque::new();
        loop {
            let event = match queue.pop_front() {
                Some(event) => event,
                None => match self.next_event() {
                    Some(event) => event,
                    None => break,
                },
            };

            let effects = self.machine.handle(event);
            for effect in effects {
                self.apply(effect, &mut queue);
            }
            self.state
                .store(state_index(self.machine.state()), Ordering::Release);

            if self.machine.state() == State::Sta1 {
                break;
            }
        }
        self.close();
        debug!("DUL worker finished");
    }

    /// Block for the next event,
    /// turning an expired timer into a timer event.
    fn next_event(&mut self) -> Option<Event> {
        match self.timer.remaining() {
            Some(remaining) => match self.events.recv_timeout(remaining) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => {
                    self.timer.stop();
                    warn!("Response timer expired in {}", self.machine.state());
                    Some(Event::TimerExpired)
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => self.events.recv().ok(),
        }
    }

    fn apply(&mut self, effect: Effect, queue: &mut VecDeque<Event>) {
        match effect {
            Effect::Connect => match self.connect() {
                Ok(()) => queue.push_back(Event::TransportConnectConfirmed),
                Err(e) => {
                    warn!("Could not connect to peer: {}", e);
                    queue.push_back(Event::TransportClosed);
                }
            },
            Effect::Send(pdu) => {
                if let Err(e) = self.write(&pdu) {
                    warn!("Could not send {}: {}", pdu.short_description(), e);
                    queue.push_back(Event::TransportClosed);
                }
            }
            Effect::Deliver(indication) => {
                // the owner may be gone already, nothing to do then
                let _ = self.indications.send(indication);
            }
            Effect::StartTimer => self.timer.restart(),
            Effect::StopTimer => self.timer.stop(),
            Effect::CloseTransport => self.close(),
        }
    }

    fn connect(&mut self) -> std::io::Result<()> {
        let address = self
            .endpoint_address
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotConnected, "no peer address"))?;
        debug!("Connecting to {}", address);
        let stream = match self.options.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&address, timeout)?,
            None => TcpStream::connect(address)?,
        };
        self.attach(stream)
    }

    /// Take ownership of an open connection and start reading from it.
    fn attach(&mut self, stream: TcpStream) -> std::io::Result<()> {
        let reader = stream.try_clone()?;
        if let Ok(mut guard) = self.transport.lock() {
            *guard = Some(stream.try_clone()?);
        }
        let events = self.event_sender.clone();
        let max_pdu_length = self.options.receive_limit();
        let strict = self.options.strict;
        std::thread::Builder::new()
            .name("dul-reader".to_string())
            .spawn(move || read_loop(reader, events, max_pdu_length, strict))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn write(&mut self, pdu: &Pdu) -> std::io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotConnected, "transport closed"))?;
        let mut buffer = Vec::with_capacity(pdu_size_hint(pdu));
        write_pdu(&mut buffer, pdu).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        debug!("Sending {}", pdu.short_description());
        stream.write_all(&buffer)?;
        stream.flush()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Closing transport connection");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn pdu_size_hint(pdu: &Pdu) -> usize {
    match pdu {
        Pdu::PData { data } => data.iter().map(|v| v.data.len() + 6).sum::<usize>() + 6,
        _ => 256,
    }
}

/// Read PDUs off the connection until it closes,
/// feeding each one to the worker as an event.
fn read_loop(mut stream: TcpStream, events: Sender<Event>, max_pdu_length: u32, strict: bool) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = vec![0; READ_CHUNK_SIZE];
    let mut malformed = false;

    loop {
        while !malformed {
            match read_pdu_from_buffer(&mut buffer, max_pdu_length, strict) {
                Ok(Some(pdu)) => {
                    debug!("Received {}", pdu.short_description());
                    if events.send(Event::from_received(pdu)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Malformed PDU received: {}", e);
                    // the stream cannot be resynchronized,
                    // so the rest is discarded until the peer closes
                    malformed = true;
                    buffer.clear();
                    if events.send(Event::InvalidPdu).is_err() {
                        return;
                    }
                }
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                trace!("Transport connection closed by peer");
                let _ = events.send(Event::TransportClosed);
                return;
            }
            Ok(n) => {
                if !malformed {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Transport read failed: {}", e);
                let _ = events.send(Event::TransportClosed);
                return;
            }
        }
    }
}
