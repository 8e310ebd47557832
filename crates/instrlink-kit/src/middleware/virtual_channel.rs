//! Several logical data channels over one physical DMA channel.
//!
//! Each send is queued for a transmitter thread that writes it as one or
//! more tagged frames on the physical channel; `wait_dma` observes when the
//! last frame has gone out. A demux thread reads frames back off the physical channel and queues each
//! payload for the logical channel its tag maps to. Queues are FIFO per
//! channel, so each channel sees its frames in arrival order no matter how
//! channels interleave on the wire.
//!
//! On the wire every frame is zero-padded to a whole number of 4-byte
//! words so that PCIe engines can move it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use instrlink_frame::channel::is_padding;
use instrlink_frame::packet::padded_len;
use instrlink_frame::{
    decode_header, encode_frame, DEFAULT_PHYSICAL_CHANNEL, HEADER_SIZE, MAX_VIRTUAL_CHANNELS,
};
use instrlink_transport::TransportError;
use tracing::{debug, info, warn};

use super::{Middleware, StreamNext};
use crate::error::{KitError, Result};
use crate::resource::{
    BufferId, Channel, Direction, ResourceManager, TransferId, TransferRequest, TransferTicket,
};

/// One logical channel and the frame tag that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRoute {
    pub logical: u16,
    pub tag: u16,
}

/// Logical channel to frame tag mapping. Fixed once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualChannelTable {
    routes: Vec<ChannelRoute>,
}

impl VirtualChannelTable {
    pub fn new(routes: impl IntoIterator<Item = ChannelRoute>) -> Result<Self> {
        let routes: Vec<ChannelRoute> = routes.into_iter().collect();
        if routes.is_empty() || routes.len() > MAX_VIRTUAL_CHANNELS {
            return Err(KitError::Config(format!(
                "virtual channel table needs 1..={MAX_VIRTUAL_CHANNELS} entries, got {}",
                routes.len()
            )));
        }
        let mut logicals = HashSet::new();
        let mut tags = HashSet::new();
        for route in &routes {
            if is_padding(route.tag) {
                return Err(KitError::Config(format!(
                    "tag {:#x} is reserved for padding",
                    route.tag
                )));
            }
            if !logicals.insert(route.logical) {
                return Err(KitError::Config(format!(
                    "logical channel {} listed twice",
                    route.logical
                )));
            }
            if !tags.insert(route.tag) {
                return Err(KitError::Config(format!("tag {} used twice", route.tag)));
            }
        }
        Ok(Self { routes })
    }

    /// Logical channels `0..count`, each tagged with its own number.
    pub fn identity(count: u16) -> Result<Self> {
        Self::new((0..count).map(|n| ChannelRoute { logical: n, tag: n }))
    }

    pub fn tag_for(&self, logical: u16) -> Option<u16> {
        self.routes
            .iter()
            .find(|route| route.logical == logical)
            .map(|route| route.tag)
    }

    pub fn logical_for(&self, tag: u16) -> Option<u16> {
        self.routes
            .iter()
            .find(|route| route.tag == tag)
            .map(|route| route.logical)
    }

    pub fn routes(&self) -> &[ChannelRoute] {
        &self.routes
    }
}

/// Framing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualChannelOptions {
    /// Physical channel carrying every frame.
    pub physical_channel: u16,
    /// Sends larger than this are split into several frames.
    pub max_frame_payload: usize,
    /// How often blocked waits re-check for shutdown and cancellation.
    pub poll: Duration,
}

impl Default for VirtualChannelOptions {
    fn default() -> Self {
        Self {
            physical_channel: DEFAULT_PHYSICAL_CHANNEL,
            max_frame_payload: 64 * 1024,
            poll: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct DemuxState {
    running: bool,
    failure: Option<String>,
    queues: HashMap<u16, VecDeque<Bytes>>,
    // One receive per logical channel, enforced by the resource manager.
    waiting: HashMap<u16, TransferTicket>,
}

impl DemuxState {
    /// Hand the oldest queued frame to the channel's waiting receive. A
    /// frame longer than the receive is split; the rest stays queued.
    fn deliver(&mut self, logical: u16) {
        let Some(queue) = self.queues.get_mut(&logical) else {
            return;
        };
        if queue.is_empty() {
            return;
        }
        let Some(ticket) = self.waiting.remove(&logical) else {
            return;
        };
        if ticket.is_aborted() {
            return;
        }
        let Some(frame) = queue.pop_front() else {
            return;
        };
        let taken = ticket.fill(&frame);
        if taken < frame.len() {
            queue.push_front(frame.slice(taken..));
        }
        ticket.complete(taken);
    }

    fn fail_all(&mut self, reason: &str) {
        self.failure = Some(reason.to_string());
        for (_, ticket) in self.waiting.drain() {
            ticket.fail(reason);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Demux {
    state: Mutex<DemuxState>,
    stop: AtomicBool,
}

impl Demux {
    fn lock(&self) -> MutexGuard<'_, DemuxState> {
        lock(&self.state)
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Multiplexes logical channels onto one physical channel.
///
/// When disabled every call passes straight through.
pub struct VirtualChannelMiddleware {
    enabled: bool,
    table: VirtualChannelTable,
    options: VirtualChannelOptions,
    demux: Arc<Demux>,
    workers: Mutex<Option<Workers>>,
}

/// Threads running while a stream is attached.
struct Workers {
    pump: JoinHandle<()>,
    transmitter: JoinHandle<()>,
    outgoing: Sender<Outgoing>,
}

/// A logical send waiting for the transmitter.
struct Outgoing {
    tag: u16,
    ticket: TransferTicket,
}

impl VirtualChannelMiddleware {
    pub fn new(table: VirtualChannelTable, options: VirtualChannelOptions) -> Self {
        Self {
            enabled: true,
            table,
            options,
            demux: Arc::new(Demux {
                state: Mutex::new(DemuxState::default()),
                stop: AtomicBool::new(false),
            }),
            workers: Mutex::new(None),
        }
    }

    /// A middleware that forwards everything unchanged.
    pub fn disabled() -> Self {
        let mut middleware = Self::new(
            VirtualChannelTable {
                routes: Vec::new(),
            },
            VirtualChannelOptions::default(),
        );
        middleware.enabled = false;
        middleware
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn table(&self) -> &VirtualChannelTable {
        &self.table
    }

    fn route(&self, logical: u16) -> Result<u16> {
        self.table.tag_for(logical).ok_or_else(|| {
            KitError::Validation(format!(
                "logical channel {logical} is not in the virtual channel table"
            ))
        })
    }
}

/// Writes queued sends as tagged frames, one send at a time so the frames
/// of a send stay contiguous on the wire.
struct Transmitter {
    demux: Arc<Demux>,
    next: StreamNext,
    options: VirtualChannelOptions,
}

impl Transmitter {
    fn run(self, queue: Receiver<Outgoing>) {
        for Outgoing { tag, ticket } in queue {
            if ticket.is_aborted() {
                continue;
            }
            if self.demux.stopping() {
                ticket.fail("virtual channel transmitter stopped");
                continue;
            }
            match self.transmit(tag, &ticket) {
                Ok(()) => {
                    ticket.complete(ticket.length());
                }
                Err(KitError::Cancelled(_)) if ticket.is_aborted() => {
                    debug!(transfer = %ticket.id(), "logical send cancelled");
                }
                Err(err) => {
                    warn!(%err, transfer = %ticket.id(), "logical send failed");
                    ticket.fail(err.to_string());
                }
            }
        }
        debug!("virtual channel transmitter stopped");
    }

    fn transmit(&self, tag: u16, ticket: &TransferTicket) -> Result<()> {
        let payload = ticket.payload();
        for chunk in payload.chunks(self.options.max_frame_payload.max(1)) {
            let mut frame = BytesMut::new();
            encode_frame(tag, chunk, &mut frame).map_err(KitError::from)?;
            frame.resize(padded_len(frame.len()), 0);
            self.send_frame(&frame, ticket)?;
        }
        Ok(())
    }

    fn send_frame(&self, frame: &[u8], owner: &TransferTicket) -> Result<()> {
        let resources = self.next.resources();
        let staging = resources.alloc(frame.len())?;
        let result = (|| -> Result<()> {
            resources.get_buffer(staging, frame.len())?.write(0, frame)?;
            let request = TransferRequest::new(
                Channel::Physical(self.options.physical_channel),
                staging,
                frame.len(),
            );
            self.next.send_open(&request)?;
            let finished = await_transfer(&self.next, staging, self.options.poll, || {
                owner.is_aborted() || self.demux.stopping()
            })?;
            match finished {
                Some(_) => Ok(()),
                None => Err(KitError::Cancelled(owner.id())),
            }
        })();
        if let Err(err) = resources.free(staging) {
            debug!(%err, "staging buffer not released");
        }
        result
    }
}

/// Wait for the transfer on `buffer`, re-checking `give_up` every `poll`.
/// Returns `Ok(None)` after cancelling it when `give_up` says so.
fn await_transfer(
    next: &StreamNext,
    buffer: BufferId,
    poll: Duration,
    give_up: impl Fn() -> bool,
) -> Result<Option<usize>> {
    loop {
        match next.wait_dma(buffer, poll) {
            Ok(moved) => return Ok(Some(moved)),
            Err(KitError::Timeout(_)) if give_up() => {
                next.break_dma(buffer)?;
                return Ok(None);
            }
            Err(KitError::Timeout(_)) => {}
            Err(err) => return Err(err),
        }
    }
}

struct Pump {
    demux: Arc<Demux>,
    next: StreamNext,
    table: VirtualChannelTable,
    options: VirtualChannelOptions,
}

impl Pump {
    fn run(self) {
        let resources = Arc::clone(self.next.resources());
        let outcome = self.with_buffers(&resources);
        match outcome {
            // Our own transfer was cancelled along with everything else.
            Ok(()) | Err(KitError::Cancelled(_)) => debug!("virtual channel demux stopped"),
            Err(err) => {
                warn!(%err, "virtual channel demux failed");
                self.demux.lock().fail_all(&err.to_string());
            }
        }
    }

    fn with_buffers(&self, resources: &ResourceManager) -> Result<()> {
        let header = resources.alloc(HEADER_SIZE)?;
        let body = match resources.alloc(padded_len(self.options.max_frame_payload.max(1))) {
            Ok(body) => body,
            Err(err) => {
                if let Err(free_err) = resources.free(header) {
                    debug!(err = %free_err, "demux header buffer not released");
                }
                return Err(err);
            }
        };
        let outcome = self.pump(resources, header, body);
        for buffer in [header, body] {
            if let Err(err) = self.next.break_dma(buffer) {
                debug!(%err, %buffer, "demux transfer not cancelled");
            }
            if let Err(err) = resources.free(buffer) {
                debug!(%err, %buffer, "demux buffer not released");
            }
        }
        outcome
    }

    fn receive(&self, buffer: BufferId, length: usize) -> Result<Option<usize>> {
        let request = TransferRequest::new(
            Channel::Physical(self.options.physical_channel),
            buffer,
            length,
        );
        self.next.recv_open(&request)?;
        await_transfer(&self.next, buffer, self.options.poll, || {
            self.demux.stopping()
        })
    }

    fn pump(&self, resources: &ResourceManager, header: BufferId, body: BufferId) -> Result<()> {
        loop {
            if self.receive(header, HEADER_SIZE)?.is_none() {
                return Ok(());
            }
            let head = resources.get_buffer(header, HEADER_SIZE)?.to_vec();
            let Some(frame) = decode_header(&head, self.options.max_frame_payload)
                .map_err(KitError::from)?
            else {
                return Err(KitError::Validation("short frame header".into()));
            };
            let (tag, payload_len) = (frame.tag, frame.payload_len);

            let wire_len = padded_len(payload_len);
            let payload = if wire_len == 0 {
                Bytes::new()
            } else {
                if self.receive(body, wire_len)?.is_none() {
                    return Ok(());
                }
                Bytes::from(resources.get_buffer(body, wire_len)?.read(0, payload_len)?)
            };
            self.route(tag, payload);
        }
    }

    fn route(&self, tag: u16, payload: Bytes) {
        if is_padding(tag) {
            return;
        }
        let Some(logical) = self.table.logical_for(tag) else {
            warn!(tag, len = payload.len(), "dropping frame with unknown channel tag");
            return;
        };
        let mut state = self.demux.lock();
        state.queues.entry(logical).or_default().push_back(payload);
        state.deliver(logical);
    }
}

impl Middleware for VirtualChannelMiddleware {
    fn name(&self) -> &'static str {
        "virtual-channel"
    }

    fn send_open(&self, request: &TransferRequest, next: &StreamNext) -> Result<TransferId> {
        let Channel::Logical(logical) = request.channel else {
            return next.send_open(request);
        };
        if !self.enabled {
            return next.send_open(request);
        }
        let tag = self.route(logical)?;
        let workers = lock(&self.workers);
        let Some(workers) = workers.as_ref() else {
            return Err(TransportError::Shutdown.into());
        };
        let ticket = next.resources().open_transfer(request, Direction::Send)?;
        let id = ticket.id();
        if let Err(mpsc::SendError(rejected)) = workers.outgoing.send(Outgoing { tag, ticket }) {
            rejected.ticket.fail("virtual channel transmitter stopped");
            return Err(TransportError::Shutdown.into());
        }
        Ok(id)
    }

    fn recv_open(&self, request: &TransferRequest, next: &StreamNext) -> Result<TransferId> {
        let Channel::Logical(logical) = request.channel else {
            return next.recv_open(request);
        };
        if !self.enabled {
            return next.recv_open(request);
        }
        self.route(logical)?;
        let mut state = self.demux.lock();
        if let Some(reason) = &state.failure {
            return Err(TransportError::Link(reason.clone()).into());
        }
        if !state.running {
            return Err(TransportError::Shutdown.into());
        }
        let ticket = next.resources().open_transfer(request, Direction::Recv)?;
        let id = ticket.id();
        state.waiting.insert(logical, ticket);
        state.deliver(logical);
        Ok(id)
    }

    fn break_dma(&self, buffer: BufferId, next: &StreamNext) -> Result<()> {
        next.break_dma(buffer)?;
        if self.enabled {
            self.demux
                .lock()
                .waiting
                .retain(|_, ticket| !ticket.is_aborted());
        }
        Ok(())
    }

    fn attach_stream(&self, next: &StreamNext) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut workers = lock(&self.workers);
        if workers.is_some() {
            return Ok(());
        }
        {
            let mut state = self.demux.lock();
            *state = DemuxState {
                running: true,
                ..DemuxState::default()
            };
        }
        self.demux.stop.store(false, Ordering::SeqCst);
        let worker = Pump {
            demux: Arc::clone(&self.demux),
            next: next.clone(),
            table: self.table.clone(),
            options: self.options,
        };
        let pump = std::thread::Builder::new()
            .name("instrlink-vc-demux".into())
            .spawn(move || worker.run())
            .map_err(TransportError::Io)?;

        let (outgoing, queue) = mpsc::channel();
        let transmitter = Transmitter {
            demux: Arc::clone(&self.demux),
            next: next.clone(),
            options: self.options,
        };
        let spawned = std::thread::Builder::new()
            .name("instrlink-vc-tx".into())
            .spawn(move || transmitter.run(queue));
        let transmitter = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.demux.stop.store(true, Ordering::SeqCst);
                if pump.join().is_err() {
                    warn!("virtual channel demux panicked");
                }
                self.demux.lock().running = false;
                return Err(TransportError::Io(err).into());
            }
        };
        *workers = Some(Workers {
            pump,
            transmitter,
            outgoing,
        });
        info!(
            channels = self.table.routes().len(),
            physical = self.options.physical_channel,
            "virtual channel demux started"
        );
        Ok(())
    }

    fn detach_stream(&self) {
        let Some(workers) = lock(&self.workers).take() else {
            return;
        };
        self.demux.stop.store(true, Ordering::SeqCst);
        // Closing the queue lets the transmitter drain and exit.
        drop(workers.outgoing);
        for (role, handle) in [("demux", workers.pump), ("transmitter", workers.transmitter)] {
            if handle.join().is_err() {
                warn!(role, "virtual channel worker panicked");
            }
        }
        let mut state = self.demux.lock();
        state.running = false;
        for (_, ticket) in state.waiting.drain() {
            ticket.fail("virtual channel demux stopped");
        }
        state.queues.clear();
    }
}
