//! DMA buffer and transfer bookkeeping.
//!
//! The [`ResourceManager`] owns every buffer a kit hands out and every
//! transfer descriptor opened on them. Callers hold only ids. All table
//! mutations happen under one mutex per manager; a condition variable wakes
//! waiters whenever a descriptor changes state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use instrlink_transport::TransportError;
use tracing::debug;

use crate::error::{KitError, Result};

/// Opaque buffer handle. Never reused within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Transfer descriptor id. Never reused within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer#{}", self.0)
    }
}

/// Channel a transfer is tagged with.
///
/// Logical channels are what callers name. Physical channels are what a
/// transport moves bytes on. Without channel multiplexing a logical channel
/// maps straight to the physical channel of the same number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Logical(u16),
    Physical(u16),
}

impl Channel {
    pub fn number(self) -> u16 {
        match self {
            Self::Logical(n) | Self::Physical(n) => n,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logical(n) => write!(f, "logical:{n}"),
            Self::Physical(n) => write!(f, "physical:{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::Recv => "recv",
        })
    }
}

/// Lifecycle of a transfer descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    /// Finished; carries the number of bytes moved.
    Complete(usize),
    Cancelled,
    Failed(String),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Where and how much to move for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub channel: Channel,
    pub buffer: BufferId,
    pub length: usize,
    pub offset: usize,
}

impl TransferRequest {
    pub fn new(channel: Channel, buffer: BufferId, length: usize) -> Self {
        Self {
            channel,
            buffer,
            length,
            offset: 0,
        }
    }

    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Read/write access to a reserved buffer region.
#[derive(Clone)]
pub struct BufferView {
    id: BufferId,
    memory: Arc<Mutex<Vec<u8>>>,
    length: usize,
}

impl BufferView {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Copy of the whole view.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with(<[u8]>::to_vec)
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let range = self.range(offset, len)?;
        Ok(self.with(|bytes| bytes[range].to_vec()))
    }

    /// Overwrite bytes starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let range = self.range(offset, data.len())?;
        self.with_mut(|bytes| bytes[range].copy_from_slice(data));
        Ok(())
    }

    /// Run `f` over the view's bytes.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let memory = lock(&self.memory);
        f(&memory[..self.length])
    }

    /// Run `f` over the view's bytes, mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut memory = lock(&self.memory);
        f(&mut memory[..self.length])
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.length => Ok(offset..end),
            _ => Err(KitError::Validation(format!(
                "range {offset}+{len} exceeds view of {} bytes on {}",
                self.length, self.id
            ))),
        }
    }
}

impl fmt::Debug for BufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferView")
            .field("id", &self.id)
            .field("length", &self.length)
            .finish()
    }
}

/// Snapshot of a buffer for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: BufferId,
    pub length: usize,
    pub allocated_at: SystemTime,
    pub pending: Option<TransferId>,
}

/// Snapshot of a transfer descriptor for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub id: TransferId,
    pub buffer: BufferId,
    pub channel: Channel,
    pub direction: Direction,
    pub offset: usize,
    pub length: usize,
    pub state: TransferState,
}

struct BufferEntry {
    memory: Arc<Mutex<Vec<u8>>>,
    length: usize,
    allocated_at: SystemTime,
    latest: Option<TransferId>,
}

struct TransferEntry {
    buffer: BufferId,
    channel: Channel,
    direction: Direction,
    offset: usize,
    length: usize,
    state: TransferState,
    abort: Arc<AtomicBool>,
}

#[derive(Default)]
struct Table {
    buffers: HashMap<BufferId, BufferEntry>,
    transfers: HashMap<TransferId, TransferEntry>,
    busy: HashMap<(Channel, Direction), TransferId>,
    next_buffer: u64,
    next_transfer: u64,
    used: usize,
}

impl Table {
    fn buffer(&self, id: BufferId) -> Result<&BufferEntry> {
        self.buffers
            .get(&id)
            .ok_or_else(|| KitError::Validation(format!("unknown buffer handle {id}")))
    }

    fn pending_on(&self, id: BufferId) -> Option<TransferId> {
        let latest = self.buffers.get(&id)?.latest?;
        match self.transfers.get(&latest) {
            Some(entry) if !entry.state.is_terminal() => Some(latest),
            _ => None,
        }
    }

    /// Move a pending descriptor to a terminal state. Returns false if it
    /// was already terminal (or is gone).
    fn finish(&mut self, id: TransferId, state: TransferState) -> bool {
        let Some(entry) = self.transfers.get_mut(&id) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        if matches!(state, TransferState::Cancelled) {
            entry.abort.store(true, Ordering::SeqCst);
        }
        entry.state = state;
        let key = (entry.channel, entry.direction);
        if self.busy.get(&key) == Some(&id) {
            self.busy.remove(&key);
        }
        true
    }
}

/// Buffer pool plus transfer descriptor table for one kit.
pub struct ResourceManager {
    table: Mutex<Table>,
    changed: Condvar,
    pool_bytes: usize,
}

impl ResourceManager {
    /// Create a manager that can hand out at most `pool_bytes` at once.
    pub fn new(pool_bytes: usize) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            changed: Condvar::new(),
            pool_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `length` zeroed bytes.
    pub fn alloc(&self, length: usize) -> Result<BufferId> {
        if length == 0 {
            return Err(KitError::Validation("buffer length must be non-zero".into()));
        }
        let mut table = self.lock();
        let available = self.pool_bytes - table.used;
        if length > available {
            return Err(KitError::ResourceExhausted {
                requested: length,
                available,
            });
        }
        table.next_buffer += 1;
        let id = BufferId(table.next_buffer);
        table.used += length;
        table.buffers.insert(
            id,
            BufferEntry {
                memory: Arc::new(Mutex::new(vec![0u8; length])),
                length,
                allocated_at: SystemTime::now(),
                latest: None,
            },
        );
        debug!(%id, length, "buffer allocated");
        Ok(id)
    }

    /// Release a buffer. Fails while a transfer on it is still pending.
    pub fn free(&self, id: BufferId) -> Result<()> {
        let mut table = self.lock();
        table.buffer(id)?;
        if let Some(pending) = table.pending_on(id) {
            return Err(KitError::ResourceBusy(format!(
                "{id} has pending transfer {pending}"
            )));
        }
        if let Some(entry) = table.buffers.remove(&id) {
            table.used -= entry.length;
        }
        table.transfers.retain(|_, entry| entry.buffer != id);
        debug!(%id, "buffer freed");
        Ok(())
    }

    /// View the first `length` bytes of a buffer.
    pub fn get_buffer(&self, id: BufferId, length: usize) -> Result<BufferView> {
        let table = self.lock();
        let entry = table.buffer(id)?;
        if length > entry.length {
            return Err(KitError::Validation(format!(
                "requested {length} bytes from {id} of {} bytes",
                entry.length
            )));
        }
        Ok(BufferView {
            id,
            memory: Arc::clone(&entry.memory),
            length,
        })
    }

    /// Length of a buffer.
    pub fn buffer_len(&self, id: BufferId) -> Result<usize> {
        Ok(self.lock().buffer(id)?.length)
    }

    /// Create a pending descriptor for `request`.
    ///
    /// Rejects the open if the buffer or the (channel, direction) pair
    /// already has a pending transfer; the existing descriptor is untouched.
    pub fn open_transfer(
        self: &Arc<Self>,
        request: &TransferRequest,
        direction: Direction,
    ) -> Result<TransferTicket> {
        if request.length == 0 {
            return Err(KitError::Validation("transfer length must be non-zero".into()));
        }
        let mut table = self.lock();
        let buffer_len = table.buffer(request.buffer)?.length;
        match request.offset.checked_add(request.length) {
            Some(end) if end <= buffer_len => {}
            _ => {
                return Err(KitError::Validation(format!(
                    "transfer {}+{} exceeds {} of {buffer_len} bytes",
                    request.offset, request.length, request.buffer
                )))
            }
        }
        let key = (request.channel, direction);
        if let Some(existing) = table.busy.get(&key) {
            return Err(KitError::ResourceBusy(format!(
                "{direction} on {} is busy with {existing}",
                request.channel
            )));
        }
        if let Some(existing) = table.pending_on(request.buffer) {
            return Err(KitError::ResourceBusy(format!(
                "{} is busy with {existing}",
                request.buffer
            )));
        }

        // The previous descriptor on this buffer is superseded.
        if let Some(old) = table
            .buffers
            .get(&request.buffer)
            .and_then(|entry| entry.latest)
        {
            table.transfers.remove(&old);
        }

        table.next_transfer += 1;
        let id = TransferId(table.next_transfer);
        let abort = Arc::new(AtomicBool::new(false));
        table.transfers.insert(
            id,
            TransferEntry {
                buffer: request.buffer,
                channel: request.channel,
                direction,
                offset: request.offset,
                length: request.length,
                state: TransferState::Pending,
                abort: Arc::clone(&abort),
            },
        );
        table.busy.insert(key, id);
        let memory = match table.buffers.get_mut(&request.buffer) {
            Some(entry) => {
                entry.latest = Some(id);
                Arc::clone(&entry.memory)
            }
            None => return Err(KitError::Validation(format!("unknown buffer handle {}", request.buffer))),
        };
        debug!(%id, buffer = %request.buffer, channel = %request.channel, %direction, length = request.length, "transfer opened");

        Ok(TransferTicket {
            id,
            buffer: request.buffer,
            channel: request.channel,
            direction,
            offset: request.offset,
            length: request.length,
            memory,
            abort,
            resources: Arc::clone(self),
        })
    }

    /// Cancel the pending transfer on a buffer.
    ///
    /// Returns the cancelled id, or `None` when nothing was pending (a
    /// repeated cancel is a no-op).
    pub fn cancel(&self, buffer: BufferId) -> Result<Option<TransferId>> {
        let mut table = self.lock();
        table.buffer(buffer)?;
        let Some(id) = table.pending_on(buffer) else {
            return Ok(None);
        };
        table.finish(id, TransferState::Cancelled);
        drop(table);
        self.changed.notify_all();
        debug!(%id, %buffer, "transfer cancelled");
        Ok(Some(id))
    }

    /// Cancel every pending transfer.
    pub fn cancel_all(&self) -> Vec<TransferId> {
        self.finish_all(|| TransferState::Cancelled)
    }

    /// Fail every pending transfer with `reason`.
    pub fn fail_all(&self, reason: &str) -> Vec<TransferId> {
        self.finish_all(|| TransferState::Failed(reason.to_string()))
    }

    fn finish_all(&self, state: impl Fn() -> TransferState) -> Vec<TransferId> {
        let mut table = self.lock();
        let pending: Vec<TransferId> = table
            .transfers
            .iter()
            .filter(|(_, entry)| !entry.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in &pending {
            table.finish(*id, state());
        }
        drop(table);
        if !pending.is_empty() {
            self.changed.notify_all();
        }
        pending
    }

    /// Wait for the latest transfer on `buffer` to reach a terminal state.
    ///
    /// A zero timeout polls. Elapsing the timeout leaves the transfer
    /// pending; a later wait may still observe its completion.
    pub fn wait(&self, buffer: BufferId, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now().checked_add(timeout);
        let mut table = self.lock();
        let id = table.buffer(buffer)?.latest.ok_or_else(|| {
            KitError::Validation(format!("no transfer has been opened on {buffer}"))
        })?;
        loop {
            let state = match table.transfers.get(&id) {
                Some(entry) => entry.state.clone(),
                None => {
                    return Err(KitError::Validation(format!(
                        "transfer {id} on {buffer} was retired"
                    )))
                }
            };
            match state {
                TransferState::Complete(moved) => return Ok(moved),
                TransferState::Cancelled => return Err(KitError::Cancelled(id)),
                TransferState::Failed(reason) => {
                    return Err(KitError::Transport(TransportError::Link(reason)))
                }
                TransferState::Pending => {}
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return Err(KitError::Timeout(timeout));
            }
            table = self
                .changed
                .wait_timeout(table, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Current state of a descriptor, if it still exists.
    pub fn state(&self, id: TransferId) -> Option<TransferState> {
        self.lock().transfers.get(&id).map(|entry| entry.state.clone())
    }

    /// Snapshot of all live buffers, ordered by id.
    pub fn buffers(&self) -> Vec<BufferInfo> {
        let table = self.lock();
        let mut buffers: Vec<BufferInfo> = table
            .buffers
            .iter()
            .map(|(id, entry)| BufferInfo {
                id: *id,
                length: entry.length,
                allocated_at: entry.allocated_at,
                pending: table.pending_on(*id),
            })
            .collect();
        buffers.sort_by_key(|info| info.id);
        buffers
    }

    /// Snapshot of all live descriptors, ordered by id.
    pub fn transfers(&self) -> Vec<TransferInfo> {
        let table = self.lock();
        let mut transfers: Vec<TransferInfo> = table
            .transfers
            .iter()
            .map(|(id, entry)| TransferInfo {
                id: *id,
                buffer: entry.buffer,
                channel: entry.channel,
                direction: entry.direction,
                offset: entry.offset,
                length: entry.length,
                state: entry.state.clone(),
            })
            .collect();
        transfers.sort_by_key(|info| info.id);
        transfers
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.lock().used
    }

    /// Pool size in bytes.
    pub fn capacity(&self) -> usize {
        self.pool_bytes
    }

    fn finish(&self, id: TransferId, state: TransferState) -> bool {
        let changed = self.lock().finish(id, state);
        if changed {
            self.changed.notify_all();
        }
        changed
    }
}

/// Handle a transport uses to move one transfer's bytes and report the outcome.
#[derive(Clone)]
pub struct TransferTicket {
    id: TransferId,
    buffer: BufferId,
    channel: Channel,
    direction: Direction,
    offset: usize,
    length: usize,
    memory: Arc<Mutex<Vec<u8>>>,
    abort: Arc<AtomicBool>,
    resources: Arc<ResourceManager>,
}

impl TransferTicket {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// True once the transfer has been cancelled; movers should stop.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Copy of the bytes to send.
    pub fn payload(&self) -> Vec<u8> {
        let memory = lock(&self.memory);
        memory[self.offset..self.offset + self.length].to_vec()
    }

    /// Write received bytes at the start of the transfer region.
    /// Returns how many bytes fit.
    pub fn fill(&self, data: &[u8]) -> usize {
        self.write_at(0, data)
    }

    /// Write received bytes at `pos` within the transfer region.
    /// Returns how many bytes fit.
    pub fn write_at(&self, pos: usize, data: &[u8]) -> usize {
        if pos >= self.length {
            return 0;
        }
        let n = data.len().min(self.length - pos);
        let start = self.offset + pos;
        let mut memory = lock(&self.memory);
        memory[start..start + n].copy_from_slice(&data[..n]);
        n
    }

    /// Mark the transfer complete with `moved` bytes. Returns false if it
    /// had already reached a terminal state (for example, was cancelled).
    pub fn complete(&self, moved: usize) -> bool {
        self.resources.finish(self.id, TransferState::Complete(moved))
    }

    /// Mark the transfer failed. Returns false if it was already terminal.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.resources.finish(self.id, TransferState::Failed(reason.into()))
    }
}

impl fmt::Debug for TransferTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTicket")
            .field("id", &self.id)
            .field("buffer", &self.buffer)
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

fn lock(memory: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    memory
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ResourceManager> {
        Arc::new(ResourceManager::new(1024))
    }

    fn recv(channel: u16, buffer: BufferId, length: usize) -> TransferRequest {
        TransferRequest::new(Channel::Physical(channel), buffer, length)
    }

    #[test]
    fn alloc_free_then_handle_is_invalid() {
        let rm = manager();
        let buf = rm.alloc(64).unwrap();
        rm.free(buf).unwrap();
        assert!(matches!(rm.get_buffer(buf, 1), Err(KitError::Validation(_))));
        assert!(matches!(rm.free(buf), Err(KitError::Validation(_))));
        assert_eq!(rm.used(), 0);
    }

    #[test]
    fn handles_are_never_reused() {
        let rm = manager();
        let a = rm.alloc(8).unwrap();
        rm.free(a).unwrap();
        let b = rm.alloc(8).unwrap();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn pool_exhaustion() {
        let rm = manager();
        let _a = rm.alloc(1000).unwrap();
        let err = rm.alloc(100).unwrap_err();
        assert!(matches!(
            err,
            KitError::ResourceExhausted {
                requested: 100,
                available: 24
            }
        ));
        assert!(matches!(rm.alloc(0), Err(KitError::Validation(_))));
    }

    #[test]
    fn get_buffer_length_checked() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        let view = rm.get_buffer(buf, 16).unwrap();
        view.write(12, &[1, 2, 3, 4]).unwrap();
        assert_eq!(view.read(12, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(view.write(14, &[0; 4]).is_err());
        assert!(matches!(rm.get_buffer(buf, 17), Err(KitError::Validation(_))));
    }

    #[test]
    fn free_while_pending_is_busy() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        let ticket = rm.open_transfer(&recv(0, buf, 16), Direction::Recv).unwrap();
        assert!(matches!(rm.free(buf), Err(KitError::ResourceBusy(_))));
        ticket.complete(16);
        rm.free(buf).unwrap();
    }

    #[test]
    fn second_open_on_busy_channel_rejected() {
        let rm = manager();
        let a = rm.alloc(16).unwrap();
        let b = rm.alloc(16).unwrap();
        let first = rm.open_transfer(&recv(2, a, 8), Direction::Recv).unwrap();

        let err = rm.open_transfer(&recv(2, b, 8), Direction::Recv).unwrap_err();
        assert!(matches!(err, KitError::ResourceBusy(_)));
        assert_eq!(rm.state(first.id()), Some(TransferState::Pending));

        // Same channel, other direction is a separate queue.
        rm.open_transfer(&recv(2, b, 8), Direction::Send).unwrap();

        first.fill(&[7; 8]);
        assert!(first.complete(8));
        assert_eq!(rm.wait(a, Duration::ZERO).unwrap(), 8);
        assert_eq!(rm.get_buffer(a, 8).unwrap().to_vec(), vec![7; 8]);
    }

    #[test]
    fn out_of_bounds_transfer_rejected() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        let req = recv(0, buf, 8).at_offset(12);
        assert!(matches!(
            rm.open_transfer(&req, Direction::Recv),
            Err(KitError::Validation(_))
        ));
    }

    #[test]
    fn poll_and_timeout_leave_transfer_pending() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        let ticket = rm.open_transfer(&recv(0, buf, 4), Direction::Recv).unwrap();

        assert!(matches!(rm.wait(buf, Duration::ZERO), Err(KitError::Timeout(_))));
        assert!(matches!(
            rm.wait(buf, Duration::from_millis(10)),
            Err(KitError::Timeout(_))
        ));
        assert_eq!(rm.state(ticket.id()), Some(TransferState::Pending));

        ticket.complete(4);
        assert_eq!(rm.wait(buf, Duration::from_millis(10)).unwrap(), 4);
    }

    #[test]
    fn cancel_unblocks_waiter_and_is_idempotent() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        let ticket = rm.open_transfer(&recv(0, buf, 16), Direction::Recv).unwrap();

        let waiter = {
            let rm = Arc::clone(&rm);
            std::thread::spawn(move || {
                let started = Instant::now();
                let result = rm.wait(buf, Duration::from_secs(5));
                (result, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(rm.cancel(buf).unwrap(), Some(ticket.id()));
        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(KitError::Cancelled(id)) if id == ticket.id()));
        assert!(elapsed < Duration::from_secs(1));

        assert_eq!(rm.cancel(buf).unwrap(), None);
        assert!(ticket.is_aborted());
        assert!(!ticket.complete(16), "late completion is ignored");
    }

    #[test]
    fn fail_all_reports_transport_error() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        rm.open_transfer(&recv(0, buf, 16), Direction::Recv).unwrap();
        assert_eq!(rm.fail_all("link disconnected").len(), 1);
        assert!(matches!(
            rm.wait(buf, Duration::ZERO),
            Err(KitError::Transport(TransportError::Link(_)))
        ));
    }

    #[test]
    fn new_open_supersedes_terminal_descriptor() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        let first = rm.open_transfer(&recv(0, buf, 4), Direction::Recv).unwrap();
        first.complete(4);
        let second = rm.open_transfer(&recv(0, buf, 4), Direction::Recv).unwrap();
        assert_eq!(rm.state(first.id()), None);
        assert_eq!(rm.transfers().len(), 1);
        assert_eq!(rm.transfers()[0].id, second.id());
    }

    #[test]
    fn wait_without_transfer_is_validation() {
        let rm = manager();
        let buf = rm.alloc(16).unwrap();
        assert!(matches!(rm.wait(buf, Duration::ZERO), Err(KitError::Validation(_))));
    }
}
