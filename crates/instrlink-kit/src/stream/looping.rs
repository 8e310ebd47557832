//! Repeating transfer loops.
//!
//! `stream_send` and `stream_recv` open a transfer on one buffer region,
//! wait for it, and open the next, until a [`StopSignal`] is raised, the
//! transfer is cancelled, or an error ends the loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{KitError, Result};
use crate::middleware::StreamNext;
use crate::resource::{BufferId, BufferView, Channel, Direction, TransferRequest};

/// Shared flag asking a loop to finish. Checked between waits.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whether a loop runs on the caller's thread or its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Blocking,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Longest single wait before the stop signal is checked again.
    pub poll_interval: Duration,
    /// Finish after this many transfers.
    pub max_transfers: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            max_transfers: None,
        }
    }
}

/// Why a loop finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamEnd {
    #[default]
    Stopped,
    Cancelled,
    Limit,
}

/// What a finished loop moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSummary {
    pub transfers: u64,
    pub bytes: u64,
    pub end: StreamEnd,
}

/// One completed transfer, as seen by a block hook.
pub struct Block<'a> {
    pub view: &'a BufferView,
    /// Start of the transfer region within the buffer.
    pub offset: usize,
    /// Bytes moved.
    pub len: usize,
    /// Zero-based transfer number within the loop.
    pub index: u64,
}

impl Block<'_> {
    /// Copy of the bytes moved.
    pub fn data(&self) -> Result<Vec<u8>> {
        self.view.read(self.offset, self.len)
    }
}

pub type BlockHook = Box<dyn FnMut(&Block<'_>) -> Result<()> + Send>;

/// What to loop over.
pub struct LoopSpec {
    pub channel: u16,
    pub buffer: BufferId,
    pub length: usize,
    pub offset: usize,
    pub options: StreamOptions,
    on_block: Option<BlockHook>,
}

impl LoopSpec {
    pub fn new(channel: u16, buffer: BufferId, length: usize) -> Self {
        Self {
            channel,
            buffer,
            length,
            offset: 0,
            options: StreamOptions::default(),
            on_block: None,
        }
    }

    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_transfers(mut self, count: u64) -> Self {
        self.options.max_transfers = Some(count);
        self
    }

    /// Run `hook` after each completed transfer. For sends it may refill the
    /// region before the next one goes out. An error from the hook ends the
    /// loop with that error.
    pub fn on_block(mut self, hook: impl FnMut(&Block<'_>) -> Result<()> + Send + 'static) -> Self {
        self.on_block = Some(Box::new(hook));
        self
    }

    fn request(&self) -> TransferRequest {
        TransferRequest::new(Channel::Logical(self.channel), self.buffer, self.length)
            .at_offset(self.offset)
    }
}

impl fmt::Debug for LoopSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopSpec")
            .field("channel", &self.channel)
            .field("buffer", &self.buffer)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("options", &self.options)
            .field("on_block", &self.on_block.is_some())
            .finish()
    }
}

/// Run a loop to completion on the current thread.
pub fn run_loop(
    next: &StreamNext,
    direction: Direction,
    mut spec: LoopSpec,
    stop: &StopSignal,
) -> Result<StreamSummary> {
    let request = spec.request();
    let poll = spec.options.poll_interval;
    let mut summary = StreamSummary::default();
    info!(channel = spec.channel, buffer = %spec.buffer, %direction, "stream loop started");

    loop {
        if stop.is_raised() {
            summary.end = StreamEnd::Stopped;
            break;
        }
        if spec
            .options
            .max_transfers
            .is_some_and(|max| summary.transfers >= max)
        {
            summary.end = StreamEnd::Limit;
            break;
        }

        match direction {
            Direction::Send => next.send_open(&request)?,
            Direction::Recv => next.recv_open(&request)?,
        };

        let moved = loop {
            match next.wait_dma(spec.buffer, poll) {
                Ok(moved) => break Some(moved),
                Err(KitError::Timeout(_)) if stop.is_raised() => {
                    next.break_dma(spec.buffer)?;
                    summary.end = StreamEnd::Stopped;
                    break None;
                }
                Err(KitError::Timeout(_)) => {}
                Err(KitError::Cancelled(_)) => {
                    summary.end = StreamEnd::Cancelled;
                    break None;
                }
                Err(err) => return Err(err),
            }
        };
        let Some(moved) = moved else {
            break;
        };

        if let Some(hook) = spec.on_block.as_mut() {
            let view = next
                .resources()
                .get_buffer(spec.buffer, spec.offset + spec.length)?;
            hook(&Block {
                view: &view,
                offset: spec.offset,
                len: moved,
                index: summary.transfers,
            })?;
        }
        summary.transfers += 1;
        summary.bytes += moved as u64;
    }

    debug!(
        transfers = summary.transfers,
        bytes = summary.bytes,
        end = ?summary.end,
        "stream loop finished"
    );
    Ok(summary)
}

/// A loop running on its own thread.
pub struct StreamTask {
    stop: StopSignal,
    handle: JoinHandle<Result<StreamSummary>>,
}

impl StreamTask {
    /// Start a loop on a named thread.
    pub fn spawn(
        name: String,
        next: StreamNext,
        direction: Direction,
        spec: LoopSpec,
        stop: StopSignal,
    ) -> Result<Self> {
        let loop_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(&next, direction, spec, &loop_stop))
            .map_err(instrlink_transport::TransportError::Io)?;
        Ok(Self { stop, handle })
    }

    pub fn stop(&self) {
        self.stop.raise();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop and return its outcome.
    pub fn join(self) -> Result<StreamSummary> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(KitError::Validation("stream loop panicked".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Chain;
    use crate::resource::ResourceManager;
    use crate::stream::{DmaStream, LoopbackEngine, StreamInterface};
    use std::sync::Mutex;

    fn setup() -> (Arc<DmaStream<LoopbackEngine>>, StreamNext) {
        let stream = Arc::new(DmaStream::new(
            LoopbackEngine::new(),
            Arc::new(ResourceManager::new(1 << 16)),
        ));
        stream.open(&"sim://loop".parse().unwrap()).unwrap();
        let terminal: Arc<dyn StreamInterface> = stream.clone();
        let entry = Chain::default().stream_entry(terminal);
        (stream, entry)
    }

    #[test]
    fn receive_loop_stops_at_limit_and_sees_each_block() {
        let (stream, entry) = setup();
        let buf = stream.alloc_buffer(4).unwrap();
        stream.engine().inject(0, b"aaaabbbbcccc");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let spec = LoopSpec::new(0, buf, 4)
            .max_transfers(3)
            .on_block(move |block| {
                sink.lock().unwrap().push(block.data()?);
                Ok(())
            });
        let summary = run_loop(&entry, Direction::Recv, spec, &StopSignal::new()).unwrap();

        assert_eq!(summary.transfers, 3);
        assert_eq!(summary.bytes, 12);
        assert_eq!(summary.end, StreamEnd::Limit);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()]
        );
    }

    #[test]
    fn background_loop_stops_on_signal() {
        let (stream, entry) = setup();
        let buf = stream.alloc_buffer(8).unwrap();
        let stop = StopSignal::new();
        let spec = LoopSpec::new(0, buf, 8).options(StreamOptions {
            poll_interval: Duration::from_millis(10),
            max_transfers: None,
        });
        let task =
            StreamTask::spawn("test-loop".into(), entry, Direction::Recv, spec, stop.clone())
                .unwrap();

        stream.engine().inject(0, &[1; 8]);
        std::thread::sleep(Duration::from_millis(50));
        task.stop();
        let summary = task.join().unwrap();
        assert_eq!(summary.transfers, 1);
        assert_eq!(summary.end, StreamEnd::Stopped);
        // The pending transfer was cancelled, so the buffer can go.
        stream.free_buffer(buf).unwrap();
    }

    #[test]
    fn break_ends_loop_as_cancelled() {
        let (stream, entry) = setup();
        let buf = stream.alloc_buffer(8).unwrap();
        let task = StreamTask::spawn(
            "test-loop".into(),
            entry,
            Direction::Recv,
            LoopSpec::new(0, buf, 8),
            StopSignal::new(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        stream.break_dma(buf).unwrap();
        assert_eq!(task.join().unwrap().end, StreamEnd::Cancelled);
    }

    #[test]
    fn send_loop_refills_between_blocks() {
        let (stream, entry) = setup();
        let buf = stream.alloc_buffer(4).unwrap();
        stream.get_buffer(buf, 4).unwrap().write(0, &[0; 4]).unwrap();

        let spec = LoopSpec::new(5, buf, 4).max_transfers(2).on_block(|block| {
            block.view.write(block.offset, &[(block.index + 1) as u8; 4])
        });
        let summary = run_loop(&entry, Direction::Send, spec, &StopSignal::new()).unwrap();
        assert_eq!(summary.transfers, 2);
        assert_eq!(stream.engine().pending(5), 8);
    }

    #[test]
    fn transport_failure_ends_loop_with_error() {
        let (stream, entry) = setup();
        let buf = stream.alloc_buffer(8).unwrap();
        let task = StreamTask::spawn(
            "test-loop".into(),
            entry,
            Direction::Recv,
            LoopSpec::new(0, buf, 8),
            StopSignal::new(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        stream.engine().disconnect();
        assert_eq!(task.join().unwrap_err().kind(), "transport");
    }
}
