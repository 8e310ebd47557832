use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use instrlink_transport::{
    default_stream_port, LinkStream, Target, TcpStreamListener, TransportError,
};
use tracing::{debug, info, warn};

use super::{DmaEngine, Movers};
use crate::error::{KitError, Result};
use crate::resource::{Direction, TransferTicket};

const MOVE_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct Link {
    listener: Option<TcpStreamListener>,
    stream: Option<LinkStream>,
}

struct Shared {
    link: Mutex<Link>,
    open: AtomicBool,
    // Transfers in one direction share the one connection; these keep them
    // from interleaving.
    rx: Mutex<()>,
    tx: Mutex<()>,
    poll: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    /// A handle on the device connection, accepting it first if needed.
    /// `Ok(None)` means the transfer was cancelled or the engine closed
    /// while waiting for the device.
    fn connection(&self, ticket: &TransferTicket) -> Result<Option<LinkStream>> {
        let mut link = lock(&self.link);
        if link.stream.is_none() {
            let Some(listener) = link.listener.as_ref() else {
                return Err(TransportError::Shutdown.into());
            };
            let accepted = listener.accept_until(self.poll, || {
                !ticket.is_aborted() && self.open.load(Ordering::SeqCst)
            })?;
            let Some(mut stream) = accepted else {
                return Ok(None);
            };
            stream.set_read_timeout(Some(self.poll))?;
            stream.set_write_timeout(Some(self.poll))?;
            link.stream = Some(stream);
        }
        match link.stream.as_ref() {
            Some(stream) => Ok(Some(stream.try_clone()?)),
            None => Ok(None),
        }
    }

    fn drop_connection(&self) {
        if let Some(stream) = lock(&self.link).stream.take() {
            let _ = stream.shutdown();
        }
    }

    fn run(&self, ticket: TransferTicket) {
        let outcome = match self.connection(&ticket) {
            Ok(Some(stream)) => match ticket.direction() {
                Direction::Recv => self.receive(stream, &ticket),
                Direction::Send => self.send(stream, &ticket),
            },
            Ok(None) => return,
            Err(err) => Err(err.to_string()),
        };
        match outcome {
            Ok(Some(moved)) => {
                ticket.complete(moved);
            }
            Ok(None) => debug!(id = %ticket.id(), "tcp transfer abandoned"),
            Err(reason) => {
                warn!(id = %ticket.id(), %reason, "tcp transfer failed");
                ticket.fail(reason);
            }
        }
    }

    /// `Ok(None)` when the transfer was cancelled part way.
    fn receive(
        &self,
        mut stream: LinkStream,
        ticket: &TransferTicket,
    ) -> std::result::Result<Option<usize>, String> {
        let _rx = lock(&self.rx);
        let length = ticket.length();
        let mut chunk = vec![0u8; length.min(MOVE_CHUNK)];
        let mut filled = 0;
        while filled < length {
            if ticket.is_aborted() {
                return Ok(None);
            }
            let want = (length - filled).min(chunk.len());
            match stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.drop_connection();
                    return Err("device closed the stream connection".into());
                }
                Ok(n) => {
                    ticket.write_at(filled, &chunk[..n]);
                    filled += n;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    self.drop_connection();
                    return Err(err.to_string());
                }
            }
        }
        Ok(Some(filled))
    }

    fn send(
        &self,
        mut stream: LinkStream,
        ticket: &TransferTicket,
    ) -> std::result::Result<Option<usize>, String> {
        let _tx = lock(&self.tx);
        let payload = ticket.payload();
        let mut sent = 0;
        while sent < payload.len() {
            if ticket.is_aborted() {
                return Ok(None);
            }
            let end = (sent + MOVE_CHUNK).min(payload.len());
            match stream.write(&payload[sent..end]) {
                Ok(0) => {
                    self.drop_connection();
                    return Err("device stopped accepting stream data".into());
                }
                Ok(n) => sent += n,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    self.drop_connection();
                    return Err(err.to_string());
                }
            }
        }
        Ok(Some(sent))
    }
}

/// Stream engine over the TCP stream port.
///
/// The host listens and the device dials in; the connection is accepted by
/// the first transfer that needs it. Channel numbers are not carried on the
/// wire: every transfer uses the one connection.
pub struct TcpEngine {
    shared: Arc<Shared>,
    movers: Movers,
}

impl TcpEngine {
    pub fn new(poll: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                link: Mutex::new(Link::default()),
                open: AtomicBool::new(false),
                rx: Mutex::new(()),
                tx: Mutex::new(()),
                poll,
            }),
            movers: Movers::new(),
        }
    }

    /// Port the listener is bound to, once open.
    pub fn local_port(&self) -> Option<u16> {
        lock(&self.shared.link)
            .listener
            .as_ref()
            .map(|listener| listener.local_addr().port())
    }
}

impl DmaEngine for TcpEngine {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn open(&self, target: &Target) -> Result<()> {
        let Target::Tcp { host, port } = target else {
            return Err(KitError::Config(format!(
                "tcp stream interface cannot open {target}"
            )));
        };
        let port = if *port == 0 {
            default_stream_port(host)
        } else {
            *port
        };
        let listener = TcpStreamListener::bind(port)?;
        let mut link = lock(&self.shared.link);
        link.listener = Some(listener);
        self.shared.open.store(true, Ordering::SeqCst);
        info!(host, port, "tcp stream waiting for device");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.open.store(false, Ordering::SeqCst);
        if let Some(stream) = lock(&self.shared.link).stream.as_ref() {
            // Wakes movers blocked in a read.
            let _ = stream.shutdown();
        }
        self.movers.join_all();
        let mut link = lock(&self.shared.link);
        link.stream = None;
        link.listener = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn submit(&self, ticket: TransferTicket) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let name = format!("instrlink-tcp-{}", ticket.id());
        self.movers.spawn(name, move || shared.run(ticket))
    }
}

impl Drop for TcpEngine {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
