//! In-memory serial port for tests and dry runs.
//!
//! Records every byte the transport writes and can be configured to behave
//! like a slow or misbehaving driver.
//!
//! ```rust,ignore
//! let port = MemoryPort::new().with_chunk(3);
//! let mut transport = SerialTransport::new(port.opener());
//! transport.open("mem", 9600)?;
//! transport.write_frame(&Frame::line("end"))?;
//! assert_eq!(port.lines(), vec!["end"]);
//! ```

use super::{PortOpener, SerialLink, TransportError, TransportParams};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct MemoryState {
    bytes: Vec<u8>,
    write_calls: usize,
    opened: Vec<TransportParams>,
    chunk: usize,
    write_delay: Duration,
    budget: Option<usize>,
    present: bool,
}

/// Shared handle to an in-memory port; clones observe the same state.
#[derive(Debug, Clone)]
pub struct MemoryPort {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryPort {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPort {
    pub fn new() -> Self {
        Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(MemoryState {
                bytes: Vec::new(),
                write_calls: 0,
                opened: Vec::new(),
                chunk: usize::MAX,
                write_delay: Duration::ZERO,
                budget: None,
                present: true,
            })),
        }
    }

    /// Accept at most `chunk` bytes per write call.
    pub fn with_chunk(self, chunk: usize) -> Self {
        self.lock().chunk = chunk.max(1);
        self
    }

    /// Sleep this long inside every write call.
    pub fn with_write_delay(self, delay: Duration) -> Self {
        self.lock().write_delay = delay;
        self
    }

    /// Accept `budget` bytes in total, then stall (accept nothing).
    pub fn with_budget(self, budget: usize) -> Self {
        self.lock().budget = Some(budget);
        self
    }

    /// Pretend the device is unplugged.
    pub fn unplugged(self) -> Self {
        self.lock().present = false;
        self
    }

    pub fn opener(&self) -> Arc<dyn PortOpener> {
        Arc::new(self.clone())
    }

    /// Everything written so far.
    pub fn bytes(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Written bytes split into `\r\n` terminated lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.lock().bytes)
            .split_terminator("\r\n")
            .map(str::to_string)
            .collect()
    }

    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    /// Parameters of every successful open, in order.
    pub fn opened(&self) -> Vec<TransportParams> {
        self.lock().opened.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PortOpener for MemoryPort {
    fn open(&self, params: &TransportParams) -> Result<SerialLink, TransportError> {
        let mut state = self.lock();
        if !state.present {
            return Err(TransportError::DeviceNotFound {
                port: params.port.clone(),
            });
        }
        state.opened.push(params.clone());
        Ok(Box::new(MemoryLink { port: self.clone() }))
    }

    /// Each port (and its clones) is a device namespace of its own.
    fn namespace(&self) -> String {
        format!("memory-{}", self.id)
    }
}

struct MemoryLink {
    port: MemoryPort,
}

impl Write for MemoryLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let delay = self.port.lock().write_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.port.lock();
        state.write_calls += 1;
        let mut n = buf.len().min(state.chunk);
        if let Some(budget) = state.budget.as_mut() {
            n = n.min(*budget);
            *budget -= n;
        }
        state.bytes.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
