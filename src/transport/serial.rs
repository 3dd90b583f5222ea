//! The serial connection to the controller MCU.

use super::{Frame, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of consecutive writes the driver may accept zero bytes (or time
/// out) before a frame is given up and the transport is degraded.
pub const MAX_STALLED_WRITES: usize = 8;

/// Driver-level write timeout for the system serial port.
const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// Port parameters handed to the settings layer for save/restore.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportParams {
    pub port: String,
    pub baud: u32,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud: 9600,
        }
    }
}

fn default_port() -> &'static str {
    if cfg!(windows) {
        "COM3"
    } else {
        "/dev/ttyUSB0"
    }
}

/// Byte sink of an open port.
pub type SerialLink = Box<dyn Write + Send>;

/// Produces the byte sink for a port. The system implementation talks to
/// the OS driver; tests hand out in-memory links.
pub trait PortOpener: Send + Sync {
    fn open(&self, params: &TransportParams) -> Result<SerialLink, TransportError>;

    /// Openers reaching the same devices share a namespace. At most one
    /// transport per namespace holds a live handle at a time.
    fn namespace(&self) -> String {
        SYSTEM_NAMESPACE.to_string()
    }
}

const SYSTEM_NAMESPACE: &str = "system";

/// Port held in each namespace by the live handle there.
static LIVE_HANDLES: Mutex<BTreeMap<String, String>> = Mutex::new(BTreeMap::new());

/// Claim on a namespace, released when dropped.
struct LiveHandle {
    namespace: String,
}

impl LiveHandle {
    fn claim(namespace: String, port: &str) -> Result<Self, TransportError> {
        let mut live = LIVE_HANDLES.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(held) = live.get(&namespace) {
            warn!("Port {} is already open in this process", held);
            return Err(TransportError::PortBusy { port: held.clone() });
        }
        live.insert(namespace.clone(), port.to_string());
        Ok(Self { namespace })
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        LIVE_HANDLES
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.namespace);
    }
}

/// Opens real serial devices through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

struct SystemLink(Box<dyn serialport::SerialPort>);

impl Write for SystemLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl PortOpener for SystemPortOpener {
    fn open(&self, params: &TransportParams) -> Result<SerialLink, TransportError> {
        match serialport::new(&params.port, params.baud)
            .timeout(WRITE_TIMEOUT)
            .open()
        {
            Ok(port) => Ok(Box::new(SystemLink(port))),
            Err(e) => match e.kind() {
                serialport::ErrorKind::NoDevice
                | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                    Err(TransportError::DeviceNotFound {
                        port: params.port.clone(),
                    })
                }
                _ => Err(TransportError::Io(io::Error::other(e.to_string()))),
            },
        }
    }
}

/// Lists the serial port names the OS currently reports.
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| TransportError::Io(io::Error::other(e.to_string())))
}

struct TransportHandle {
    params: TransportParams,
    link: SerialLink,
    _live: LiveHandle,
}

/// Owner of the single serial connection.
///
/// Frames are written whole or not at all from the caller's point of view:
/// short writes are continued until the frame is complete, and a driver that
/// keeps refusing bytes degrades the transport, which then stays closed
/// until it is explicitly opened again.
pub struct SerialTransport {
    opener: Arc<dyn PortOpener>,
    handle: Option<TransportHandle>,
    degraded: bool,
}

impl SerialTransport {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            handle: None,
            degraded: false,
        }
    }

    /// Transport backed by the OS serial driver.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemPortOpener))
    }

    pub fn open(&mut self, port: &str, baud: u32) -> Result<(), TransportError> {
        if let Some(handle) = &self.handle {
            warn!("Port {} is already open", handle.params.port);
            return Err(TransportError::PortBusy {
                port: handle.params.port.clone(),
            });
        }

        let params = TransportParams {
            port: port.to_string(),
            baud,
        };
        let live = LiveHandle::claim(self.opener.namespace(), port)?;
        let link = self.opener.open(&params)?;
        info!("COM Port {} connected successfully ({} baud)", port, baud);

        self.handle = Some(TransportHandle {
            params,
            link,
            _live: live,
        });
        self.degraded = false;
        Ok(())
    }

    /// Closes the port. Closing a closed transport does nothing.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.link.flush() {
                warn!("Flush on close of {} failed: {}", handle.params.port, e);
            }
            info!("Serial port {} disconnected", handle.params.port);
        }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(TransportError::Closed);
        };

        match write_whole(&mut handle.link, frame.as_bytes()) {
            Ok(()) => {
                debug!("{} <- {:?}", handle.params.port, frame);
                Ok(())
            }
            Err(e) => {
                self.degrade(&e);
                Err(TransportError::Io(e))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether the last close was caused by a failed write.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn params(&self) -> Option<&TransportParams> {
        self.handle.as_ref().map(|h| &h.params)
    }

    fn degrade(&mut self, cause: &io::Error) {
        if let Some(handle) = self.handle.take() {
            warn!(
                "Serial port {} degraded and closed after write failure: {}",
                handle.params.port, cause
            );
        }
        self.degraded = true;
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_whole(link: &mut SerialLink, bytes: &[u8]) -> io::Result<()> {
    let mut written = 0;
    let mut stalled = 0;

    while written < bytes.len() {
        match link.write(&bytes[written..]) {
            Ok(0) => stalled += 1,
            Ok(n) => {
                written += n;
                stalled = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                stalled += 1
            }
            Err(e) => return Err(e),
        }

        if stalled >= MAX_STALLED_WRITES {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("driver accepted {} of {} bytes", written, bytes.len()),
            ));
        }
    }

    link.flush()
}
