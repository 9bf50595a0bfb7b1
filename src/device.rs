//! ==============================================================================
//! device.rs - serial device reader
//! ==============================================================================
//!
//! purpose:
//!     owns the single serial connection to the locally attached board and turns
//!     its byte stream into parsed lines for the ingest task.
//!
//! state machine:
//!
//! ```text
//!         ┌──────────────┐   open ok    ┌─────────────┐
//!         │ Disconnected │ ───────────► │  Streaming  │ ◄─┐ bytes / idle poll
//!         └──────────────┘ ◄─────────── └─────────────┘ ──┘
//!            │      ▲        io error       (close, wait reconnect_delay)
//!            └──────┘
//!       no device: wait rescan_delay
//!       open failed: wait reconnect_delay
//!
//!     the retry policy is a fixed interval, not exponential. every failure is
//!     logged and turned into a retry; nothing escapes the loop. the loop only
//!     ends when the ingest side hangs up (process shutdown).
//! ```
//!
//! relationships:
//!     - uses: parser.rs (one call per line)
//!     - feeds: gateway.rs (`run_local_ingest`) through a bounded channel
//!     - uses: serialport (real link), any `DeviceLink` in tests
//!
//! ==============================================================================

use chrono::Utc;
use serde::Serialize;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::config::DeviceConfig;
use crate::parser::{self, ParsedLine};

/// a line with no newline after this many bytes is garbage
const MAX_LINE_BYTES: usize = 4096;
const READ_CHUNK: usize = 256;
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderState {
    Disconnected,
    Streaming,
}

// ==============================================================================
// link abstraction
// ==============================================================================

/// how the reader reaches a device; the serial implementation is `SerialLink`
pub trait DeviceLink: Send + 'static {
    /// path of the device to open, `None` if nothing is attached
    fn locate(&mut self) -> Option<String>;

    fn open(&mut self, path: &str, baud_rate: u32) -> io::Result<Box<dyn Read + Send>>;
}

/// what auto-discovery knows about one port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub vid: Option<u16>,
    /// product + manufacturer strings, when the OS reports them
    pub description: String,
}

// arduino (two ids), ch340, cp210x, ftdi
const KNOWN_VIDS: [u16; 5] = [0x2341, 0x2a03, 0x1a86, 0x10c4, 0x0403];
const KNOWN_SIGNATURES: [&str; 7] =
    ["arduino", "ch340", "cp210", "ftdi", "usb serial", "ttyacm", "ttyusb"];

/// prefers ports that look like a microcontroller board, else the first port
pub fn pick_port(candidates: &[PortCandidate]) -> Option<String> {
    let matches_signature = |c: &PortCandidate| {
        if c.vid.is_some_and(|vid| KNOWN_VIDS.contains(&vid)) {
            return true;
        }
        let haystack = format!("{} {}", c.name, c.description).to_lowercase();
        KNOWN_SIGNATURES.iter().any(|sig| haystack.contains(sig))
    };

    candidates
        .iter()
        .find(|c| matches_signature(c))
        .or_else(|| candidates.first())
        .map(|c| c.name.clone())
}

/// real serial link; `path` pins the device, `None` auto-detects on every scan
#[derive(Debug, Clone, Default)]
pub struct SerialLink {
    path: Option<String>,
}

impl SerialLink {
    pub fn new(path: Option<String>) -> Self {
        Self { path }
    }

    fn candidates() -> Vec<PortCandidate> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                tracing::warn!(error = %e, "could not enumerate serial ports");
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(info) => PortCandidate {
                    name: port.port_name,
                    vid: Some(info.vid),
                    description: [info.product, info.manufacturer]
                        .into_iter()
                        .flatten()
                        .collect::<Vec<_>>()
                        .join(" "),
                },
                _ => PortCandidate { name: port.port_name, ..Default::default() },
            })
            .collect()
    }
}

impl DeviceLink for SerialLink {
    fn locate(&mut self) -> Option<String> {
        match &self.path {
            Some(path) => Some(path.clone()),
            None => pick_port(&Self::candidates()),
        }
    }

    fn open(&mut self, path: &str, baud_rate: u32) -> io::Result<Box<dyn Read + Send>> {
        let port = serialport::new(path, baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(port))
    }
}

// ==============================================================================
// reader
// ==============================================================================

#[derive(Debug, Clone)]
pub struct ReaderTiming {
    /// wait after an open failure or a dropped connection
    pub reconnect_delay: Duration,
    /// wait after a scan that found no device
    pub rescan_delay: Duration,
    /// nap when a read returns no bytes
    pub idle_poll: Duration,
}

impl From<&DeviceConfig> for ReaderTiming {
    fn from(cfg: &DeviceConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(cfg.reconnect_delay_ms),
            rescan_delay: Duration::from_millis(cfg.rescan_delay_ms),
            idle_poll: Duration::from_millis(cfg.idle_poll_ms),
        }
    }
}

/// why the streaming phase ended
enum StreamEnd {
    DeviceLost,
    SinkClosed,
}

pub struct DeviceReader<L: DeviceLink> {
    link: L,
    baud_rate: u32,
    timing: ReaderTiming,
    lines: mpsc::Sender<ParsedLine>,
    state: watch::Sender<ReaderState>,
}

impl<L: DeviceLink> DeviceReader<L> {
    pub fn new(
        link: L,
        baud_rate: u32,
        timing: ReaderTiming,
        lines: mpsc::Sender<ParsedLine>,
    ) -> (Self, watch::Receiver<ReaderState>) {
        let (state, state_rx) = watch::channel(ReaderState::Disconnected);
        (Self { link, baud_rate, timing, lines, state }, state_rx)
    }

    /// starts the loop on a dedicated os thread (serial reads block)
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("device-reader".into())
            .spawn(move || self.run())
    }

    /// the reader loop; returns only once the line channel is closed
    pub fn run(mut self) {
        loop {
            if self.lines.is_closed() {
                break;
            }

            let Some(path) = self.link.locate() else {
                tracing::debug!(wait = ?self.timing.rescan_delay, "no serial device found");
                thread::sleep(self.timing.rescan_delay);
                continue;
            };

            let port = match self.link.open(&path, self.baud_rate) {
                Ok(port) => port,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to open serial device");
                    thread::sleep(self.timing.reconnect_delay);
                    continue;
                }
            };

            tracing::info!(path = %path, baud = self.baud_rate, "serial device connected");
            self.state.send_replace(ReaderState::Streaming);

            let end = self.stream(port);
            self.state.send_replace(ReaderState::Disconnected);

            match end {
                StreamEnd::SinkClosed => break,
                StreamEnd::DeviceLost => thread::sleep(self.timing.reconnect_delay),
            }
        }
        tracing::info!("device reader stopped");
    }

    fn stream(&mut self, mut port: Box<dyn Read + Send>) -> StreamEnd {
        let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let idle = match port.read(&mut chunk) {
                Ok(0) => true,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if !self.drain_lines(&mut buffer) {
                        return StreamEnd::SinkClosed;
                    }
                    false
                }
                // serial timeouts are just "nothing yet"
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => false,
                Err(e) => {
                    tracing::warn!(error = %e, "serial device lost");
                    return StreamEnd::DeviceLost;
                }
            };

            if idle {
                if self.lines.is_closed() {
                    return StreamEnd::SinkClosed;
                }
                thread::sleep(self.timing.idle_poll);
            }
        }
    }

    /// forwards every complete line in `buffer`; false once nobody is listening
    fn drain_lines(&self, buffer: &mut Vec<u8>) -> bool {
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);

            let parsed = parser::parse_line(&text, Utc::now());
            if parsed == ParsedLine::Empty {
                continue;
            }
            if self.lines.blocking_send(parsed).is_err() {
                return false;
            }
        }

        if buffer.len() > MAX_LINE_BYTES {
            tracing::debug!(bytes = buffer.len(), "discarding oversized partial line");
            buffer.clear();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, description: &str) -> PortCandidate {
        PortCandidate { name: name.into(), vid: Some(vid), description: description.into() }
    }

    fn plain(name: &str) -> PortCandidate {
        PortCandidate { name: name.into(), ..Default::default() }
    }

    #[test]
    fn prefers_known_vendor() {
        let ports = [plain("/dev/ttyS0"), usb("/dev/ttyACM0", 0x2341, "Arduino Uno")];
        assert_eq!(pick_port(&ports).as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn matches_by_description_or_name() {
        let ports = [plain("/dev/ttyS0"), usb("COM5", 0x9999, "USB Serial Device")];
        assert_eq!(pick_port(&ports).as_deref(), Some("COM5"));

        let ports = [plain("/dev/ttyS0"), plain("/dev/ttyUSB0")];
        assert_eq!(pick_port(&ports).as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn falls_back_to_first_then_none() {
        assert_eq!(pick_port(&[plain("/dev/ttyS1"), plain("/dev/ttyS2")]).as_deref(), Some("/dev/ttyS1"));
        assert_eq!(pick_port(&[]), None);
    }

    #[test]
    fn pinned_serial_link_does_not_scan() {
        let mut link = SerialLink::new(Some("/dev/ttyACM3".into()));
        assert_eq!(link.locate().as_deref(), Some("/dev/ttyACM3"));
    }

    struct OneShot(Option<Vec<u8>>);

    impl DeviceLink for OneShot {
        fn locate(&mut self) -> Option<String> {
            Some("mock".into())
        }

        fn open(&mut self, _: &str, _: u32) -> io::Result<Box<dyn Read + Send>> {
            match self.0.take() {
                Some(bytes) => Ok(Box::new(io::Cursor::new(bytes))),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "unplugged")),
            }
        }
    }

    fn fast() -> ReaderTiming {
        ReaderTiming {
            reconnect_delay: Duration::from_millis(5),
            rescan_delay: Duration::from_millis(5),
            idle_poll: Duration::from_millis(1),
        }
    }

    #[test]
    fn splits_lines_across_crlf_and_skips_blanks() {
        let bytes = b"22.5,45.0\r\n\r\nConnesso alla rete\n21.0,".to_vec();
        let (tx, mut rx) = mpsc::channel(16);
        let (reader, _state) = DeviceReader::new(OneShot(Some(bytes)), 9600, fast(), tx);
        let handle = reader.spawn().unwrap();

        let first = rx.blocking_recv().unwrap();
        assert!(matches!(first, ParsedLine::Measurement(ref m) if m.temperature == 22.5));
        let second = rx.blocking_recv().unwrap();
        assert!(matches!(second, ParsedLine::Status(_)));

        drop(rx);
        handle.join().unwrap();
    }
}
