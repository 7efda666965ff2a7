//! Serial transport for ELM327 adapters
//!
//! The adapter has no request ids: a reply belongs to whichever command was
//! written last. Every exchange therefore holds the link for the whole
//! write, settle and read cycle, and a reply ends at the `>` prompt.

use crate::config::ConnectionSettings;
use crate::error::{ObdError, ObdResult};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::{debug, error, info, warn};

/// Byte the adapter prints when it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Baud rates ELM327 clones are shipped with
pub const SUPPORTED_BAUD_RATES: [u32; 4] = [9600, 38400, 57600, 115200];

/// Settle delay used when a command does not ask for another one
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 256;
const EVENT_CAPACITY: usize = 4;

/// Byte stream an adapter can be reached over
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drop whatever the adapter sent since the last exchange
    fn discard_input(&mut self) -> io::Result<()>;
}

impl SerialLink for SerialStream {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl SerialLink for DuplexStream {
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Outbound command: ASCII text without terminator plus the settle delay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    settle: Duration,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            settle: DEFAULT_SETTLE,
        }
    }

    /// Wait `settle` after writing before reading the reply
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Command::new(text)
    }
}

/// Reply lines read up to the prompt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    lines: Vec<String>,
}

impl Response {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Split raw adapter output into lines, dropping the prompt and an echo
    /// of `command` if the adapter sent one back
    pub fn parse(raw: &[u8], command: &str) -> Self {
        let end = raw.iter().position(|&b| b == PROMPT).unwrap_or(raw.len());
        let text: String = raw[..end]
            .iter()
            .filter(|b| b.is_ascii() && **b != 0)
            .map(|&b| b as char)
            .collect();

        let mut lines: Vec<String> = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        let echo = compact(command);
        if !echo.is_empty() && lines.first().is_some_and(|first| compact(first) == echo) {
            lines.remove(0);
        }

        Self { lines }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines joined with `\n`
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Case-insensitive substring test over the whole reply
    pub fn contains(&self, token: &str) -> bool {
        let token = token.to_ascii_uppercase();
        self.lines
            .iter()
            .any(|line| line.to_ascii_uppercase().contains(&token))
    }
}

/// Uppercase with all whitespace removed
pub(crate) fn compact(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// The only asynchronous signal the core emits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link failed and has been closed
    Disconnected { port: String, reason: String },
}

/// Shared flag that makes further commands fail with [`ObdError::Cancelled`]
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Allow commands again
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum CycleError {
    Timeout,
    Io(io::Error),
}

impl From<io::Error> for CycleError {
    fn from(err: io::Error) -> Self {
        CycleError::Io(err)
    }
}

/// Exclusive, prompt-framed connection to one adapter
pub struct Transport {
    port: String,
    baud_rate: Option<u32>,
    timeout: Duration,
    link: Mutex<Option<Box<dyn SerialLink>>>,
    open: AtomicBool,
    events: broadcast::Sender<LinkEvent>,
    cancel: CancelHandle,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("port", &self.port)
            .field("baud_rate", &self.baud_rate)
            .field("timeout", &self.timeout)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Open the serial port described by `settings`
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(settings: &ConnectionSettings) -> ObdResult<Self> {
        if !SUPPORTED_BAUD_RATES.contains(&settings.baud_rate) {
            return Err(ObdError::ConnectionFailure {
                port: settings.port.clone(),
                reason: format!("unsupported baud rate {}", settings.baud_rate),
            });
        }

        let builder = tokio_serial::new(&settings.port, settings.baud_rate).timeout(settings.timeout());
        let stream = SerialStream::open(&builder).map_err(|e| ObdError::ConnectionFailure {
            port: settings.port.clone(),
            reason: e.to_string(),
        })?;
        stream
            .clear(ClearBuffer::All)
            .map_err(|e| ObdError::ConnectionFailure {
                port: settings.port.clone(),
                reason: e.to_string(),
            })?;

        info!("Opened {} at {} baud", settings.port, settings.baud_rate);

        let mut transport = Self::from_link(settings.port.clone(), stream, settings.timeout());
        transport.baud_rate = Some(settings.baud_rate);
        Ok(transport)
    }

    /// Wrap an already connected link (mock adapters, sockets, tests)
    pub fn from_link(port: impl Into<String>, link: impl SerialLink + 'static, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            port: port.into(),
            baud_rate: None,
            timeout,
            link: Mutex::new(Some(Box::new(link))),
            open: AtomicBool::new(true),
            events,
            cancel: CancelHandle::default(),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Baud rate, when the link is a serial port
    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Receive [`LinkEvent`]s; at most one per failure
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Close the link; no event is emitted for an orderly close
    pub async fn close(&self) {
        let mut guard = self.link.lock().await;
        if let Some(mut link) = guard.take() {
            if let Err(e) = link.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.port, e);
            }
            info!("Closed {}", self.port);
        }
        self.open.store(false, Ordering::SeqCst);
    }

    /// Send a command and read its reply
    pub async fn exchange(&self, command: &Command) -> ObdResult<Response> {
        self.run(command, None).await
    }

    /// Shorthand for [`exchange`](Self::exchange) with the default settle delay
    pub async fn send(&self, text: &str) -> ObdResult<Response> {
        self.exchange(&Command::new(text)).await
    }

    /// Start a streaming command (e.g. `ATMA`), let it run for `window`, stop
    /// it with a bare CR and read everything up to the prompt
    pub async fn monitor(&self, command: &Command, window: Duration) -> ObdResult<Response> {
        self.run(command, Some(window)).await
    }

    async fn run(&self, command: &Command, stop_after: Option<Duration>) -> ObdResult<Response> {
        if command.text().contains(['\r', '\n', '>']) {
            return Err(ObdError::InvalidArgument(format!(
                "command contains a terminator: {:?}",
                command.text()
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(ObdError::Cancelled);
        }

        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ObdError::NotConnected)?;

        let outcome = cycle(link, command, stop_after, self.timeout).await;
        match outcome {
            Ok(raw) => {
                let response = Response::parse(&raw, command.text());
                debug!("{:?} -> {:?}", command.text(), response.lines());
                Ok(response)
            }
            Err(CycleError::Timeout) => {
                warn!("No prompt after {:?} for {:?}", self.timeout, command.text());
                Err(ObdError::Timeout {
                    command: command.text().to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Err(CycleError::Io(e)) => {
                guard.take();
                self.open.store(false, Ordering::SeqCst);
                drop(guard);

                let reason = e.to_string();
                error!("Link {} failed during {:?}: {}", self.port, command.text(), reason);
                // no receivers is fine
                let _ = self.events.send(LinkEvent::Disconnected {
                    port: self.port.clone(),
                    reason: reason.clone(),
                });
                Err(ObdError::TransportFailure {
                    port: self.port.clone(),
                    reason,
                })
            }
        }
    }
}

async fn cycle(
    link: &mut Box<dyn SerialLink>,
    command: &Command,
    stop_after: Option<Duration>,
    timeout: Duration,
) -> Result<Vec<u8>, CycleError> {
    link.discard_input()?;

    let mut frame = Vec::with_capacity(command.text().len() + 1);
    frame.extend_from_slice(command.text().as_bytes());
    frame.push(b'\r');
    link.write_all(&frame).await?;
    link.flush().await?;

    match stop_after {
        Some(window) => {
            tokio::time::sleep(window).await;
            link.write_all(b"\r").await?;
            link.flush().await?;
        }
        None => tokio::time::sleep(command.settle()).await,
    }

    read_until_prompt(link, Instant::now() + timeout).await
}

async fn read_until_prompt(link: &mut Box<dyn SerialLink>, deadline: Instant) -> Result<Vec<u8>, CycleError> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match tokio::time::timeout_at(deadline, link.read(&mut chunk)).await {
            Err(_) => return Err(CycleError::Timeout),
            Ok(result) => result?,
        };
        if n == 0 {
            return Err(CycleError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "adapter closed the link",
            )));
        }
        raw.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&PROMPT) {
            return Ok(raw);
        }
    }
}
