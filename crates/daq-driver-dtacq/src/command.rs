//! Control channel: line-oriented command/response over TCP.
//!
//! A command is written as one `\n`-terminated line. The device answers with
//! free text followed by its prompt, which always ends in `>`. The response
//! handed back to the caller is everything before the prompt line:
//!
//! ```text
//! wire:     "4\nacq1001_123 >"
//! returned: "4"
//! ```
//!
//! The device only emits prompts after `prompt on` has been sent on the
//! connection, so [`CommandChannel::connect`] callers must send it before
//! anything else.

use async_trait::async_trait;
use dtacq_core::error::{AcqError, Result};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Last byte of every device prompt.
pub const PROMPT: u8 = b'>';

/// Command that makes the device terminate responses with its prompt.
pub const PROMPT_ON: &str = "prompt on";

// =============================================================================
// Command Abstraction
// =============================================================================

/// Request/response operations on a control channel (allows mock injection).
#[async_trait]
pub trait CommandOps: Send + Sync {
    /// Send `command` and return the response text without the prompt.
    async fn send(&self, command: &str) -> Result<String>;

    /// Send `command` and parse the response as an unsigned integer.
    async fn query_u64(&self, command: &str) -> Result<u64> {
        let response = self.send(command).await?;
        parse_unsigned(&response)
            .ok_or_else(|| AcqError::protocol(command, response, "expected an unsigned integer"))
    }
}

/// Parse a numeric response, ignoring surrounding whitespace.
pub fn parse_unsigned(response: &str) -> Option<u64> {
    response.trim().parse::<u64>().ok()
}

/// Strip the prompt line from a raw response ending in [`PROMPT`].
///
/// Everything after the last line terminator is the prompt. A response with
/// no line terminator consists of the prompt alone and yields an empty string.
pub fn strip_prompt(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let body = text.strip_suffix(PROMPT as char).unwrap_or(text.as_ref());
    match body.rfind('\n') {
        Some(end) => body[..end].trim_end_matches('\r').to_string(),
        None => String::new(),
    }
}

// =============================================================================
// TCP Command Channel
// =============================================================================

/// Control connection to a digitizer.
pub struct CommandChannel {
    stream: Mutex<BufReader<TcpStream>>,
    peer: SocketAddr,
    timeout: Duration,
}

impl CommandChannel {
    /// Resolve `host` and connect to its control port.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = format!("{}:{}", host, port);
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AcqError::Connection {
                endpoint: endpoint.clone(),
                source: std::io::Error::from(std::io::ErrorKind::TimedOut),
            })?
            .map_err(|source| AcqError::Connection {
                endpoint: endpoint.clone(),
                source,
            })?;

        // Commands are tiny; don't let Nagle hold them back
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        info!(%peer, "Connected to digitizer control channel");

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            peer,
            timeout: command_timeout,
        })
    }

    /// Address of the connected device.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Set the per-command response timeout.
    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    /// Write one command line and read through the next prompt.
    pub async fn send(&self, command: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;

        let line = format!("{}\n", command);
        debug!(command, "Control write");

        let written = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(command, error = %e, "Control write failed");
            return Err(AcqError::channel_closed(command, e));
        }

        let mut raw = Vec::new();
        let read = timeout(self.timeout, stream.read_until(PROMPT, &mut raw)).await;
        match read {
            Err(_) => {
                return Err(AcqError::Timeout {
                    command: command.to_string(),
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) => {
                warn!(command, error = %e, "Control read failed");
                return Err(AcqError::channel_closed(command, e));
            }
            // EOF before the prompt arrived
            Ok(Ok(_)) if raw.last() != Some(&PROMPT) => {
                return Err(AcqError::channel_closed(
                    command,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "no prompt before end of stream"),
                ))
            }
            Ok(Ok(_)) => {}
        }

        let response = strip_prompt(&raw);
        debug!(command, response = response.as_str(), "Control response");
        Ok(response)
    }

    /// Shut down the write half; the device closes its side in turn.
    pub async fn close(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream.get_mut().shutdown().await?;
        debug!(peer = %self.peer, "Control channel closed");
        Ok(())
    }
}

#[async_trait]
impl CommandOps for CommandChannel {
    async fn send(&self, command: &str) -> Result<String> {
        self.send(command).await
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("peer", &self.peer)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// =============================================================================
// Mock Command Channel
// =============================================================================

/// Scripted control channel for testing without hardware.
///
/// Responses are looked up per command; a command may also have a queue of
/// one-shot responses consumed in order before falling back to the fixed one.
#[derive(Debug, Default)]
pub struct MockCommandChannel {
    fixed: SyncMutex<HashMap<String, String>>,
    scripted: SyncMutex<HashMap<String, VecDeque<String>>>,
    fallback: SyncMutex<Option<String>>,
    log: SyncMutex<Vec<String>>,
}

impl MockCommandChannel {
    /// Create a mock that knows no commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `command` with `response`.
    pub fn with_response(self, command: &str, response: &str) -> Self {
        self.fixed
            .lock()
            .insert(command.to_string(), response.to_string());
        self
    }

    /// Answer the next call of `command` with `response` (queued in order).
    pub fn with_next_response(self, command: &str, response: &str) -> Self {
        self.scripted
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(response.to_string());
        self
    }

    /// Answer unknown commands with `response` instead of closing the channel.
    pub fn with_fallback(self, response: &str) -> Self {
        *self.fallback.lock() = Some(response.to_string());
        self
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl CommandOps for MockCommandChannel {
    async fn send(&self, command: &str) -> Result<String> {
        debug!("Mock control write: {}", command);
        self.log.lock().push(command.to_string());

        if let Some(response) = self
            .scripted
            .lock()
            .get_mut(command)
            .and_then(VecDeque::pop_front)
        {
            return Ok(response);
        }
        if let Some(response) = self.fixed.lock().get(command) {
            return Ok(response.clone());
        }
        match self.fallback.lock().as_ref() {
            Some(response) => Ok(response.clone()),
            None => Err(AcqError::channel_closed(
                command,
                io::Error::new(io::ErrorKind::NotConnected, "no scripted response"),
            )),
        }
    }
}
