//! Connection manager and command channel
//!
//! One live TCP session to the board at a time. The protocol is
//! half-duplex with no request identifiers, so there is exactly one
//! outstanding exchange ever; callers share the connection through
//! `SharedConnection` (an async mutex) and hold the lock for the whole
//! duration of multi-command sequences such as uploads and listings.
//!
//! Any socket error, timeout, or malformed reply destroys the session.
//! Reconnection is driven by the ping-interval timer, never retried
//! faster than that.

use crate::error::{ConnectError, ProtocolError, Timeout};
use crate::events::{emit, EventSender, SyncEvent};
use crate::protocol::{self, timeouts, Command, PrinterInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Where and how to reach the board. Immutable per session; configuration
/// changes replace the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterEndpoint {
    pub host: String,
    pub port: u16,
    pub ping_interval: Duration,
    pub chunk_delay: Duration,
}

impl PrinterEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// One live socket with exclusive ownership of its buffers.
pub struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    /// Connect and handshake. The handshake doubles as the liveness ping
    /// and yields the printer's identity.
    pub async fn open(endpoint: &PrinterEndpoint) -> Result<(Session, PrinterInfo), ConnectError> {
        let addr = endpoint.addr();
        let limit = Duration::from_millis(timeouts::CONNECT_MS);
        let stream = match timeout(limit, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => return Err(ConnectError::Unreachable { addr, source }),
            Err(_) => return Err(ConnectError::Timeout { addr, limit }),
        };
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        let mut session = Session {
            reader: BufReader::new(r),
            writer: w,
        };
        let line = session
            .exchange(&Command::Handshake)
            .await
            .map_err(ConnectError::Handshake)?;
        let info = protocol::parse_handshake(&line).ok_or_else(|| {
            ConnectError::Handshake(ProtocolError::Malformed {
                cmd: Command::Handshake.encode(),
                line,
            })
        })?;
        Ok((session, info))
    }

    /// Send one command line (newline appended).
    pub async fn send_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        trace!(">> {line}");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Send raw bytes (chunk frames).
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Read one reply line within a bounded wait. The line protocol has no
    /// framing recovery, so EOF and timeout are both session-fatal.
    pub async fn read_line(
        &mut self,
        ms: u64,
        context: &'static str,
    ) -> Result<String, ProtocolError> {
        let limit = Duration::from_millis(ms);
        let mut line = String::new();
        match timeout(limit, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(ProtocolError::Closed),
            Ok(Ok(_)) => {
                let line = line.trim_end().to_string();
                trace!("<< {line}");
                Ok(line)
            }
            Ok(Err(e)) => Err(ProtocolError::Io(e)),
            Err(_) => Err(ProtocolError::Timeout(Timeout { context, limit })),
        }
    }

    /// One strict request/response exchange. Commands that are confirmed
    /// with an extra `ok` line have it drained here so the next exchange
    /// starts clean.
    pub async fn exchange(&mut self, cmd: &Command) -> Result<String, ProtocolError> {
        self.send_line(&cmd.encode()).await?;
        let reply = self.read_line(timeouts::COMMAND_MS, "command reply").await?;
        if cmd.has_trailing_ok() {
            self.read_line(timeouts::COMMAND_MS, "trailing ok").await?;
        }
        Ok(reply)
    }
}

/// Connection state machine: `Disconnected -> Connecting -> Connected`,
/// back to `Disconnected` on any I/O failure.
pub struct Connection {
    endpoint: PrinterEndpoint,
    state: ConnState,
    session: Option<Session>,
    info: Option<PrinterInfo>,
    events: EventSender,
}

impl Connection {
    pub fn new(endpoint: PrinterEndpoint, events: EventSender) -> Self {
        Self {
            endpoint,
            state: ConnState::Disconnected,
            session: None,
            info: None,
            events,
        }
    }

    pub fn endpoint(&self) -> &PrinterEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Identity from the most recent successful handshake.
    pub fn printer_info(&self) -> Option<&PrinterInfo> {
        self.info.as_ref()
    }

    /// Return the live session, connecting first if there is none.
    pub async fn ensure_connected(&mut self) -> Result<&mut Session, ConnectError> {
        match self.session {
            Some(ref mut session) => Ok(session),
            None => {
                self.set_state(ConnState::Connecting);
                match Session::open(&self.endpoint).await {
                    Ok((session, info)) => {
                        debug!(
                            "connected to {} ({} fw {})",
                            self.endpoint.addr(),
                            info.name,
                            info.version
                        );
                        emit(&self.events, SyncEvent::PrinterIdentified(info.clone()));
                        self.info = Some(info);
                        self.set_state(ConnState::Connected);
                        Ok(self.session.insert(session))
                    }
                    Err(e) => {
                        self.set_state(ConnState::Disconnected);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Drop the session and return to `Disconnected`. Called on every
    /// socket/protocol failure and on explicit reconfiguration.
    pub fn teardown(&mut self, why: &str) {
        if self.session.take().is_some() {
            warn!("session to {} torn down: {why}", self.endpoint.addr());
        }
        self.set_state(ConnState::Disconnected);
    }

    fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            self.state = state;
            emit(&self.events, SyncEvent::Connection(state));
        }
    }
}

/// The single mutual-exclusion gate around "issue command, await response".
/// Every protocol caller goes through this; nothing else touches the socket.
pub type SharedConnection = Arc<tokio::sync::Mutex<Connection>>;

pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(tokio::sync::Mutex::new(conn))
}
