//! Request/response channel to the power supply.
//!
//! The link owns at most one byte-stream session. The session is opened lazily by the
//! first command, and any I/O failure, timeout or closed stream tears it down so the
//! next command reconnects. Commands are serialized by an async mutex: the protocol has
//! no pipelining, so exactly one command is ever in flight.

use crate::error::{RigError, RigResult};
use crate::instrument::scpi::ScpiCommand;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Any async byte stream usable as an instrument session.
///
/// Covers `TcpStream` for real hardware and `tokio::io::DuplexStream` for the
/// simulated supply and tests.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Type-erased session stream.
pub type DynStream = Box<dyn ByteStream>;

/// Opens sessions to an instrument.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh session.
    async fn connect(&self) -> RigResult<DynStream>;

    /// Human-readable endpoint for logs and errors.
    fn target(&self) -> String;
}

/// Raw TCP (telnet port) connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    timeout: Duration,
    settle: Duration,
}

impl TcpConnector {
    /// Connector for `host:port`; `settle` is waited after each successful connect.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration, settle: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            settle,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> RigResult<DynStream> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| RigError::Connect {
                target: self.target(),
                reason: format!("no answer within {} ms", self.timeout.as_millis()),
            })?
            .map_err(|e| RigError::Connect {
                target: self.target(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(|e| RigError::Connect {
            target: self.target(),
            reason: e.to_string(),
        })?;

        // The supply drops the first bytes written immediately after accept
        tokio::time::sleep(self.settle).await;
        Ok(Box::new(stream))
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Lazily connected, strictly sequential command channel.
pub struct InstrumentLink {
    connector: Arc<dyn Connector>,
    session: Mutex<Option<BufReader<DynStream>>>,
    connected: AtomicBool,
    timeout: Duration,
    command_settle: Duration,
}

impl InstrumentLink {
    /// Create a disconnected link.
    ///
    /// `timeout` bounds each reply; `command_settle` is waited after every command
    /// that gets no reply.
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration, command_settle: Duration) -> Self {
        Self {
            connector,
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            timeout,
            command_settle,
        }
    }

    /// Whether a session is currently open. Does not wait for an in-flight command.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Endpoint description.
    pub fn target(&self) -> String {
        self.connector.target()
    }

    /// Send one command, returning the reply line for queries.
    pub async fn send(&self, command: &ScpiCommand) -> RigResult<Option<String>> {
        let mut session = self.session.lock().await;

        if session.is_none() {
            let target = self.connector.target();
            debug!(%target, "Opening instrument session");
            let stream = self.connector.connect().await.map_err(|e| {
                warn!(%target, error = %e, "Instrument connection failed");
                e
            })?;
            *session = Some(BufReader::new(stream));
            self.connected.store(true, Ordering::Release);
            info!(%target, "Instrument connected");
        }

        let Some(stream) = session.as_mut() else {
            return Err(RigError::Communication {
                command: command.text().to_string(),
                reason: "session unavailable".into(),
            });
        };

        match self.exchange(stream, command).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(command = %command, error = %e, "Dropping instrument session");
                *session = None;
                self.connected.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Close the session, if any. The next command reconnects.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if let Some(mut stream) = session.take() {
            let _ = stream.get_mut().shutdown().await;
            info!(target = %self.connector.target(), "Instrument disconnected");
        }
        self.connected.store(false, Ordering::Release);
    }

    async fn exchange(
        &self,
        stream: &mut BufReader<DynStream>,
        command: &ScpiCommand,
    ) -> RigResult<Option<String>> {
        let io_error = |e: std::io::Error| RigError::Communication {
            command: command.text().to_string(),
            reason: e.to_string(),
        };

        let writer = stream.get_mut();
        writer
            .write_all(command.framed().as_bytes())
            .await
            .map_err(io_error)?;
        writer.flush().await.map_err(io_error)?;
        debug!(command = %command, "Sent");

        if !command.expects_reply() {
            // No acknowledgement exists; give the instrument time to apply it
            tokio::time::sleep(self.command_settle).await;
            return Ok(None);
        }

        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, stream.read_line(&mut line))
            .await
            .map_err(|_| RigError::Timeout {
                command: command.text().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(io_error)?;
        if read == 0 {
            return Err(RigError::Communication {
                command: command.text().to_string(),
                reason: "connection closed by instrument".into(),
            });
        }

        let reply = line.trim().to_string();
        debug!(command = %command, %reply, "Received");
        Ok(Some(reply))
    }
}

impl std::fmt::Debug for InstrumentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentLink")
            .field("target", &self.connector.target())
            .field("connected", &self.is_connected())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::instrument::simulator::SimulatedSupply;

    fn link_to(supply: &SimulatedSupply) -> InstrumentLink {
        InstrumentLink::new(
            Arc::new(supply.connector()),
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connects_lazily_on_first_command() {
        let supply = SimulatedSupply::new(10.0);
        let link = link_to(&supply);
        assert!(!link.is_connected());
        assert_eq!(supply.connections(), 0);

        let reply = link.send(&ScpiCommand::identify()).await.unwrap();
        assert!(reply.unwrap().contains("XLN30052"));
        assert!(link.is_connected());
        assert_eq!(supply.connections(), 1);

        // Session is reused
        link.send(&ScpiCommand::output_state()).await.unwrap();
        assert_eq!(supply.connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_query_returns_no_reply() {
        let supply = SimulatedSupply::new(10.0);
        let link = link_to(&supply);

        let reply = link.send(&ScpiCommand::output(true)).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(supply.commands(), vec!["OUTP ON".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_drops_session_and_next_command_reconnects() {
        let supply = SimulatedSupply::new(10.0);
        let link = link_to(&supply);
        link.send(&ScpiCommand::identify()).await.unwrap();

        supply.set_silent(true);
        let err = link.send(&ScpiCommand::measure_voltage()).await.unwrap_err();
        assert!(matches!(err, RigError::Timeout { .. }));
        assert_eq!(err.category(), ErrorCategory::Communication);
        assert!(!link.is_connected());

        supply.set_silent(false);
        link.send(&ScpiCommand::measure_voltage()).await.unwrap();
        assert!(link.is_connected());
        assert_eq!(supply.connections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_a_communication_error() {
        let supply = SimulatedSupply::new(10.0);
        supply.drop_after(1);
        let link = link_to(&supply);

        let err = link.send(&ScpiCommand::identify()).await.unwrap_err();
        assert!(matches!(err, RigError::Communication { .. }));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn refused_connection_surfaces_to_caller() {
        let supply = SimulatedSupply::new(10.0);
        supply.refuse_connections(true);
        let link = link_to(&supply);

        let err = link.send(&ScpiCommand::identify()).await.unwrap_err();
        assert!(matches!(err, RigError::Connect { .. }));
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_session() {
        let supply = SimulatedSupply::new(10.0);
        let link = link_to(&supply);
        link.send(&ScpiCommand::identify()).await.unwrap();

        link.disconnect().await;
        assert!(!link.is_connected());
        link.send(&ScpiCommand::identify()).await.unwrap();
        assert_eq!(supply.connections(), 2);
    }
}
