//! Line-terminated SCPI transport.
//!
//! [`ScpiStream`] works over any byte stream: a raw SCPI socket (port 5025) for the
//! signal generator, or an in-memory duplex pipe for the simulator. Every read and
//! write is bounded by the stream timeout so a silent instrument cannot hang the
//! caller.

use crate::error::{AppResult, SweepError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// Query that blocks on the instrument until pending operations finish.
pub const OPERATION_COMPLETE_QUERY: &str = "*OPC?";

/// SCPI session over a byte stream.
pub struct ScpiStream<T> {
    io: BufReader<T>,
    terminator: &'static str,
    timeout: Duration,
}

impl<T> ScpiStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps `io`. Every write and query is bounded by `timeout`.
    pub fn new(io: T, timeout: Duration) -> Self {
        Self {
            io: BufReader::new(io),
            terminator: "\n",
            timeout,
        }
    }

    /// Per-round-trip bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends one command line.
    pub async fn write(&mut self, command: &str) -> AppResult<()> {
        trace!(command, "scpi write");
        let line = format!("{}{}", command, self.terminator);
        let io = self.io.get_mut();
        timeout(self.timeout, async {
            io.write_all(line.as_bytes()).await?;
            io.flush().await
        })
        .await
        .map_err(|_| SweepError::Timeout(self.timeout))??;
        Ok(())
    }

    /// Sends a query and returns the trimmed response line.
    pub async fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command).await?;
        let mut line = String::new();
        let read = timeout(self.timeout, self.io.read_line(&mut line))
            .await
            .map_err(|_| SweepError::Timeout(self.timeout))??;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed while waiting for '{}'", command),
            )
            .into());
        }
        let response = line.trim().to_string();
        trace!(command, response = %response, "scpi query");
        Ok(response)
    }

    /// Polls `*OPC?` until the instrument reports completion or the timeout elapses.
    pub async fn wait_operation_complete(&mut self) -> AppResult<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let response = self.query(OPERATION_COMPLETE_QUERY).await?;
            if response.trim_start_matches('+') == "1" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SweepError::Timeout(self.timeout));
            }
            debug!(response = %response, "operation still pending");
        }
    }
}

/// Opens a raw SCPI socket to `address:port`.
pub async fn connect_tcp(
    address: &str,
    port: u16,
    connect_timeout: Duration,
) -> AppResult<ScpiStream<TcpStream>> {
    let stream = timeout(connect_timeout, TcpStream::connect((address, port)))
        .await
        .map_err(|_| SweepError::Timeout(connect_timeout))??;
    stream.set_nodelay(true)?;
    debug!(address, port, "SCPI socket connected");
    Ok(ScpiStream::new(stream, connect_timeout))
}
