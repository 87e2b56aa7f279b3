//! Serial transport for the field probe.
//!
//! The HI-6006 frames responses by length only: the host knows how many bytes each
//! command returns and reads exactly that block. [`read_block`] implements that rule
//! over any async reader so the I/O loop can run against a real port or a simulator.

use crate::error::{AppResult, SweepError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

/// Opens the probe port: 7 data bits, odd parity, 1 stop bit, no flow control.
#[cfg(feature = "instrument_serial")]
pub fn open_probe_port(port_path: &str, baud_rate: u32) -> AppResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(port_path, baud_rate)
        .data_bits(tokio_serial::DataBits::Seven)
        .parity(tokio_serial::Parity::Odd)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| {
            SweepError::Serial(format!("Failed to open probe serial port '{}': {}", port_path, e))
        })?;

    tracing::debug!(port = port_path, baud_rate, "probe serial port opened");
    Ok(port)
}

/// Always fails: this build has no serial support.
#[cfg(not(feature = "instrument_serial"))]
pub fn open_probe_port(port_path: &str, _baud_rate: u32) -> AppResult<tokio::io::DuplexStream> {
    Err(SweepError::Serial(format!(
        "Cannot open '{}': serial support not enabled. Rebuild with --features instrument_serial",
        port_path
    )))
}

/// Reads up to `size` bytes, stopping early only when `read_timeout` expires.
///
/// A partial block is returned as-is once the deadline passes; the decoder decides
/// whether it is usable. No bytes at all is a timeout, end of stream is an error.
pub async fn read_block<R>(reader: &mut R, size: usize, read_timeout: Duration) -> AppResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + read_timeout;
    let mut block = vec![0u8; size];
    let mut filled = 0;

    while filled < size {
        match timeout_at(deadline, reader.read(&mut block[filled..])).await {
            Ok(Ok(0)) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "probe closed the serial stream",
                )
                .into());
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if filled > 0 => break,
            Err(_) => return Err(SweepError::Timeout(read_timeout)),
        }
    }

    block.truncate(filled);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_reads_exact_block_across_chunks() {
        let (mut reader, mut writer) = duplex(64);
        tokio::spawn(async move {
            writer.write_all(b":B6").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer.write_all(b"4\r\n:T0").await.unwrap();
            // keep the pipe open
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let block = read_block(&mut reader, 6, Duration::from_millis(100)).await.unwrap();
        assert_eq!(block, b":B64\r\n");
    }

    #[tokio::test]
    async fn test_partial_block_after_deadline() {
        let (mut reader, mut writer) = duplex(64);
        writer.write_all(b":E3").await.unwrap();
        let block = read_block(&mut reader, 24, Duration::from_millis(20)).await.unwrap();
        assert_eq!(block, b":E3");
        drop(writer);
    }

    #[tokio::test]
    async fn test_silence_is_timeout() {
        let (mut reader, _writer) = duplex(64);
        let err = read_block(&mut reader, 8, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SweepError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_eof_is_transport_error() {
        let (mut reader, writer) = duplex(64);
        drop(writer);
        let err = read_block(&mut reader, 8, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_transport());
    }
}
