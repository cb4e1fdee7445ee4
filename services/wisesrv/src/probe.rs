//! Raw TCP line probe
//!
//! Connects, sends one line and reads one line back. Useful to check that a
//! device port is reachable before configuring a sensor against it.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, WiseError};
use crate::protocols::modbus::constants::DEFAULT_PROBE_TIMEOUT_MS;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS);

/// Longest response line accepted, line ending included
pub const MAX_LINE_LEN: u64 = 4096;

/// Send `payload` plus a newline to `addr` and return the first response line
///
/// `read_timeout` bounds the connect and the read separately. The returned
/// line has its line ending stripped.
pub async fn probe(addr: &str, payload: &str, read_timeout: Duration) -> Result<String> {
    let timeout_ms = read_timeout.as_millis() as u64;

    let mut stream = match timeout(read_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(WiseError::Connect {
                endpoint: addr.to_string(),
                source,
            });
        },
        Err(_) => return Err(WiseError::timeout(format!("connect to {}", addr), timeout_ms)),
    };

    let mut request = payload.as_bytes().to_vec();
    request.push(b'\n');
    stream.write_all(&request).await?;
    debug!("Probe sent {} bytes to {}", request.len(), addr);

    let mut reader = BufReader::new(stream.take(MAX_LINE_LEN));
    let mut line = String::new();
    let read = timeout(read_timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| WiseError::timeout(format!("read from {}", addr), timeout_ms))??;

    if read as u64 >= MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(WiseError::protocol(format!(
            "{} sent a line longer than {} bytes",
            addr, MAX_LINE_LEN
        )));
    }
    if read == 0 || !line.ends_with('\n') {
        return Err(WiseError::protocol(format!(
            "{} closed the connection before sending a full line",
            addr
        )));
    }

    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
