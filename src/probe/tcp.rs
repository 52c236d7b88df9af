//! TCP connect probe.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{into_latency, ProbeError, Prober};

/// Measures the time to complete (or be refused by) a TCP handshake.
#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    port: u16,
}

impl TcpProber {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str, timeout: Duration) -> Option<f64> {
        into_latency(address, tcp_connect(address, self.port, timeout).await)
    }
}

/// Connect to `address:port` and return the handshake time.
///
/// A refused connection still proves the host answered, so it counts as a
/// measurement.
pub async fn tcp_connect(address: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
    let target = if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    };

    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Err(_) => Err(ProbeError::Timeout(timeout)),
        Ok(Ok(_stream)) => Ok(start.elapsed()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Ok(start.elapsed()),
        Ok(Err(e)) => Err(ProbeError::Network(format!("connect to {} failed: {}", target, e))),
    }
}
