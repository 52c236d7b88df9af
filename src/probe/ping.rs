//! ICMP echo probe with a native socket path and a `ping` command fallback.
//!
//! The native path uses a blocking socket inside `spawn_blocking` so the
//! timing is not skewed by the async scheduler.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{into_latency, ProbeError, Prober};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Random identifier plus a process-wide sequence, so concurrent pings to the
/// same destination can tell their replies apart.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// ICMP echo prober.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str, timeout: Duration) -> Option<f64> {
        into_latency(address, ping(address, timeout).await)
    }
}

/// Send one echo request and return the round-trip time.
pub async fn ping(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return ping_command(address, timeout).await;
    }

    let ip = resolve_address(address).await?;
    let result = tokio::task::spawn_blocking(move || echo_blocking(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
            tracing::warn!(
                "Native ping to {} not permitted, falling back to command: {}",
                address,
                msg
            );
            ping_command(address, timeout).await
        }
        other => other,
    }
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("not permitted") || msg.contains("denied")
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    // Zone suffixes (fe80::1%en0) are not understood by IpAddr.
    let bare = address.split('%').next().unwrap_or(address);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

fn echo_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };

    let mut socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(request_type, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout(timeout))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        let len = socket.read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => ProbeError::Network(format!("failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();

        if is_matching_reply(&buf[..len], reply_type, identifier, sequence) {
            return if elapsed >= timeout {
                Err(ProbeError::Timeout(timeout))
            } else {
                Ok(elapsed)
            };
        }
        // Somebody else's reply; keep waiting for ours.
    }
}

/// Check an echo reply against our id and sequence. RAW IPv4 sockets hand
/// back the IP header too, DGRAM and IPv6 sockets do not.
fn is_matching_reply(packet: &[u8], reply_type: u8, identifier: u16, sequence: u16) -> bool {
    let offset = if reply_type == ICMP_ECHO_REPLY && packet.first().map(|b| b >> 4) == Some(4) {
        usize::from(packet[0] & 0x0f) * 4
    } else {
        0
    };
    let Some(icmp) = packet.get(offset..offset + 8) else {
        return false;
    };
    icmp[0] == reply_type
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Echo request with a 56 byte payload. The checksum is filled in for ICMPv4;
/// for ICMPv6 the kernel computes it.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if request_type == ICMP_ECHO_REQUEST {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

async fn ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1).to_string();
    let is_v6 = address.contains(':');

    let (program, wait_flag) = if cfg!(target_os = "macos") {
        (if is_v6 { "ping6" } else { "ping" }, "-t")
    } else {
        (if is_v6 { "ping6" } else { "ping" }, "-W")
    };

    let run = Command::new(program)
        .args(["-c", "1", wait_flag, &timeout_secs, address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute {}: {}", program, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("{} failed: {}", program, stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Pull the round-trip time out of `ping` output.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // Per-packet line: "time=12.3 ms" or "time<1 ms"
            r"time[=<](?P<ms>[0-9.]+)\s*ms",
            // macOS summary: "round-trip min/avg/max/stddev = a/b/c/d ms"
            r"round-trip\s+min/avg/max/stddev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
            // Linux summary: "rtt min/avg/max/mdev = a/b/c/d ms"
            r"rtt\s+min/avg/max/mdev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    patterns
        .iter()
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("ms")?.as_str().parse::<f64>().ok())
        .find(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_ms(d: Duration, expected: f64) {
        assert!((d.as_secs_f64() * 1000.0 - expected).abs() < 1e-6, "{:?}", d);
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_echo_request(ICMP_ECHO_REQUEST, 0x1234, 0x0001);
        // A packet with its checksum in place sums to zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0xff]), !0xff00u16);
    }

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(ICMP_ECHO_REQUEST, 0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_echo_request(ICMPV6_ECHO_REQUEST, 1, 2);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_matching_reply_with_ip_header() {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45; // IPv4, 20 byte header
        packet[20] = ICMP_ECHO_REPLY;
        packet[24..26].copy_from_slice(&7u16.to_be_bytes());
        packet[26..28].copy_from_slice(&9u16.to_be_bytes());
        assert!(is_matching_reply(&packet, ICMP_ECHO_REPLY, 7, 9));
        assert!(!is_matching_reply(&packet, ICMP_ECHO_REPLY, 7, 10));
        assert!(!is_matching_reply(&packet[..24], ICMP_ECHO_REPLY, 7, 9));
    }

    #[test]
    fn test_matching_reply_v6() {
        let mut packet = vec![0u8; 8];
        packet[0] = ICMPV6_ECHO_REPLY;
        packet[4..6].copy_from_slice(&3u16.to_be_bytes());
        packet[6..8].copy_from_slice(&4u16.to_be_bytes());
        assert!(is_matching_reply(&packet, ICMPV6_ECHO_REPLY, 3, 4));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        assert_ms(parse_ping_output(output).unwrap(), 12.345);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        assert_ms(parse_ping_output(output).unwrap(), 17.906);
    }

    #[test]
    fn test_parse_ping_output_prefers_per_packet_time() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 14.000/14.000/14.000/0.000 ms"#;
        assert_ms(parse_ping_output(output).unwrap(), 12.3);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(parse_ping_output("ping: unknown host nowhere").is_err());
    }
}
