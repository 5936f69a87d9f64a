//! Packed binary layout of the `/latency/record` payload.
//!
//! The layout is fixed over the wire and shared with the database
//! controller, so every field is written with explicit little-endian byte
//! writes rather than struct packing.

use anyhow::{bail, Result};

use crate::monitoring::types::MonitorId;

/// Seconds between the Unix epoch and 2021-01-01T00:00:00Z. Storing
/// timestamps relative to this keeps them in 32 bits through year ~2157.
pub const ZORAN_EPOCH_OFFSET: u64 = 1_609_484_400;

pub const HEADER_SIZE: usize = 64;
pub const ENTRY_SIZE: usize = 12;
pub const IDENTIFIER_LENGTH: usize = 48;

/// One latency sample as shipped to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyEntry {
    pub monitor_id: MonitorId,
    pub zoran_timestamp: u32,
    pub latency_microseconds: u32,
}

impl LatencyEntry {
    pub fn new(monitor_id: MonitorId, unix_timestamp: u64, latency_microseconds: u32) -> Self {
        Self {
            monitor_id,
            zoran_timestamp: unix_timestamp.saturating_sub(ZORAN_EPOCH_OFFSET) as u32,
            latency_microseconds,
        }
    }

    pub fn unix_timestamp(&self) -> u64 {
        self.zoran_timestamp as u64 + ZORAN_EPOCH_OFFSET
    }
}

/// Wire-level header values. The float helpers fold measurements into the
/// fixed-point fields the controller expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportHeader {
    pub version: u16,
    pub identifier: [u8; IDENTIFIER_LENGTH],
    /// Monitors serviced per second in unsigned 24.8 fixed point.
    pub monitors_per_second: u32,
    /// 0 = 0%, 65535 = 1600% (sixteen saturated cores).
    pub cpu_loading: u16,
    /// 0 = 0%, 65535 = 100%.
    pub memory_loading: u16,
    pub server_status_code: u8,
}

impl ReportHeader {
    pub fn new(
        identifier: &str,
        monitors_per_second: f64,
        cpu_utilization: f64,
        memory_utilization: f64,
        server_status_code: u8,
    ) -> Self {
        Self {
            version: 0,
            identifier: pack_identifier(identifier),
            monitors_per_second: (monitors_per_second * 256.0 + 0.5) as u32,
            cpu_loading: (cpu_utilization * 4096.0).min(65535.0).max(0.0) as u16,
            memory_loading: (memory_utilization * 65536.0).min(65535.0).max(0.0) as u16,
            server_status_code,
        }
    }

    pub fn identifier_str(&self) -> String {
        let end = self.identifier.iter().position(|&b| b == 0).unwrap_or(IDENTIFIER_LENGTH);
        String::from_utf8_lossy(&self.identifier[..end]).into_owned()
    }
}

/// UTF-8 identifier, right-padded with zeros and truncated at 48 bytes.
pub fn pack_identifier(identifier: &str) -> [u8; IDENTIFIER_LENGTH] {
    let mut packed = [0u8; IDENTIFIER_LENGTH];
    let bytes = identifier.as_bytes();
    let length = bytes.len().min(IDENTIFIER_LENGTH);
    packed[..length].copy_from_slice(&bytes[..length]);
    packed
}

pub fn encode(header: &ReportHeader, entries: &[LatencyEntry]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(HEADER_SIZE + ENTRY_SIZE * entries.len());

    buffer.extend_from_slice(&header.version.to_le_bytes());
    buffer.extend_from_slice(&header.identifier);
    buffer.extend_from_slice(&header.monitors_per_second.to_le_bytes());
    buffer.extend_from_slice(&header.cpu_loading.to_le_bytes());
    buffer.extend_from_slice(&header.memory_loading.to_le_bytes());
    buffer.push(header.server_status_code);
    buffer.extend_from_slice(&[0u8; HEADER_SIZE - 59]);

    for entry in entries {
        buffer.extend_from_slice(&entry.monitor_id.to_le_bytes());
        buffer.extend_from_slice(&entry.zoran_timestamp.to_le_bytes());
        buffer.extend_from_slice(&entry.latency_microseconds.to_le_bytes());
    }

    buffer
}

pub fn decode(payload: &[u8]) -> Result<(ReportHeader, Vec<LatencyEntry>)> {
    if payload.len() < HEADER_SIZE {
        bail!("latency payload shorter than the {HEADER_SIZE}-byte header");
    }
    if (payload.len() - HEADER_SIZE) % ENTRY_SIZE != 0 {
        bail!("latency payload entry area is not a multiple of {ENTRY_SIZE} bytes");
    }

    let mut identifier = [0u8; IDENTIFIER_LENGTH];
    identifier.copy_from_slice(&payload[2..2 + IDENTIFIER_LENGTH]);

    let header = ReportHeader {
        version: u16::from_le_bytes([payload[0], payload[1]]),
        identifier,
        monitors_per_second: u32::from_le_bytes([payload[50], payload[51], payload[52], payload[53]]),
        cpu_loading: u16::from_le_bytes([payload[54], payload[55]]),
        memory_loading: u16::from_le_bytes([payload[56], payload[57]]),
        server_status_code: payload[58],
    };

    let mut entries = Vec::with_capacity((payload.len() - HEADER_SIZE) / ENTRY_SIZE);
    let mut offset = HEADER_SIZE;
    while offset < payload.len() {
        let field = |at: usize| {
            u32::from_le_bytes([
                payload[at],
                payload[at + 1],
                payload[at + 2],
                payload[at + 3],
            ])
        };
        entries.push(LatencyEntry {
            monitor_id: field(offset),
            zoran_timestamp: field(offset + 4),
            latency_microseconds: field(offset + 8),
        });
        offset += ENTRY_SIZE;
    }

    Ok((header, entries))
}
