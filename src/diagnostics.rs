use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::packet::{command_to_str, Packet};

/// Maximum number of packet descriptors retained for diagnostics.
const LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One logged packet, stripped down to header fields plus a payload length
/// and checksum — never the payload bytes themselves, so the log stays
/// cheap to retain for the life of a session.
#[derive(Debug, Clone)]
pub struct PacketDescriptor {
    pub at: Instant,
    pub direction: Direction,
    pub command: String,
    pub arg0: u32,
    pub arg1: u32,
    pub payload_len: usize,
    pub payload_checksum: u32,
}

/// Bounded circular buffer of the last [`LOG_CAPACITY`] packets seen on a
/// session, used only for diagnostics surfaced to the caller and attached
/// to errors.
#[derive(Debug, Default)]
pub struct PacketLog {
    entries: VecDeque<PacketDescriptor>,
}

impl PacketLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(LOG_CAPACITY),
        }
    }

    pub fn record(&mut self, direction: Direction, pkt: &Packet) {
        if self.entries.len() == LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(PacketDescriptor {
            at: Instant::now(),
            direction,
            command: command_to_str(pkt.command),
            arg0: pkt.arg0,
            arg1: pkt.arg1,
            payload_len: pkt.payload.len(),
            payload_checksum: pkt.payload_checksum(),
        });
    }

    pub fn last(&self, n: usize) -> Vec<PacketDescriptor> {
        self.entries.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshot returned by `AdbHost::diagnostics()` and attached to errors so
/// callers can present them to the user (spec §6/§7).
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub connected: bool,
    pub max_payload: usize,
    pub open_stream_count: usize,
    pub recent_packets: Vec<PacketDescriptor>,
    pub uptime: Option<Duration>,
}

impl Diagnostics {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            max_payload: 0,
            open_stream_count: 0,
            recent_packets: Vec::new(),
            uptime: None,
        }
    }
}
