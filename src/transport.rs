//! The `PacketTransport` trait decouples the Session/Stream layers from the
//! concrete USB transport, so they can be driven in tests by a
//! [`MockTransport`] that scripts inbound frames instead of real hardware
//! (spec §8, scenarios S1–S6).

use std::time::Duration;

use crate::error::Result;
use crate::packet::Packet;

pub trait PacketTransport: Send {
    /// Send a full packet (header + payload) as one atomic unit — callers
    /// rely on this to never interleave with another frame (spec §5).
    fn send_packet(&mut self, pkt: &Packet) -> Result<()>;

    /// Block until a full packet has been read, or the transport's
    /// timeout elapses.
    fn recv_packet(&mut self) -> Result<Packet>;

    fn set_timeout(&mut self, timeout: Duration);

    /// The negotiated (or default, pre-negotiation) max payload size this
    /// transport will accept on send.
    fn max_payload(&self) -> usize;

    fn set_max_payload(&mut self, max_payload: usize);
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// A transport double that replays a scripted sequence of inbound
    /// packets and records every outbound packet, for scenario tests
    /// against a mock device (spec §8 S1–S6).
    ///
    /// `outbound` is reference-counted so a test can keep a handle to it
    /// after the transport is boxed and moved into a `Session`.
    pub struct MockTransport {
        pub inbound: VecDeque<Packet>,
        pub outbound: Arc<Mutex<Vec<Packet>>>,
        max_payload: usize,
    }

    impl MockTransport {
        pub fn new(inbound: Vec<Packet>) -> Self {
            Self {
                inbound: inbound.into(),
                outbound: Arc::new(Mutex::new(Vec::new())),
                max_payload: 1 << 20,
            }
        }

        pub fn push_inbound(&mut self, pkt: Packet) {
            self.inbound.push_back(pkt);
        }

        /// A cloneable handle onto the sent-packet log, for inspecting
        /// outbound frames after the transport has been moved elsewhere.
        pub fn outbound_handle(&self) -> Arc<Mutex<Vec<Packet>>> {
            Arc::clone(&self.outbound)
        }
    }

    impl PacketTransport for MockTransport {
        fn send_packet(&mut self, pkt: &Packet) -> Result<()> {
            self.outbound.lock().unwrap().push(pkt.clone());
            Ok(())
        }

        fn recv_packet(&mut self) -> Result<Packet> {
            self.inbound
                .pop_front()
                .ok_or_else(|| Error::internal(anyhow::anyhow!("mock transport exhausted")))
        }

        fn set_timeout(&mut self, _timeout: Duration) {}

        fn max_payload(&self) -> usize {
            self.max_payload
        }

        fn set_max_payload(&mut self, max_payload: usize) {
            self.max_payload = max_payload;
        }
    }
}
