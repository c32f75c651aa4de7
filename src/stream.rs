//! Component E — the Stream Multiplexer.
//!
//! Owns the OPEN/OKAY/WRTE/CLSE state machine for logical streams
//! multiplexed over the single connected packet channel, plus the
//! shell-command helper compositions built on top of it (spec §4.E).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};
use crate::packet::{Packet, A_CLSE, A_OKAY, A_OPEN, A_WRTE};
use crate::session::SessionShared;

const DEFAULT_OPEN_DEADLINE: Duration = Duration::from_secs(10);

/// Dispatch one post-handshake inbound frame to the stream multiplexer
/// (spec §4.E). Called from [`SessionShared::dispatch_one`] once the
/// session is connected.
pub(crate) fn handle_inbound(shared: &SessionShared, pkt: Packet) {
    match pkt.command {
        A_OKAY => handle_okay(shared, pkt),
        A_WRTE => handle_wrte(shared, pkt),
        A_CLSE => handle_clse(shared, pkt),
        other => debug!("stream multiplexer ignoring unexpected post-handshake frame {other:#x}"),
    }
}

/// OKAY(remote, local): if the named local stream has no `remote_id` yet,
/// record it and signal ready. Otherwise it's a flow-control ACK for data
/// we sent — drop it (spec §4.E).
fn handle_okay(shared: &SessionShared, pkt: Packet) {
    let local = pkt.arg1;
    let mut state = shared.state.lock().unwrap();
    if let Some(stream) = state.streams.get_mut(&local) {
        if stream.remote_id.is_none() {
            stream.remote_id = Some(pkt.arg0);
        } else {
            stream.write_acked = true;
        }
    }
    drop(state);
    shared.cv.notify_all();
}

/// WRTE(remote, local): append the payload to the stream's buffer and
/// immediately send OKAY(local, remote, empty) — the protocol's only flow
/// control (spec §4.E).
fn handle_wrte(shared: &SessionShared, pkt: Packet) {
    let local = pkt.arg1;
    let remote = pkt.arg0;
    let exists = {
        let mut state = shared.state.lock().unwrap();
        match state.streams.get_mut(&local) {
            Some(stream) if !stream.closed => {
                stream.buffer.extend_from_slice(&pkt.payload);
                true
            }
            _ => false,
        }
    };
    shared.cv.notify_all();
    if exists {
        let _ = shared.send(Packet::control(A_OKAY, local, remote));
    }
}

/// CLSE(remote, local): mark the stream closed. If it had no `remote_id`
/// yet it was rejected by the device and no reply is sent; otherwise
/// reply with CLSE(local, remote, empty) (spec §4.E).
fn handle_clse(shared: &SessionShared, pkt: Packet) {
    let local = pkt.arg1;
    let remote = pkt.arg0;
    let was_rejected = {
        let mut state = shared.state.lock().unwrap();
        match state.streams.get_mut(&local) {
            Some(stream) if !stream.closed => {
                stream.closed = true;
                let rejected = stream.remote_id.is_none();
                stream.rejected = rejected;
                Some(rejected)
            }
            _ => None,
        }
    };
    shared.cv.notify_all();
    match was_rejected {
        Some(false) => {
            let _ = shared.send(Packet::control(A_CLSE, local, remote));
        }
        Some(true) => {
            // Rejected before confirmation; the open-in-flight waiter sees
            // `rejected` via the streams table, no reply is due.
        }
        None => {}
    }
}

/// A handle to an open logical stream. Exposed upward per the spec §4.E
/// public contract; borrows the session for its lifetime — the streams
/// table itself lives in `SessionShared`; this is just a key plus a
/// reference, per the "no cycles in ownership" design note (spec §9).
pub struct Stream {
    shared: Arc<SessionShared>,
    local_id: u32,
}

impl Stream {
    /// `open(service)`: allocate a local id, send OPEN, and wait for the
    /// device to confirm with OKAY or reject with CLSE before the open
    /// deadline (spec §4.E).
    pub fn open(shared: &Arc<SessionShared>, service: &str) -> Result<Self> {
        Self::open_with_deadline(shared, service, Instant::now() + DEFAULT_OPEN_DEADLINE)
    }

    pub fn open_with_deadline(
        shared: &Arc<SessionShared>,
        service: &str,
        deadline: Instant,
    ) -> Result<Self> {
        let local_id = {
            let mut state = shared.state.lock().unwrap();
            let id = state.next_local_id;
            state.next_local_id += 1;
            state.streams.insert(id, crate::session::StreamState::new());
            id
        };

        let mut payload = service.as_bytes().to_vec();
        payload.push(0);
        shared.send(Packet::new(A_OPEN, local_id, 0, payload))?;

        loop {
            let (remote_id, closed, rejected) = {
                let state = shared.state.lock().unwrap();
                let stream = state.streams.get(&local_id).expect("stream stays in table until closed");
                (stream.remote_id, stream.closed, stream.rejected)
            };
            if rejected {
                shared.forget_stream(local_id);
                return Err(Error::Rejected {
                    diagnostics: shared.diagnostics(),
                });
            }
            if remote_id.is_some() {
                return Ok(Stream { shared: Arc::clone(shared), local_id });
            }
            if closed {
                shared.forget_stream(local_id);
                return Err(Error::Rejected {
                    diagnostics: shared.diagnostics(),
                });
            }
            if !shared.wait_until(deadline) {
                shared.forget_stream(local_id);
                return Err(Error::Timeout {
                    diagnostics: shared.diagnostics(),
                });
            }
        }
    }

    /// `collect(handle, deadline)`: return the concatenated payload bytes
    /// received so far, blocking until the stream closes or `deadline`
    /// fires, whichever comes first. Never fails; collected bytes are not
    /// erased from the buffer (spec §4.E).
    pub fn collect(&self, deadline: Instant) -> Vec<u8> {
        loop {
            let (buffer, closed) = {
                let state = self.shared.state.lock().unwrap();
                match state.streams.get(&self.local_id) {
                    Some(stream) => (stream.buffer.clone(), stream.closed),
                    None => (Vec::new(), true),
                }
            };
            if closed {
                return buffer;
            }
            if !self.shared.wait_until(deadline) {
                return buffer;
            }
        }
    }

    pub fn collect_text(&self, deadline: Instant) -> String {
        String::from_utf8_lossy(&self.collect(deadline)).into_owned()
    }

    /// `send(handle, bytes)`: write a WRTE frame and wait for the
    /// device's OKAY acknowledgement (spec §4.E, design note 3 — the
    /// natural symmetric operation).
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let remote_id = {
            let mut state = self.shared.state.lock().unwrap();
            match state.streams.get_mut(&self.local_id) {
                Some(stream) if !stream.closed => {
                    stream.write_acked = false;
                    stream.remote_id.expect("remote_id is set once open() returns a Stream")
                }
                _ => return Err(Error::Closed),
            }
        };
        self.shared
            .send(Packet::new(A_WRTE, self.local_id, remote_id, data.to_vec()))?;

        let deadline = Instant::now() + DEFAULT_OPEN_DEADLINE;
        loop {
            let (acked, closed) = {
                let state = self.shared.state.lock().unwrap();
                match state.streams.get(&self.local_id) {
                    Some(stream) => (stream.write_acked, stream.closed),
                    None => (false, true),
                }
            };
            if acked {
                return Ok(());
            }
            if closed {
                return Err(Error::Closed);
            }
            if !self.shared.wait_until(deadline) {
                return Err(Error::Timeout {
                    diagnostics: self.shared.diagnostics(),
                });
            }
        }
    }

    /// `close(handle)`: mark this stream closed locally and notify the
    /// device, unless it is already closed (spec §4.E).
    pub fn close(&self) {
        let (remote_id, already_closed) = {
            let mut state = self.shared.state.lock().unwrap();
            match state.streams.get_mut(&self.local_id) {
                Some(stream) => {
                    let remote = stream.remote_id;
                    let was_closed = stream.closed;
                    stream.closed = true;
                    (remote, was_closed)
                }
                None => (None, true),
            }
        };
        if !already_closed {
            if let Some(remote_id) = remote_id {
                let _ = self.shared.send(Packet::control(A_CLSE, self.local_id, remote_id));
            }
        }
        self.shared.forget_stream(self.local_id);
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Thin composition: open a `shell:` stream running `command`, collect
/// until close or `deadline`, and return the output as text (spec §4.E
/// "Shell command helpers").
pub fn run_shell(shared: &Arc<SessionShared>, command: &str, deadline: Instant) -> Result<String> {
    let service = format!("shell:{command}");
    let stream = Stream::open_with_deadline(shared, &service, deadline)?;
    Ok(stream.collect_text(deadline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{HostKey, KeyStore};
    use crate::packet::{A_CNXN, PROTOCOL_VERSION};
    use crate::session::Session;
    use crate::transport::mock::MockTransport;

    struct MemStore;
    impl KeyStore for MemStore {
        fn load_key(&self) -> Result<Option<(String, String)>> {
            Ok(None)
        }
        fn store_key(&self, _p: &str, _u: &str) -> Result<()> {
            Ok(())
        }
    }

    fn connected_session() -> Session {
        let mock = MockTransport::new(vec![Packet::new(
            A_CNXN,
            PROTOCOL_VERSION,
            0x4000_0000,
            b"device::ro.serialno=ABC123\0".to_vec(),
        )]);
        let host_key = Arc::new(HostKey::load_or_generate(&MemStore).unwrap());
        let (session, _info) = Session::connect(Box::new(mock), host_key).unwrap();
        session
    }

    #[test]
    fn s4_stream_echo_collects_payload_and_acks() {
        let session = connected_session();
        let shared = Arc::clone(&session.shared);

        // Feed OKAY/WRTE/CLSE directly into the dispatcher, emulating the
        // read loop seeing them arrive after open() sends OPEN.
        let local_id = {
            let mut state = shared.state.lock().unwrap();
            let id = state.next_local_id;
            state.next_local_id += 1;
            state.streams.insert(id, crate::session::StreamState::new());
            id
        };
        shared.dispatch_one(Packet::control(A_OKAY, 7, local_id));
        shared.dispatch_one(Packet::new(A_WRTE, 7, local_id, b"hi\n".to_vec()));
        shared.dispatch_one(Packet::control(A_CLSE, 7, local_id));

        let stream = Stream { shared: Arc::clone(&shared), local_id };
        let text = stream.collect_text(Instant::now() + Duration::from_secs(1));
        assert_eq!(text, "hi\n");
        drop(stream); // already closed by the device; close() here is a no-op

        session.disconnect();
    }

    #[test]
    fn s5_rejected_open_never_replies_with_clse() {
        let session = connected_session();
        let shared = Arc::clone(&session.shared);

        let local_id = {
            let mut state = shared.state.lock().unwrap();
            let id = state.next_local_id;
            state.next_local_id += 1;
            state.streams.insert(id, crate::session::StreamState::new());
            id
        };
        shared.dispatch_one(Packet::control(A_CLSE, 0, local_id));

        let state = shared.state.lock().unwrap();
        let stream = state.streams.get(&local_id).unwrap();
        assert!(stream.closed);
        assert!(stream.rejected);
        drop(state);
        session.disconnect();
    }
}
