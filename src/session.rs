//! Component D — the Session Engine.
//!
//! Drives the CNXN/AUTH handshake, then hands the connected channel over
//! to a dedicated read-loop thread that dispatches inbound frames to the
//! waiter registry (handshake) or the stream multiplexer (post-handshake),
//! per spec §4.D/§5.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::auth::HostKey;
use crate::diagnostics::{Direction, Diagnostics, PacketLog};
use crate::error::{Error, Result};
use crate::packet::{
    Packet, A_AUTH, A_CNXN, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, PROTOCOL_VERSION,
};
use crate::transport::PacketTransport;

/// Host feature string advertised in the CNXN banner (spec §4.D, Open
/// Question 2 resolved to the minimal conservative set).
const FEATURES: &str = "cmd,stat_v2,ls_v2,fixed_push_mkdir";

const DEFAULT_MAX_PAYLOAD: usize = 1 << 20;
/// How long the read loop blocks on a single poll before re-checking for
/// outbound work — keeps the shared transport mutex from starving senders
/// (spec §5's "serialise all transport access through a single mutex").
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);
const SETTLE_DELAY: Duration = Duration::from_millis(50);
/// Error-recovery budget in the read loop (spec §5).
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const TRANSIENT_PAUSE: Duration = Duration::from_millis(200);

/// Device identity parsed out of the device's CNXN payload.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub serial: String,
    pub product: String,
    pub model: String,
}

pub(crate) struct StreamState {
    pub(crate) remote_id: Option<u32>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) closed: bool,
    pub(crate) rejected: bool,
    /// Set while a host-issued WRTE awaits its flow-control OKAY; cleared
    /// by the next OKAY received once `remote_id` is already known (spec
    /// §4.E OKAY handling, §9 design note 3).
    pub(crate) write_acked: bool,
}

impl StreamState {
    pub(crate) fn new() -> Self {
        Self {
            remote_id: None,
            buffer: Vec::new(),
            closed: false,
            rejected: false,
            write_acked: true,
        }
    }
}

enum WaiterEvent {
    Frame(Packet),
}

struct Waiter {
    predicate: Box<dyn Fn(&Packet) -> bool + Send>,
    resolver: mpsc::SyncSender<WaiterEvent>,
}

pub(crate) struct SessionState {
    pub(crate) streams: HashMap<u32, StreamState>,
    waiters: Vec<Waiter>,
    pub(crate) next_local_id: u32,
    pub(crate) log: PacketLog,
    pub(crate) connected: bool,
    pub(crate) max_payload: usize,
    pub(crate) device: ConnectInfo,
}

/// Shared session state reachable from the caller's thread, every `Stream`
/// handle, and the dedicated read-loop thread.
pub struct SessionShared {
    transport: Mutex<Box<dyn PacketTransport>>,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) cv: std::sync::Condvar,
    running: Mutex<bool>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
    pub(crate) host_key: Arc<HostKey>,
    connected_at: Mutex<Option<Instant>>,
}

impl SessionShared {
    pub(crate) fn send(&self, pkt: Packet) -> Result<()> {
        {
            let mut transport = self.transport.lock().unwrap();
            transport.send_packet(&pkt)?;
        }
        self.state.lock().unwrap().log.record(Direction::Sent, &pkt);
        Ok(())
    }

    /// Drop a stream's table entry once its caller has consumed its final
    /// state (rejection, close, or timeout) — the streams table only ever
    /// holds streams a caller might still observe (spec §8 invariant 5).
    pub(crate) fn forget_stream(&self, local_id: u32) {
        self.state.lock().unwrap().streams.remove(&local_id);
    }

    /// Block the calling thread until `cv` is notified or `deadline`
    /// elapses. Returns `false` on timeout. Used by stream operations to
    /// wait for the read-loop thread to update stream state (spec §5).
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let state = self.state.lock().unwrap();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        let (_state, timeout_result) = self.cv.wait_timeout(state, remaining).unwrap();
        !timeout_result.timed_out()
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    /// Route one inbound frame: satisfy the first matching waiter, or (once
    /// connected) hand it to the stream multiplexer. Frames matching
    /// neither are logged and dropped.
    pub(crate) fn dispatch_one(&self, pkt: Packet) {
        let connected = {
            let mut state = self.state.lock().unwrap();
            state.log.record(Direction::Received, &pkt);
            if let Some(idx) = state.waiters.iter().position(|w| (w.predicate)(&pkt)) {
                let waiter = state.waiters.remove(idx);
                let _ = waiter.resolver.send(WaiterEvent::Frame(pkt));
                return;
            }
            state.connected
        };
        if connected {
            crate::stream::handle_inbound(self, pkt);
        } else {
            debug!("dropping unmatched frame during handshake: {:?}", pkt.command);
        }
    }

    /// Install a waiter for the first inbound frame matching `predicate`,
    /// pumping `recv_packet` on this calling thread until it arrives or
    /// `deadline` elapses. Used only during the handshake, before the read
    /// loop thread exists to do the dispatching (spec §4.D, §9 design
    /// note "Waiters vs read loop").
    fn await_frame(
        &self,
        predicate: impl Fn(&Packet) -> bool + Send + 'static,
        deadline: Instant,
    ) -> Result<Packet> {
        let (tx, rx) = mpsc::sync_channel(1);
        {
            let mut state = self.state.lock().unwrap();
            state.waiters.push(Waiter {
                predicate: Box::new(predicate),
                resolver: tx,
            });
        }
        loop {
            if let Ok(WaiterEvent::Frame(pkt)) = rx.try_recv() {
                return Ok(pkt);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout {
                    diagnostics: self.diagnostics(),
                });
            }
            let poll = remaining.min(POLL_TIMEOUT);
            let recv_result = {
                let mut transport = self.transport.lock().unwrap();
                transport.set_timeout(poll);
                transport.recv_packet()
            };
            match recv_result {
                Ok(pkt) => self.dispatch_one(pkt),
                Err(Error::Timeout { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let state = self.state.lock().unwrap();
        Diagnostics {
            connected: state.connected,
            max_payload: state.max_payload,
            open_stream_count: state.streams.values().filter(|s| !s.closed).count(),
            recent_packets: state.log.last(50),
            uptime: self
                .connected_at
                .lock()
                .unwrap()
                .map(|at| at.elapsed()),
        }
    }

    /// Process-wide cancellation: stop the read loop, fail every waiter
    /// and open stream, and release the USB interface (spec §5).
    pub fn disconnect(&self) {
        *self.running.lock().unwrap() = false;
        if let Some(handle) = self.read_loop.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.waiters.clear();
        for stream in state.streams.values_mut() {
            stream.closed = true;
        }
        state.streams.clear();
        self.cv.notify_all();
        // The USB interface is released and the device closed when the
        // transport's `Box<dyn PacketTransport>` drops along with this
        // `SessionShared` — both errors are swallowed there, per spec §5.
    }
}

/// A connected ADB session: the handshake has completed and the read loop
/// is dispatching inbound frames.
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    /// Drive the CNXN/AUTH state machine to completion (spec §4.D), then
    /// spawn the read loop and return the connected session.
    pub fn connect(
        mut transport: Box<dyn PacketTransport>,
        host_key: Arc<HostKey>,
    ) -> Result<(Self, ConnectInfo)> {
        transport.set_max_payload(DEFAULT_MAX_PAYLOAD);
        let shared = Arc::new(SessionShared {
            transport: Mutex::new(transport),
            state: Mutex::new(SessionState {
                streams: HashMap::new(),
                waiters: Vec::new(),
                next_local_id: 1,
                log: PacketLog::new(),
                connected: false,
                max_payload: DEFAULT_MAX_PAYLOAD,
                device: ConnectInfo::default(),
            }),
            cv: std::sync::Condvar::new(),
            running: Mutex::new(false),
            read_loop: Mutex::new(None),
            host_key,
            connected_at: Mutex::new(None),
        });

        match Self::handshake(&shared) {
            Ok(info) => {
                thread::sleep(SETTLE_DELAY);
                {
                    let mut state = shared.state.lock().unwrap();
                    state.connected = true;
                }
                *shared.connected_at.lock().unwrap() = Some(Instant::now());
                *shared.running.lock().unwrap() = true;
                let handle = spawn_read_loop(Arc::clone(&shared));
                *shared.read_loop.lock().unwrap() = Some(handle);
                info!("ADB session connected: {:?}", info);
                Ok((Session { shared }, info))
            }
            Err(e) => {
                shared.disconnect();
                Err(e)
            }
        }
    }

    fn handshake(shared: &Arc<SessionShared>) -> Result<ConnectInfo> {
        let banner = format!("host::features={FEATURES}").into_bytes();
        shared.send(Packet::new(A_CNXN, PROTOCOL_VERSION, DEFAULT_MAX_PAYLOAD as u32, banner))?;

        let mut sig_sent = false;
        let mut pubkey_sent = false;
        let deadline = Instant::now() + HANDSHAKE_DEADLINE;

        loop {
            let reply = shared.await_frame(|p| p.command == A_CNXN || p.command == A_AUTH, deadline)?;
            match reply.command {
                A_CNXN => return Ok(parse_device_cnxn(shared, &reply)),
                A_AUTH if reply.arg0 == AUTH_TOKEN => {
                    if !sig_sent {
                        let signature = shared.host_key.sign(&reply.payload)?;
                        shared.send(Packet::new(A_AUTH, AUTH_SIGNATURE, 0, signature))?;
                        sig_sent = true;
                    } else if !pubkey_sent {
                        let blob = shared.host_key.pubkey_blob().as_bytes().to_vec();
                        shared.send(Packet::new(A_AUTH, AUTH_RSAPUBLICKEY, 0, blob))?;
                        pubkey_sent = true;
                    } else {
                        return Err(Error::AuthRejected {
                            diagnostics: shared.diagnostics(),
                        });
                    }
                }
                _ => {
                    warn!("unexpected frame during handshake: {:#x}", reply.command);
                }
            }
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.shared.diagnostics()
    }

    pub fn disconnect(&self) {
        self.shared.disconnect();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

/// Parse the device's CNXN payload: strip NULs, split on the first `::`,
/// then on `;`, then each entry on `=` (spec §4.D).
fn parse_device_cnxn(shared: &Arc<SessionShared>, pkt: &Packet) -> ConnectInfo {
    {
        let mut state = shared.state.lock().unwrap();
        state.max_payload = pkt.arg1 as usize;
    }
    let mut transport = shared.transport.lock().unwrap();
    transport.set_max_payload(pkt.arg1 as usize);
    drop(transport);

    let payload: Vec<u8> = pkt.payload.iter().copied().filter(|&b| b != 0).collect();
    let text = String::from_utf8_lossy(&payload);
    let tail = match text.split_once("::") {
        Some((_, tail)) => tail,
        None => "",
    };

    let mut props: HashMap<String, String> = HashMap::new();
    for entry in tail.split(';') {
        if let Some((key, value)) = entry.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let info = ConnectInfo {
        serial: props.get("ro.serialno").cloned().unwrap_or_default(),
        product: props.get("ro.product.name").cloned().unwrap_or_default(),
        model: props.get("ro.product.model").cloned().unwrap_or_default(),
    };
    shared.state.lock().unwrap().device = info.clone();
    info
}

fn spawn_read_loop(shared: Arc<SessionShared>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut consecutive_failures = 0u32;
        while shared.is_running() {
            let recv_result = {
                let mut transport = shared.transport.lock().unwrap();
                transport.set_timeout(POLL_TIMEOUT);
                transport.recv_packet()
            };
            match recv_result {
                Ok(pkt) => {
                    consecutive_failures = 0;
                    shared.dispatch_one(pkt);
                }
                Err(Error::Timeout { .. }) => {
                    // Nothing arrived this poll; not a transient failure.
                }
                Err(Error::Disconnected { .. }) => {
                    warn!("device disconnected, tearing down session");
                    break;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        "transient read-loop error ({e}), {consecutive_failures}/{MAX_CONSECUTIVE_FAILURES}"
                    );
                    if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                        warn!("read loop exceeded its error-recovery budget, disconnecting");
                        break;
                    }
                    thread::sleep(TRANSIENT_PAUSE);
                }
            }
        }
        *shared.running.lock().unwrap() = false;
        let mut state = shared.state.lock().unwrap();
        state.connected = false;
        for stream in state.streams.values_mut() {
            stream.closed = true;
        }
        drop(state);
        shared.cv.notify_all();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn test_host_key() -> Arc<HostKey> {
        struct MemStore;
        impl crate::auth::KeyStore for MemStore {
            fn load_key(&self) -> Result<Option<(String, String)>> {
                Ok(None)
            }
            fn store_key(&self, _p: &str, _u: &str) -> Result<()> {
                Ok(())
            }
        }
        Arc::new(HostKey::load_or_generate(&MemStore).unwrap())
    }

    fn device_cnxn(product: &str, model: &str, serial: &str, max_payload: u32) -> Packet {
        let payload = format!(
            "device::ro.product.name={product};ro.product.model={model};ro.serialno={serial}\0"
        );
        Packet::new(A_CNXN, PROTOCOL_VERSION, max_payload, payload.into_bytes())
    }

    #[test]
    fn s1_handshake_with_preapproved_key() {
        let mock = MockTransport::new(vec![device_cnxn("x", "y", "Z", 0x40000)]);
        let (session, info) = Session::connect(Box::new(mock), test_host_key()).unwrap();
        assert_eq!(info.serial, "Z");
        assert_eq!(info.product, "x");
        assert_eq!(info.model, "y");
        assert_eq!(session.shared.state.lock().unwrap().max_payload, 0x40000);
        session.disconnect();
    }

    #[test]
    fn s3_auth_rejected_cleans_up_the_session() {
        let host_key = test_host_key();
        let token = [9u8; 20];
        let mock = MockTransport::new(vec![
            Packet::new(A_AUTH, AUTH_TOKEN, 0, token.to_vec()),
            Packet::new(A_AUTH, AUTH_TOKEN, 0, token.to_vec()),
            Packet::new(A_AUTH, AUTH_TOKEN, 0, token.to_vec()),
        ]);
        let err = Session::connect(Box::new(mock), host_key).unwrap_err();
        assert!(matches!(err, Error::AuthRejected { .. }));
    }

    /// An unrecognised key: the device challenges twice (the host signs the
    /// first token, the device issues a fresh token rather than accepting
    /// it) before the host falls back to sending its public key, which the
    /// device then accepts with a CNXN (spec §4.D, §8 S2).
    #[test]
    fn s2_handshake_with_new_key_signs_and_sends_pubkey() {
        use rsa::pkcs1v15::{Signature, VerifyingKey};
        use rsa::signature::hazmat::PrehashVerifier;
        use sha1::Sha1;

        let host_key = test_host_key();
        let token1 = [3u8; 20];
        let token2 = [4u8; 20];
        let mock = MockTransport::new(vec![
            Packet::new(A_AUTH, AUTH_TOKEN, 0, token1.to_vec()),
            Packet::new(A_AUTH, AUTH_TOKEN, 0, token2.to_vec()),
            device_cnxn("x", "y", "Z", 0x40000),
        ]);
        let sent = mock.outbound_handle();
        let (session, info) = Session::connect(Box::new(mock), Arc::clone(&host_key)).unwrap();
        assert_eq!(info.serial, "Z");

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].command, A_CNXN);
        assert_eq!(sent[1].command, A_AUTH);
        assert_eq!(sent[1].arg0, AUTH_SIGNATURE);
        assert_eq!(sent[2].command, A_AUTH);
        assert_eq!(sent[2].arg0, AUTH_RSAPUBLICKEY);

        // The first reply's signature must verify against the stored
        // modulus for the token the device actually challenged with.
        let verifying_key = VerifyingKey::<Sha1>::new(host_key.to_public_key());
        let signature = Signature::try_from(sent[1].payload.as_slice()).unwrap();
        verifying_key.verify_prehash(&token1, &signature).unwrap();
        drop(sent);

        session.disconnect();
    }
}
