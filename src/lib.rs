//! Host-side client for the Android Debug Bridge (ADB) wire protocol
//! carried over a USB bulk endpoint pair.
//!
//! The crate is the ADB protocol engine only: wire framing ([`packet`]),
//! USB transport ([`usb`]), RSA authentication ([`auth`]), the CNXN/AUTH
//! handshake and read loop ([`session`]), and the OPEN/OKAY/WRTE/CLSE
//! stream multiplexer ([`stream`]). The interactive UI, persistent
//! selection lists, clipboard/file import-export, log panels, and the
//! USB device-picker dialog are external collaborators this crate does
//! not implement.

pub mod auth;
pub mod diagnostics;
pub mod error;
pub mod packet;
pub mod session;
pub mod stream;
pub mod transport;
pub mod usb;
pub mod util;

use std::sync::Arc;
use std::time::{Duration, Instant};

use error::Result;

pub use auth::{HostKey, KeyStore};
pub use diagnostics::Diagnostics;
pub use error::Error;
pub use session::ConnectInfo;
pub use usb::UsbTransport;
pub use util::config::FileKeyStore;

/// How long a single `pm`/shell helper call waits for the device to
/// finish and close its stream before returning what it has collected
/// (spec §4.E, "Collection semantics").
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// The Caller API exposed upward to a higher-level UI (spec §6).
///
/// `AdbHost` owns one connected [`session::Session`] at a time. All
/// operations are synchronous from the caller's point of view; the
/// session's read loop and flow-control bookkeeping run on a dedicated
/// background thread (spec §5).
pub struct AdbHost {
    session: Option<session::Session>,
}

impl AdbHost {
    pub fn new() -> Self {
        Self { session: None }
    }

    /// `connect(device)`: drive the USB claim, CNXN/AUTH handshake, and
    /// spawn the read loop. The host key is loaded from `key_store`,
    /// generating and persisting a new RSA-2048 pair on first ever
    /// connect (spec §3 "Host Key" lifecycle).
    pub fn connect(
        &mut self,
        transport: Box<dyn transport::PacketTransport>,
        key_store: &dyn KeyStore,
    ) -> Result<ConnectInfo> {
        let host_key = Arc::new(HostKey::load_or_generate(key_store)?);
        let (session, info) = session::Session::connect(transport, host_key)?;
        self.session = Some(session);
        Ok(info)
    }

    /// Convenience wrapper that opens the `device_index`-th USB device
    /// exposing the ADB interface and connects over it (spec §4.B/§6).
    pub fn connect_usb(&mut self, device_index: usize, key_store: &dyn KeyStore) -> Result<ConnectInfo> {
        let transport = UsbTransport::open(device_index)?;
        self.connect(Box::new(transport), key_store)
    }

    /// `disconnect()`: process-wide cancellation (spec §5). Idempotent —
    /// calling it with no active session is a no-op.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.disconnect();
        }
    }

    fn shared(&self) -> Result<&Arc<session::SessionShared>> {
        self.session
            .as_ref()
            .map(|s| &s.shared)
            .ok_or_else(|| Error::Disconnected {
                diagnostics: Diagnostics::disconnected(),
            })
    }

    /// `run_shell(cmd) -> string`: open a `shell:` stream, collect until
    /// close or the default deadline, return the output as text (spec
    /// §4.E "Shell command helpers").
    pub fn run_shell(&self, cmd: &str) -> Result<String> {
        let shared = self.shared()?;
        let deadline = Instant::now() + DEFAULT_COMMAND_TIMEOUT;
        stream::run_shell(shared, cmd, deadline)
    }

    /// `list_packages() -> sorted list of package ids`: `pm list
    /// packages`, parsed from `package:<id>` lines (spec §4.E).
    pub fn list_packages(&self) -> Result<Vec<String>> {
        let output = self.run_shell("pm list packages")?;
        let mut packages: Vec<String> = output
            .lines()
            .filter_map(|line| line.strip_prefix("package:"))
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        packages.sort();
        packages.dedup();
        Ok(packages)
    }

    /// `disable_package`: `pm disable-user --user 0 PKG` (spec §4.E).
    pub fn disable_package(&self, package: &str) -> Result<String> {
        self.run_shell(&format!("pm disable-user --user 0 {package}"))
    }

    /// `enable_package`: `pm enable PKG` (spec §4.E).
    pub fn enable_package(&self, package: &str) -> Result<String> {
        self.run_shell(&format!("pm enable {package}"))
    }

    /// `uninstall_package`: `pm uninstall --user 0 PKG` (spec §4.E).
    pub fn uninstall_package(&self, package: &str) -> Result<String> {
        self.run_shell(&format!("pm uninstall --user 0 {package}"))
    }

    /// `diagnostics()`: a snapshot including the last 50 packets from the
    /// log (spec §6).
    pub fn diagnostics(&self) -> Diagnostics {
        match &self.session {
            Some(session) => session.diagnostics(),
            None => Diagnostics::disconnected(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

impl Default for AdbHost {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{A_CNXN, A_CLSE, A_OKAY, A_WRTE, PROTOCOL_VERSION};
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

    #[test]
    fn list_packages_parses_package_lines_and_sorts_them() {
        let device_cnxn = packet::Packet::new(
            A_CNXN,
            PROTOCOL_VERSION,
            0x4000_0000,
            b"device::ro.serialno=Z\0".to_vec(),
        );
        let mock = MockTransport::new(vec![device_cnxn]);
        let mut host = AdbHost::new();
        host.connect(Box::new(mock), &MemStore).unwrap();

        // Drive the open/collect exchange by hand against the shared
        // session state, as the read loop thread would from real frames.
        let shared = Arc::clone(&host.session.as_ref().unwrap().shared);
        let worker = std::thread::spawn(move || host.list_packages());

        // Poll until the open() call has registered its stream, then
        // answer it the way a device would.
        let local_id = loop {
            let state = shared.state.lock().unwrap();
            if let Some((&id, _)) = state.streams.iter().next() {
                break id;
            }
            drop(state);
            std::thread::sleep(Duration::from_millis(5));
        };
        shared.dispatch_one(packet::Packet::control(A_OKAY, 42, local_id));
        shared.dispatch_one(packet::Packet::new(
            A_WRTE,
            42,
            local_id,
            b"package:com.b\npackage:com.a\npackage:com.a\n".to_vec(),
        ));
        shared.dispatch_one(packet::Packet::control(A_CLSE, 42, local_id));

        let packages = worker.join().unwrap().unwrap();
        assert_eq!(packages, vec!["com.a".to_string(), "com.b".to_string()]);
    }
}
