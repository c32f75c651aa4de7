//! Component B — the USB transport.
//!
//! Finds the ADB interface (class 0xFF, subclass 0x42, protocol 0x01),
//! claims it, and exposes a packet-oriented duplex over its bulk IN/OUT
//! endpoints, generalizing the teacher's single-configuration
//! `UsbTransport` with configuration/alternate-setting selection, the ZLP
//! termination rule, and outbound clear-halt-and-retry recovery (spec
//! §4.B).

use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use rusb::{Direction, TransferType, UsbContext};

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::packet::{decode_header, Packet, HEADER_LEN};
use crate::transport::PacketTransport;

/// Settle delay after selecting an alternate setting, before the device
/// is assumed ready (spec §4.B).
const ALT_SETTING_SETTLE: Duration = Duration::from_millis(50);

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_PAYLOAD: usize = 1 << 20;

/// Bound on consecutive bad-magic frames silently dropped before giving up
/// — real devices never send a long run of garbage, this just bounds the
/// resync loop.
const MAX_RESYNC_ATTEMPTS: usize = 64;

struct AdbInterfaceMatch {
    device: rusb::Device<rusb::Context>,
    config_value: u8,
    interface_number: u8,
    alt_setting: u8,
    ep_in: u8,
    ep_out: u8,
    ep_in_packet_size: u16,
    ep_out_packet_size: u16,
}

fn find_adb_interfaces(ctx: &rusb::Context) -> Result<Vec<AdbInterfaceMatch>> {
    let mut matches = Vec::new();
    let devices = ctx
        .devices()
        .map_err(|e| Error::internal(anyhow::anyhow!("listing USB devices: {e}")))?;

    for device in devices.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        for config_index in 0..device_desc.num_configurations() {
            let config = match device.config_descriptor(config_index) {
                Ok(c) => c,
                Err(_) => continue,
            };
            for iface in config.interfaces() {
                for setting in iface.descriptors() {
                    if setting.class_code() != 0xff
                        || setting.sub_class_code() != 0x42
                        || setting.protocol_code() != 0x01
                    {
                        continue;
                    }
                    let mut ep_in = None;
                    let mut ep_out = None;
                    for ep in setting.endpoint_descriptors() {
                        if ep.transfer_type() != TransferType::Bulk {
                            continue;
                        }
                        match ep.direction() {
                            Direction::In => ep_in = Some((ep.address(), ep.max_packet_size())),
                            Direction::Out => ep_out = Some((ep.address(), ep.max_packet_size())),
                        }
                    }
                    if let (Some((in_addr, in_size)), Some((out_addr, out_size))) = (ep_in, ep_out)
                    {
                        matches.push(AdbInterfaceMatch {
                            device: device.clone(),
                            config_value: config.number(),
                            interface_number: setting.interface_number(),
                            alt_setting: setting.setting_number(),
                            ep_in: in_addr,
                            ep_out: out_addr,
                            ep_in_packet_size: in_size,
                            ep_out_packet_size: out_size,
                        });
                    }
                }
            }
        }
    }
    Ok(matches)
}

/// A claimed USB duplex carrying ADB frames.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    ep_in: u8,
    ep_out: u8,
    ep_in_packet_size: u16,
    ep_out_packet_size: u16,
    timeout: Duration,
    max_payload: usize,
}

impl UsbTransport {
    /// Open the `device_index`-th USB device exposing the ADB interface
    /// descriptor, claiming it per the protocol in spec §4.B.
    pub fn open(device_index: usize) -> Result<Self> {
        let ctx = rusb::Context::new()
            .map_err(|e| Error::internal(anyhow::anyhow!("libusb init failed: {e}")))?;
        let mut candidates = find_adb_interfaces(&ctx)?;
        if candidates.is_empty() {
            return Err(Error::NoAdbInterface);
        }
        if device_index >= candidates.len() {
            return Err(Error::internal(anyhow::anyhow!(
                "device index {device_index} out of range ({} found)",
                candidates.len()
            )));
        }
        let chosen = candidates.remove(device_index);
        Self::claim(chosen)
    }

    fn claim(m: AdbInterfaceMatch) -> Result<Self> {
        let mut handle = m.device.open().map_err(map_claim_error)?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            handle.set_auto_detach_kernel_driver(true).ok();
        }

        let needs_config_switch = match m.device.active_config_descriptor() {
            Ok(active) => active.number() != m.config_value,
            Err(_) => true,
        };
        if needs_config_switch {
            handle
                .set_active_configuration(m.config_value)
                .map_err(map_claim_error)?;
        }

        handle
            .claim_interface(m.interface_number)
            .map_err(map_claim_error)?;

        if m.alt_setting != 0 {
            handle
                .set_alternate_setting(m.interface_number, m.alt_setting)
                .map_err(map_claim_error)?;
            thread::sleep(ALT_SETTING_SETTLE);
        }

        // Best-effort: a previous, uncleanly-terminated session may have
        // left an endpoint stalled.
        handle.clear_halt(m.ep_in).ok();
        handle.clear_halt(m.ep_out).ok();

        debug!(
            "claimed ADB interface {} (alt {}), ep_in={:#04x} ep_out={:#04x}",
            m.interface_number, m.alt_setting, m.ep_in, m.ep_out
        );

        Ok(UsbTransport {
            handle,
            ep_in: m.ep_in,
            ep_out: m.ep_out,
            ep_in_packet_size: m.ep_in_packet_size,
            ep_out_packet_size: m.ep_out_packet_size,
            timeout: DEFAULT_TIMEOUT,
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
    }

    /// Write one logical transfer, appending a zero-length packet if
    /// `data`'s length is a positive exact multiple of the OUT endpoint's
    /// max packet size (spec §4.B, the ZLP rule).
    fn write_transfer(&mut self, data: &[u8]) -> Result<()> {
        self.write_with_retry(data)?;
        if transfer_count(data.len(), self.ep_out_packet_size) > 1 {
            trace!("sending ZLP after {}-byte transfer", data.len());
            self.write_with_retry(&[])?;
        }
        Ok(())
    }

    fn write_with_retry(&mut self, data: &[u8]) -> Result<()> {
        match self.write_all_once(data) {
            Ok(()) => Ok(()),
            Err(rusb::Error::NoDevice) => Err(Error::Disconnected {
                diagnostics: Diagnostics::disconnected(),
            }),
            Err(e) => {
                warn!("transient USB write error ({e}), clearing halt and retrying once");
                self.handle.clear_halt(self.ep_out).ok();
                self.write_all_once(data).map_err(|e| match e {
                    rusb::Error::NoDevice => Error::Disconnected {
                        diagnostics: Diagnostics::disconnected(),
                    },
                    other => Error::internal(crate::error::InternalError::TransportTransient(other)),
                })
            }
        }
    }

    fn write_all_once(&mut self, data: &[u8]) -> std::result::Result<(), rusb::Error> {
        if data.is_empty() {
            // Explicit zero-length transfer (ZLP); an empty write_bulk call
            // still issues a transfer on the wire.
            self.handle.write_bulk(self.ep_out, &[], self.timeout)?;
            return Ok(());
        }
        let mut written = 0;
        while written < data.len() {
            let n = self
                .handle
                .write_bulk(self.ep_out, &data[written..], self.timeout)?;
            if n == 0 {
                return Err(rusb::Error::Io);
            }
            written += n;
        }
        Ok(())
    }

    fn read_exact_resilient(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut read = 0;
        while read < buf.len() {
            let chunk_len = (buf.len() - read).min(self.ep_in_packet_size.max(1) as usize);
            let n = self
                .handle
                .read_bulk(self.ep_in, &mut buf[read..read + chunk_len], self.timeout)
                .map_err(|e| match e {
                    rusb::Error::NoDevice => Error::Disconnected {
                        diagnostics: Diagnostics::disconnected(),
                    },
                    rusb::Error::Timeout => Error::Timeout {
                        diagnostics: Diagnostics::disconnected(),
                    },
                    other => Error::internal(crate::error::InternalError::TransportTransient(other)),
                })?;
            if n == 0 {
                return Err(Error::internal(anyhow::anyhow!(
                    "USB bulk read returned 0 bytes (stall or timeout)"
                )));
            }
            read += n;
        }
        Ok(())
    }
}

fn map_claim_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::Busy => Error::Busy,
        rusb::Error::NotFound | rusb::Error::NoDevice => Error::NoAdbInterface,
        other => Error::internal(anyhow::anyhow!("claiming ADB interface: {other}")),
    }
}

/// Whether a transfer of `len` bytes on an OUT endpoint with
/// `packet_size` needs a trailing zero-length packet: `len` must be a
/// positive exact multiple of `packet_size`, or the device reads the
/// transfer as still in progress (spec §4.B, the ZLP rule).
fn needs_zlp(len: usize, packet_size: u16) -> bool {
    len > 0 && packet_size > 0 && len % packet_size as usize == 0
}

/// Number of USB transfers `write_transfer` issues for a `len`-byte write
/// on an OUT endpoint with the given `packet_size`: the data transfer,
/// plus a ZLP transfer when `needs_zlp` holds (spec §8 S6).
fn transfer_count(len: usize, packet_size: u16) -> usize {
    if needs_zlp(len, packet_size) {
        2
    } else {
        1
    }
}

impl PacketTransport for UsbTransport {
    fn send_packet(&mut self, pkt: &Packet) -> Result<()> {
        let header = pkt.encode_header(self.max_payload)?;
        self.write_transfer(&header)?;
        if !pkt.payload.is_empty() {
            self.write_transfer(&pkt.payload)?;
        }
        Ok(())
    }

    fn recv_packet(&mut self) -> Result<Packet> {
        for _ in 0..MAX_RESYNC_ATTEMPTS {
            let mut header_buf = [0u8; HEADER_LEN];
            self.read_exact_resilient(&mut header_buf)?;
            let header = match decode_header(&header_buf) {
                Some(h) => h,
                None => {
                    warn!("dropping frame with bad magic, resynchronising");
                    continue;
                }
            };
            let mut payload = vec![0u8; header.payload_len];
            if header.payload_len > 0 {
                self.read_exact_resilient(&mut payload)?;
                // Devices emit an unverified checksum (spec §1 Non-goals);
                // we neither compute nor compare `header.payload_checksum`.
            }
            return Ok(Packet::new(header.command, header.arg0, header.arg1, payload));
        }
        Err(Error::internal(anyhow::anyhow!(
            "too many consecutive invalid frames"
        )))
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_exact_multiple_of_packet_size_gets_a_trailing_zlp() {
        assert_eq!(transfer_count(64, 64), 2);
        assert_eq!(transfer_count(128, 64), 2);
    }

    #[test]
    fn s6_short_transfer_needs_no_zlp() {
        assert_eq!(transfer_count(63, 64), 1);
        assert_eq!(transfer_count(65, 64), 1);
    }

    #[test]
    fn s6_empty_transfer_needs_no_zlp() {
        assert_eq!(transfer_count(0, 64), 1);
    }
}
