// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Based on the Renesas RA family standard boot firmware system
// specification (R01AN5372).
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Renesas RA boot firmware interface library
//!
//! This is a library to drive the standard boot firmware of Renesas
//! RA microcontrollers over a serial link (USB-CDC or raw UART):
//! memory layout discovery, authentication, erase, read, write,
//! verify, CRC, and lifecycle management (DLM, TrustZone boundaries,
//! id-code protection, wrapped keys).
//!
//! # Tested with the following device groups
//!
//! - RA4M2 / RA6M4 / RA6M5 (Cortex-M33)
//! - RA8M1 (Cortex-M85)
//!
//! # See also
//!
//! - Renesas, *System Specifications for Standard Boot Firmware*
//!   (R01AN5372).

use std::{fmt, thread, time::Duration};

use serial::SerialPort;

#[rustfmt::skip]
pub mod constants;
pub mod area;
pub mod dlm;
pub mod packet;
pub mod ports;
pub mod records;
pub mod transport;
pub mod util;

mod error;
mod family;

pub use self::area::{Area, AreaTable, AreaType, Operation};
pub use self::dlm::{DlmState, KeySlot};
pub use self::error::Error;
pub use self::family::Family;
pub use self::transport::{best_rate, port_settings, Transport};

use self::constants::*;

/// Device signature as reported by the signature command.
#[derive(Debug, Clone)]
pub struct Signature {
    /// Recommended maximum line rate in bps.
    pub max_baud: u32,
    /// Number of memory areas the device reports.
    pub area_count: u8,
    /// Device-group code, same alphabet as the handshake boot code.
    pub boot_code: u8,
    /// Boot firmware version, major/minor/patch.
    pub boot_version: [u8; 3],
    /// Unique device id.
    pub device_id: [u8; 16],
    /// Product name, trimmed of its space padding.
    pub product: String,
}

impl Signature {
    /// Byte length of a signature reply payload.
    pub const LEN: usize = 41;

    /// Decode a 41-byte signature reply payload:
    /// RMB(4) NOA(1) TYP(1) BFV(3) DID(16) PTN(16).
    pub fn decode(payload: &[u8]) -> Result<Signature, Error> {
        if payload.len() != Self::LEN {
            return Err(Error::Protocol(format!(
                "signature reply is {} bytes, expected {}",
                payload.len(),
                Self::LEN
            )));
        }

        let mut boot_version = [0u8; 3];
        boot_version.copy_from_slice(&payload[6..9]);
        let mut device_id = [0u8; 16];
        device_id.copy_from_slice(&payload[9..25]);

        Ok(Signature {
            max_baud: u32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]),
            area_count: payload[4],
            boot_code: payload[5],
            boot_version,
            device_id,
            product: String::from_utf8_lossy(&payload[25..41])
                .trim_end_matches(|c: char| {
                    c == ' ' || c == '\0'
                })
                .to_string(),
        })
    }

    /// Boot firmware version as `major.minor.patch`.
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            self.boot_version[0], self.boot_version[1],
            self.boot_version[2]
        )
    }
}

/// TrustZone boundary settings, all fields in KB.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Boundary {
    /// Secure code flash size.
    pub cfs1: u16,
    /// Secure + non-secure-callable code flash size.
    pub cfs2: u16,
    /// Secure data flash size.
    pub dfs: u16,
    /// Secure SRAM size.
    pub srs1: u16,
    /// Secure + non-secure-callable SRAM size.
    pub srs2: u16,
}

impl Boundary {
    /// Byte length of a boundary reply payload.
    pub const LEN: usize = 10;

    /// Decode a 10-byte boundary reply payload, five big-endian
    /// 16-bit KB counts.
    pub fn decode(payload: &[u8]) -> Result<Boundary, Error> {
        if payload.len() != Self::LEN {
            return Err(Error::Protocol(format!(
                "boundary reply is {} bytes, expected {}",
                payload.len(),
                Self::LEN
            )));
        }

        let be16 =
            |off: usize| u16::from_be_bytes([payload[off], payload[off + 1]]);

        Ok(Boundary {
            cfs1: be16(0),
            cfs2: be16(2),
            dfs: be16(4),
            srs1: be16(6),
            srs2: be16(8),
        })
    }

    /// Encode for the boundary-set command.
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut payload = [0u8; Self::LEN];
        payload[0..2].copy_from_slice(&self.cfs1.to_be_bytes());
        payload[2..4].copy_from_slice(&self.cfs2.to_be_bytes());
        payload[4..6].copy_from_slice(&self.dfs.to_be_bytes());
        payload[6..8].copy_from_slice(&self.srs1.to_be_bytes());
        payload[8..10].copy_from_slice(&self.srs2.to_be_bytes());
        payload
    }
}

/// A connected RA device running the standard boot firmware.
pub struct Device<P> {
    link: Transport<P>,
    family: Family,
    signature: Signature,
    areas: AreaTable,
    authenticated: bool,
    terminal: bool,
}

impl<P> Device<P>
where
    P: SerialPort,
{
    /// Open a session on an already opened port.
    ///
    /// Programs the initial 9600 bps line, runs the sync handshake
    /// (tolerating a device that is still in command mode from an
    /// earlier session), reads the signature and discovers the
    /// memory areas.
    ///
    /// # Note
    ///
    /// This function expects the device to be in boot mode already;
    /// reset it with the MD pin held or use [`enter_boot_mode`] on
    /// boards that wire MD and !RESET to the adapter.
    pub fn connect(port: P, uart: bool) -> Result<Self, Error> {
        let mut link = Transport::new(port, uart)?;

        handshake(&mut link)?;

        let payload =
            request_on(&mut link, CMD_SIGNATURE, &[], TIMEOUT_FIRST_MS)?;
        let signature = Signature::decode(&payload)?;
        let family = Family::from_boot_code(signature.boot_code)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "unknown device group code {:#04X}",
                    signature.boot_code
                ))
            })?;

        let mut areas = AreaTable::new();
        for slot in 0..signature.area_count.min(area::AREA_SLOTS as u8) {
            let payload = request_on(
                &mut link,
                CMD_AREA_INFO,
                &[slot],
                TIMEOUT_FIRST_MS,
            )?;
            areas.push(Area::decode(&payload)?)?;
        }

        log::debug!(
            "connected to {} ({}), boot firmware {}, {} areas",
            family,
            family.core_name(),
            signature.version_string(),
            areas.len()
        );

        Ok(Device {
            link,
            family,
            signature,
            areas,
            authenticated: false,
            terminal: false,
        })
    }

    /// Returns the `Family` of the device.
    pub fn family(&self) -> Family {
        self.family
    }

    /// The signature read during connect.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The memory areas discovered during connect.
    pub fn areas(&self) -> &AreaTable {
        &self.areas
    }

    /// Whether an id authentication succeeded in this session.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Current line rate in bps.
    pub fn baud_rate(&self) -> u32 {
        self.link.rate()
    }

    fn request(
        &mut self,
        cmd: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.request_timeout(cmd, payload, TIMEOUT_FIRST_MS)
    }

    fn request_timeout(
        &mut self,
        cmd: u8,
        payload: &[u8],
        first_timeout_ms: u64,
    ) -> Result<Vec<u8>, Error> {
        self.guard()?;
        request_on(&mut self.link, cmd, payload, first_timeout_ms)
    }

    fn guard(&self) -> Result<(), Error> {
        if self.terminal {
            return Err(Error::Protocol(
                "boot interface is locked, session is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Probe the command channel with an empty inquire command.
    pub fn inquire(&mut self) -> Result<(), Error> {
        self.request(CMD_INQUIRE, &[])?;
        Ok(())
    }

    /// Authenticate with a 16-byte id code.
    ///
    /// Devices that never had an id programmed answer with
    /// `ERR_PCKT` (`0xC1`); deciding to treat that as "no
    /// authentication needed" is up to the caller.
    pub fn authenticate(&mut self, id_code: &[u8; 16]) -> Result<(), Error> {
        self.request(CMD_ID_AUTH, id_code)?;
        self.authenticated = true;

        log::debug!("id authentication accepted");

        Ok(())
    }

    /// Change the line rate on both ends.
    ///
    /// The device acknowledges at the old rate, retunes its UART, and
    /// expects the next command at the new rate.
    pub fn set_baud(&mut self, rate: u32) -> Result<(), Error> {
        self.request(CMD_BAUD, &rate.to_be_bytes())?;

        // The device needs a moment to retune before the next frame.
        thread::sleep(Duration::from_millis(1));

        self.link.set_rate(rate)
    }

    /// Raise the line rate to the best supported rate not exceeding
    /// `requested` or the signature's recommended maximum, verifying
    /// the new rate with an inquire round-trip. Falls back to
    /// 115200 bps when verification fails. Returns the rate in use.
    pub fn negotiate_baud(&mut self, requested: u32) -> Result<u32, Error> {
        let target =
            best_rate(requested.min(self.signature.max_baud));
        if target <= self.link.rate() {
            return Ok(self.link.rate());
        }

        self.set_baud(target)?;
        if self.inquire().is_err() {
            log::warn!(
                "no reply at {} bps, falling back to {} bps",
                target,
                FALLBACK_BAUD
            );
            self.set_baud(FALLBACK_BAUD)?;
            self.inquire()?;
            return Ok(FALLBACK_BAUD);
        }

        log::debug!("negotiated {} bps", target);

        Ok(target)
    }

    /// Read the current lifecycle state.
    ///
    /// # Panics
    ///
    /// This function panics if the family has no DLM state machine.
    pub fn dlm_state(&mut self) -> Result<DlmState, Error> {
        if !self.family.supports_dlm() {
            panic!("DLM commands are not supported on this device group");
        }

        let payload = self.request(CMD_DLM_STATE, &[])?;
        let code = payload.first().copied().ok_or_else(|| {
            Error::Protocol("empty DLM state reply".to_string())
        })?;

        DlmState::from_code(code).ok_or_else(|| {
            Error::Protocol(format!("unknown DLM state {:#04X}", code))
        })
    }

    /// Request a lifecycle transition that needs no key.
    ///
    /// The transition is validated against the device's current state
    /// before anything is sent. A transition into `LCK_BOOT` locks
    /// the boot interface: the command is sent, a missing reply is
    /// tolerated, and the session refuses further commands.
    pub fn dlm_transit(&mut self, target: DlmState) -> Result<(), Error> {
        if !self.family.supports_dlm() {
            panic!("DLM commands are not supported on this device group");
        }

        let current = self.dlm_state()?;
        if !dlm::can_transit(current, target, false) {
            return Err(Error::Protocol(format!(
                "lifecycle transition {} -> {} requires authentication \
                 or is not allowed",
                current, target
            )));
        }

        self.transit(CMD_DLM_TRANSIT, &[target.code()], target)
    }

    /// Request a key-authenticated lifecycle transition.
    pub fn dlm_transit_auth(
        &mut self,
        target: DlmState,
        key: &[u8; 16],
    ) -> Result<(), Error> {
        if !self.family.supports_dlm() {
            panic!("DLM commands are not supported on this device group");
        }

        let current = self.dlm_state()?;
        if !dlm::can_transit(current, target, true) {
            return Err(Error::Protocol(format!(
                "lifecycle transition {} -> {} is not allowed",
                current, target
            )));
        }

        let mut payload = [0u8; 17];
        payload[0] = target.code();
        payload[1..].copy_from_slice(key);

        self.transit(CMD_DLM_AUTH_TRANSIT, &payload, target)
    }

    fn transit(
        &mut self,
        cmd: u8,
        payload: &[u8],
        target: DlmState,
    ) -> Result<(), Error> {
        if !target.is_terminal() {
            self.request(cmd, payload)?;
            return Ok(());
        }

        // The boot interface goes silent once the lock takes effect;
        // tolerate a missing reply but not an explicit refusal.
        self.guard()?;
        self.link.send(&packet::pack(cmd, payload, false)?)?;
        match read_reply_on(&mut self.link, TIMEOUT_FIRST_MS) {
            Ok(_) | Err(Error::Timeout) => {}
            Err(e) => return Err(e),
        }
        self.terminal = true;

        log::info!("boot interface locked, closing session");

        Ok(())
    }

    /// Read the TrustZone boundary settings.
    ///
    /// # Panics
    ///
    /// This function panics if the family has no TrustZone.
    pub fn boundary(&mut self) -> Result<Boundary, Error> {
        if !self.family.supports_boundary() {
            panic!(
                "boundary commands are not supported on this device group"
            );
        }

        let payload = self.request(CMD_BOUNDARY, &[])?;
        Boundary::decode(&payload)
    }

    /// Program the TrustZone boundary settings.
    pub fn set_boundary(&mut self, boundary: &Boundary) -> Result<(), Error> {
        if !self.family.supports_boundary() {
            panic!(
                "boundary commands are not supported on this device group"
            );
        }

        self.request(CMD_BOUNDARY_SET, &boundary.encode())?;
        Ok(())
    }

    /// Whether serial programming is enabled in the device parameters.
    pub fn serial_programming(&mut self) -> Result<bool, Error> {
        let payload = self.request(CMD_PARAM, &[])?;
        Ok(payload.first().copied().unwrap_or(0) != 0)
    }

    /// Enable or disable serial programming.
    ///
    /// # Note
    ///
    /// Disabling locks this tool out after the next reset; only the
    /// initialize command (on devices that still allow it) undoes it.
    pub fn set_serial_programming(
        &mut self,
        enable: bool,
    ) -> Result<(), Error> {
        self.request(CMD_PARAM_SET, &[enable as u8])?;
        Ok(())
    }

    /// Factory-initialize the device, erasing all user areas and
    /// protection settings.
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.request_timeout(CMD_INITIALIZE, &[], TIMEOUT_LONG_MS)?;
        Ok(())
    }

    /// Inject a wrapped key into a typed slot.
    ///
    /// # Panics
    ///
    /// This function panics if the family does not take wrapped keys.
    pub fn set_key(&mut self, slot: KeySlot, key: &[u8]) -> Result<(), Error> {
        if !self.family.supports_key_injection() {
            panic!("key injection is not supported on this device group");
        }
        assert!(key.len() < MAX_PAYLOAD, "key material too large");

        let mut payload = Vec::with_capacity(key.len() + 1);
        payload.push(slot.code());
        payload.extend_from_slice(key);

        self.request(CMD_KEY_SET, &payload)?;
        Ok(())
    }

    /// Verify the key stored in a typed slot.
    pub fn verify_key(&mut self, slot: KeySlot) -> Result<(), Error> {
        if !self.family.supports_key_injection() {
            panic!("key injection is not supported on this device group");
        }

        self.request(CMD_KEY_VERIFY, &[slot.code()])?;
        Ok(())
    }

    /// Inject a wrapped key into a numbered user slot.
    pub fn set_user_key(&mut self, index: u8, key: &[u8]) -> Result<(), Error> {
        if !self.family.supports_key_injection() {
            panic!("key injection is not supported on this device group");
        }
        assert!(key.len() < MAX_PAYLOAD, "key material too large");

        let mut payload = Vec::with_capacity(key.len() + 1);
        payload.push(index);
        payload.extend_from_slice(key);

        self.request(CMD_USER_KEY_SET, &payload)?;
        Ok(())
    }

    /// Verify the key stored in a numbered user slot.
    pub fn verify_user_key(&mut self, index: u8) -> Result<(), Error> {
        if !self.family.supports_key_injection() {
            panic!("key injection is not supported on this device group");
        }

        self.request(CMD_USER_KEY_VERIFY, &[index])?;
        Ok(())
    }

    /// Erase the inclusive address range in one command.
    ///
    /// `start` and `end` must already sit on erase-unit boundaries;
    /// see [`util::erase_range`] for the area-aware wrapper.
    pub fn erase(&mut self, start: u32, end: u32) -> Result<(), Error> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&start.to_be_bytes());
        payload[4..].copy_from_slice(&end.to_be_bytes());

        self.request_timeout(CMD_ERASE, &payload, TIMEOUT_LONG_MS)?;
        Ok(())
    }

    /// Ask the device for the CRC-32 (IEEE 802.3) of the inclusive
    /// address range.
    pub fn crc(&mut self, start: u32, end: u32) -> Result<u32, Error> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&start.to_be_bytes());
        payload[4..].copy_from_slice(&end.to_be_bytes());

        let reply =
            self.request_timeout(CMD_CRC, &payload, TIMEOUT_LONG_MS)?;
        if reply.len() != 4 {
            return Err(Error::Protocol(format!(
                "CRC reply is {} bytes, expected 4",
                reply.len()
            )));
        }

        Ok(u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]))
    }

    /// Open a streamed read of the inclusive address range. The
    /// device answers with one data frame per call to
    /// [`Device::read_chunk`].
    pub fn read_request(&mut self, start: u32, end: u32) -> Result<(), Error> {
        self.guard()?;

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&start.to_be_bytes());
        payload[4..].copy_from_slice(&end.to_be_bytes());

        self.link.send(&packet::pack(CMD_READ, &payload, false)?)
    }

    /// Receive the next data frame of a streamed read and acknowledge
    /// it, keeping the device's sequencer in step.
    pub fn read_chunk(&mut self) -> Result<Vec<u8>, Error> {
        let (cmd, data) = read_reply_on(&mut self.link, TIMEOUT_FIRST_MS)?;
        if cmd != CMD_READ {
            return Err(Error::Protocol(format!(
                "reply {:#04X} inside a read flow",
                cmd
            )));
        }

        self.link.send(&packet::pack(CMD_READ, &[0x00], true)?)?;

        Ok(data)
    }

    /// Open a streamed write of the inclusive address range, waiting
    /// for the device to accept it.
    pub fn write_request(&mut self, start: u32, end: u32) -> Result<(), Error> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&start.to_be_bytes());
        payload[4..].copy_from_slice(&end.to_be_bytes());

        self.request(CMD_WRITE, &payload)?;
        Ok(())
    }

    /// Send one chunk of a streamed write and wait for its ack. The
    /// wire always carries exactly 1024 payload bytes; a short final
    /// chunk is zero-padded.
    ///
    /// # Panics
    ///
    /// This function panics if `data` exceeds the chunk size.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
        assert!(data.len() <= CHUNK_SIZE, "write chunk too large");

        self.guard()?;

        let mut payload = [0u8; CHUNK_SIZE];
        payload[..data.len()].copy_from_slice(data);

        self.link.send(&packet::pack(CMD_WRITE, &payload, true)?)?;

        let (cmd, _) = read_reply_on(&mut self.link, TIMEOUT_LONG_MS)?;
        if cmd != CMD_WRITE {
            return Err(Error::Protocol(format!(
                "reply {:#04X} inside a write flow",
                cmd
            )));
        }

        Ok(())
    }

    /// Close the session. A UART session whose rate was raised sends
    /// a best-effort baud command restoring 9600 bps first, so the
    /// next open can resync.
    pub fn close(mut self) {
        self.restore_baud();
    }

    fn restore_baud(&mut self) {
        if self.link.is_uart()
            && self.link.rate() > INITIAL_BAUD
            && !self.terminal
        {
            if let Err(e) = self.set_baud(INITIAL_BAUD) {
                log::debug!("baud restore on close failed: {}", e);
            }
        }
    }
}

impl<P> fmt::Debug for Device<P>
where
    P: SerialPort,
{
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Device")
            .field("family", &self.family)
            .field("areas", &self.areas)
            .field("authenticated", &self.authenticated)
            .field("port", &())
            .finish()
    }
}

/// Run the connection handshake on a fresh link.
///
/// A device still in command mode answers the inquire probe with a
/// full reply frame which is drained; a device waiting for sync is
/// aligned with sync bytes and confirmed with the generic code.
fn handshake<P>(link: &mut Transport<P>) -> Result<(), Error>
where
    P: SerialPort,
{
    link.send(&packet::pack(CMD_INQUIRE, &[], false)?)?;

    let mut byte = [0u8; 1];
    let n = link.recv(&mut byte, TIMEOUT_FIRST_MS)?;
    if n == 1 && byte[0] == SOD_REPLY {
        // Already in command mode: consume the rest of the reply.
        let mut hdr = [0u8; 2];
        link.recv_exact(&mut hdr, TIMEOUT_NEXT_MS)?;
        let len = u16::from_be_bytes(hdr) as usize;
        if len == 0 || len - 1 > MAX_PAYLOAD {
            return Err(Error::Framing("length field out of range"));
        }
        let mut rest = vec![0u8; len + 2];
        link.recv_exact(&mut rest, TIMEOUT_NEXT_MS)?;

        log::debug!("device already in command mode");
        return Ok(());
    }

    let mut tries = 0;
    loop {
        link.send(&[SYNC, SYNC, SYNC])?;
        let n = link.recv(&mut byte, TIMEOUT_FIRST_MS)?;
        if n == 1 && byte[0] == SYNC {
            break;
        }

        tries += 1;
        if tries >= HANDSHAKE_RETRIES {
            return Err(Error::Protocol(
                "no sync reply from the boot firmware".to_string(),
            ));
        }
        log::trace!("sync retry #{}", tries);
    }

    let mut tries = 0;
    loop {
        link.send(&[GENERIC_CODE])?;
        let n = link.recv(&mut byte, TIMEOUT_FIRST_MS)?;
        if n == 1 {
            if Family::from_boot_code(byte[0]).is_none() {
                return Err(Error::Protocol(format!(
                    "unexpected boot code {:#04X}",
                    byte[0]
                )));
            }

            log::debug!("boot code confirmed: {:#04X}", byte[0]);
            return Ok(());
        }

        tries += 1;
        if tries >= HANDSHAKE_RETRIES {
            return Err(Error::Protocol(
                "boot code confirmation timed out".to_string(),
            ));
        }
        log::trace!("boot code retry #{}", tries);
    }
}

fn read_reply_on<P>(
    link: &mut Transport<P>,
    first_timeout_ms: u64,
) -> Result<(u8, Vec<u8>), Error>
where
    P: SerialPort,
{
    let mut sod = [0u8; 1];
    if link.recv(&mut sod, first_timeout_ms)? == 0 {
        return Err(Error::Timeout);
    }

    let mut hdr = [0u8; 2];
    link.recv_exact(&mut hdr, TIMEOUT_NEXT_MS)?;
    let len = u16::from_be_bytes(hdr) as usize;
    if len == 0 || len - 1 > MAX_PAYLOAD {
        return Err(Error::Framing("length field out of range"));
    }

    // RCB, payload, checksum and ETX are still in flight.
    let mut rest = vec![0u8; len + 2];
    link.recv_exact(&mut rest, TIMEOUT_NEXT_MS)?;

    let mut frame = Vec::with_capacity(len + 5);
    frame.push(sod[0]);
    frame.extend_from_slice(&hdr);
    frame.extend_from_slice(&rest);

    packet::unpack(&frame)
}

fn request_on<P>(
    link: &mut Transport<P>,
    cmd: u8,
    payload: &[u8],
    first_timeout_ms: u64,
) -> Result<Vec<u8>, Error>
where
    P: SerialPort,
{
    link.send(&packet::pack(cmd, payload, false)?)?;

    let (rcb, data) = read_reply_on(link, first_timeout_ms)?;
    if rcb != cmd {
        return Err(Error::Protocol(format!(
            "reply {:#04X} does not match command {:#04X}",
            rcb, cmd
        )));
    }

    Ok(data)
}

/// Use the DTR and RTS lines to pulse the MD and !RESET pins so the
/// device comes out of reset in boot mode. This works on boards that
/// wire those pins to the adapter; others need the MD button held
/// through a reset.
///
/// # Parameters
///
/// - `inverted`: if `false` (default wiring) DTR drives MD and RTS
///   drives !RESET; if `true` it is the other way around.
pub fn enter_boot_mode<P>(port: &mut P, inverted: bool) -> serial::Result<()>
where
    P: SerialPort,
{
    fn set_md_pin<P: SerialPort>(
        port: &mut P,
        inverted: bool,
        level: bool,
    ) -> serial::Result<()> {
        if inverted {
            port.set_rts(level)
        } else {
            port.set_dtr(level)
        }
    }

    fn set_reset_pin<P: SerialPort>(
        port: &mut P,
        inverted: bool,
        level: bool,
    ) -> serial::Result<()> {
        if inverted {
            port.set_dtr(level)
        } else {
            port.set_rts(level)
        }
    }

    // MD is sampled while the device comes out of reset; hold it
    // asserted through the whole reset pulse.
    set_md_pin(port, inverted, true)?;
    set_reset_pin(port, inverted, false)?;
    set_reset_pin(port, inverted, true)?;
    set_reset_pin(port, inverted, false)?;
    #[cfg(not(test))]
    thread::sleep(Duration::from_millis(2));
    set_md_pin(port, inverted, false)?;

    Ok(())
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::{collections::VecDeque, io};

    pub struct MockPort {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        started: bool,
        rts_state: bool,
        dtr_state: bool,
    }

    impl MockPort {
        pub fn new() -> MockPort {
            MockPort {
                rx: VecDeque::new(),
                tx: Vec::new(),
                started: false,
                rts_state: false,
                dtr_state: false,
            }
        }

        /// Queue bytes the device will answer with. They become
        /// readable after the first write, so the open-time input
        /// drain does not consume them.
        pub fn script(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }

        /// Drain the captured transmit stream.
        pub fn take_tx(&mut self) -> Vec<u8> {
            std::mem::replace(&mut self.tx, Vec::new())
        }
    }

    impl Device<MockPort> {
        pub fn port_script(&mut self, bytes: &[u8]) {
            self.link.port_mut().script(bytes);
        }

        pub fn port_take_tx(&mut self) -> Vec<u8> {
            self.link.port_mut().take_tx()
        }
    }

    impl io::Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.started || self.rx.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "mock timeout",
                ));
            }

            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl io::Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.started = true;
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialPort for MockPort {
        fn timeout(&self) -> Duration {
            unreachable!()
        }
        fn set_timeout(&mut self, _timeout: Duration) -> serial::Result<()> {
            Ok(())
        }
        fn configure(
            &mut self,
            _settings: &serial::PortSettings,
        ) -> serial::Result<()> {
            Ok(())
        }
        fn reconfigure(
            &mut self,
            _setup: &dyn Fn(
                &mut dyn serial::SerialPortSettings,
            ) -> serial::Result<()>,
        ) -> serial::Result<()> {
            unreachable!()
        }
        fn set_rts(&mut self, level: bool) -> serial::Result<()> {
            self.rts_state = level;
            Ok(())
        }
        fn set_dtr(&mut self, level: bool) -> serial::Result<()> {
            self.dtr_state = level;
            Ok(())
        }
        fn read_cts(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_dsr(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_ri(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
        fn read_cd(&mut self) -> serial::Result<bool> {
            unreachable!()
        }
    }

    pub fn reply(cmd: u8, payload: &[u8]) -> Vec<u8> {
        packet::pack(cmd, payload, true).unwrap()
    }

    pub fn sig_payload() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&1_500_000u32.to_be_bytes());
        p.push(2); // areas
        p.push(BOOT_CODE_CM33);
        p.extend_from_slice(&[1, 0, 9]);
        p.extend_from_slice(&[0xA5; 16]);
        p.extend_from_slice(b"RA6M4 MOCK      ");
        p
    }

    pub fn area_payload(
        koa: u8,
        start: u32,
        end: u32,
        eau: u32,
        wau: u32,
        rau: u32,
        cau: u32,
    ) -> Vec<u8> {
        let mut p = vec![koa];
        for value in &[start, end, eau, wau, rau, cau] {
            p.extend_from_slice(&value.to_be_bytes());
        }
        p
    }

    /// The canned byte stream a fresh mock device answers the whole
    /// connect sequence with.
    fn connect_script() -> Vec<u8> {
        let mut rx = Vec::new();
        rx.push(SYNC); // inquire probe answered with a stray sync byte
        rx.push(SYNC); // sync accepted
        rx.push(BOOT_CODE_CM33); // generic code confirmed
        rx.extend(reply(CMD_SIGNATURE, &sig_payload()));
        rx.extend(reply(
            CMD_AREA_INFO,
            &area_payload(0x00, 0, 0x0003_FFFF, 0x2000, 0x80, 1, 1),
        ));
        rx.extend(reply(
            CMD_AREA_INFO,
            &area_payload(0x10, 0x0800_0000, 0x0800_1FFF, 0x40, 4, 1, 4),
        ));
        rx
    }

    pub fn mock_device(uart: bool) -> Device<MockPort> {
        let mut port = MockPort::new();
        port.script(&connect_script());

        Device::connect(port, uart).unwrap()
    }

    fn script(device: &mut Device<MockPort>, bytes: &[u8]) {
        device.port_script(bytes);
    }

    fn sent(device: &mut Device<MockPort>) -> Vec<u8> {
        device.port_take_tx()
    }

    #[test]
    fn test_connect() {
        let mut device = mock_device(false);

        assert_eq!(device.family(), Family::Ra4M2Ra6);
        assert_eq!(device.signature().max_baud, 1_500_000);
        assert_eq!(device.signature().product, "RA6M4 MOCK");
        assert_eq!(device.signature().version_string(), "1.0.9");
        assert_eq!(device.areas().len(), 2);
        assert!(!device.is_authenticated());

        // The whole connect sequence, byte for byte.
        let mut expected = Vec::new();
        expected
            .extend(packet::pack(CMD_INQUIRE, &[], false).unwrap());
        expected.extend(&[SYNC, SYNC, SYNC]);
        expected.push(GENERIC_CODE);
        expected
            .extend(packet::pack(CMD_SIGNATURE, &[], false).unwrap());
        expected
            .extend(packet::pack(CMD_AREA_INFO, &[0], false).unwrap());
        expected
            .extend(packet::pack(CMD_AREA_INFO, &[1], false).unwrap());
        assert_eq!(sent(&mut device), expected);
    }

    #[test]
    fn test_connect_already_in_command_mode() {
        let mut port = MockPort::new();
        let mut rx = Vec::new();
        // The inquire probe is answered with a full reply frame
        // instead of silence: mid-session device.
        rx.extend(reply(CMD_INQUIRE, &[0x00]));
        rx.extend(reply(CMD_SIGNATURE, &sig_payload()));
        rx.extend(reply(
            CMD_AREA_INFO,
            &area_payload(0x00, 0, 0x0003_FFFF, 0x2000, 0x80, 1, 1),
        ));
        rx.extend(reply(
            CMD_AREA_INFO,
            &area_payload(0x10, 0x0800_0000, 0x0800_1FFF, 0x40, 4, 1, 4),
        ));
        port.script(&rx);

        let device = Device::connect(port, false).unwrap();
        assert_eq!(device.family(), Family::Ra4M2Ra6);
    }

    #[test]
    fn test_connect_rejects_unknown_boot_code() {
        let mut port = MockPort::new();
        port.script(&[SYNC, SYNC, 0x42]);

        match Device::connect(port, false) {
            Err(Error::Protocol(msg)) => {
                assert!(msg.contains("boot code"), "{}", msg);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_authenticate() {
        let mut device = mock_device(false);

        script(&mut device, &reply(CMD_ID_AUTH, &[0x00]));
        device.authenticate(&[0x11; 16]).unwrap();
        assert!(device.is_authenticated());
    }

    #[test]
    fn test_authenticate_unprovisioned() {
        let mut device = mock_device(false);

        // An unprovisioned device refuses with ERR_PCKT; the session
        // surfaces it untouched.
        script(
            &mut device,
            &reply(CMD_ID_AUTH | STATUS_ERR, &[ERR_PACKET]),
        );
        match device.authenticate(&constants::ALL_ERASE_ID) {
            Err(Error::Mcu { cmd, code }) => {
                assert_eq!(cmd, CMD_ID_AUTH);
                assert_eq!(code, ERR_PACKET);
            }
            other => panic!("expected MCU error, got {:?}", other),
        }
        assert!(!device.is_authenticated());
    }

    #[test]
    fn test_erase_literal_bytes() {
        let mut device = mock_device(false);
        sent(&mut device);

        script(
            &mut device,
            &[0x81, 0x00, 0x02, 0x12, 0x00, 0xEC, 0x03],
        );
        device.erase(0x0000_0000, 0x0000_1FFF).unwrap();

        assert_eq!(
            sent(&mut device),
            vec![
                0x01, 0x00, 0x09, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x1F, 0xFF, 0xC7, 0x03,
            ]
        );
    }

    #[test]
    fn test_crc() {
        let mut device = mock_device(false);

        script(
            &mut device,
            &reply(CMD_CRC, &0xDEAD_BEEFu32.to_be_bytes()),
        );
        assert_eq!(device.crc(0, 0x1FFF).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_set_baud() {
        let mut device = mock_device(false);

        script(&mut device, &reply(CMD_BAUD, &[0x00]));
        device.set_baud(921_600).unwrap();
        assert_eq!(device.baud_rate(), 921_600);
    }

    #[test]
    fn test_negotiate_baud() {
        let mut device = mock_device(true);

        // Capped by the signature's recommended maximum (1.5 Mbps).
        script(&mut device, &reply(CMD_BAUD, &[0x00]));
        script(&mut device, &reply(CMD_INQUIRE, &[0x00]));
        assert_eq!(device.negotiate_baud(4_000_000).unwrap(), 1_500_000);
        assert_eq!(device.baud_rate(), 1_500_000);
    }

    #[test]
    fn test_negotiate_baud_fallback() {
        let mut device = mock_device(true);
        sent(&mut device);

        // Ack the first baud command, then go silent: verification
        // fails and the engine drops to the fallback rate.
        script(&mut device, &reply(CMD_BAUD, &[0x00]));
        assert!(device.negotiate_baud(4_000_000).is_err());

        let tx = sent(&mut device);
        let fallback =
            packet::pack(CMD_BAUD, &FALLBACK_BAUD.to_be_bytes(), false)
                .unwrap();
        assert!(tx.ends_with(&fallback));
    }

    #[test]
    fn test_dlm_state() {
        let mut device = mock_device(false);

        script(&mut device, &reply(CMD_DLM_STATE, &[0x02]));
        assert_eq!(device.dlm_state().unwrap(), DlmState::Ssd);
    }

    #[test]
    fn test_dlm_transit() {
        let mut device = mock_device(false);
        sent(&mut device);

        script(&mut device, &reply(CMD_DLM_STATE, &[0x02]));
        script(&mut device, &reply(CMD_DLM_TRANSIT, &[0x00]));
        device.dlm_transit(DlmState::Nsecsd).unwrap();

        let tx = sent(&mut device);
        let transit =
            packet::pack(CMD_DLM_TRANSIT, &[0x03], false).unwrap();
        assert!(tx.ends_with(&transit));
    }

    #[test]
    fn test_dlm_transit_rejected_locally() {
        let mut device = mock_device(false);

        // SSD -> CM is never allowed; nothing may reach the wire
        // beyond the state query.
        script(&mut device, &reply(CMD_DLM_STATE, &[0x02]));
        sent(&mut device);
        assert!(device.dlm_transit(DlmState::Cm).is_err());

        let tx = sent(&mut device);
        assert_eq!(
            tx,
            packet::pack(CMD_DLM_STATE, &[], false).unwrap()
        );
    }

    #[test]
    fn test_dlm_transit_terminal() {
        let mut device = mock_device(false);

        script(&mut device, &reply(CMD_DLM_STATE, &[0x04]));
        script(&mut device, &reply(CMD_DLM_TRANSIT, &[0x00]));
        device.dlm_transit(DlmState::LckBoot).unwrap();

        // The session is over; even an inquire must be refused
        // without touching the wire.
        sent(&mut device);
        assert!(matches!(device.inquire(), Err(Error::Protocol(_))));
        assert!(sent(&mut device).is_empty());
    }

    #[test]
    fn test_dlm_auth_transit() {
        let mut device = mock_device(false);
        sent(&mut device);

        script(&mut device, &reply(CMD_DLM_STATE, &[0x04]));
        script(&mut device, &reply(CMD_DLM_AUTH_TRANSIT, &[0x00]));
        device
            .dlm_transit_auth(DlmState::Ssd, &[0x5A; 16])
            .unwrap();

        let mut payload = vec![0x02];
        payload.extend_from_slice(&[0x5A; 16]);
        let expected =
            packet::pack(CMD_DLM_AUTH_TRANSIT, &payload, false).unwrap();
        assert!(sent(&mut device).ends_with(&expected));
    }

    #[test]
    fn test_boundary() {
        let mut device = mock_device(false);

        let boundary = Boundary {
            cfs1: 128,
            cfs2: 160,
            dfs: 4,
            srs1: 64,
            srs2: 96,
        };
        script(&mut device, &reply(CMD_BOUNDARY, &boundary.encode()));
        assert_eq!(device.boundary().unwrap(), boundary);

        sent(&mut device);
        script(&mut device, &reply(CMD_BOUNDARY_SET, &[0x00]));
        device.set_boundary(&boundary).unwrap();
        let expected =
            packet::pack(CMD_BOUNDARY_SET, &boundary.encode(), false)
                .unwrap();
        assert_eq!(sent(&mut device), expected);
    }

    #[test]
    fn test_keys() {
        let mut device = mock_device(false);
        sent(&mut device);

        script(&mut device, &reply(CMD_KEY_SET, &[0x00]));
        device.set_key(KeySlot::Rma, &[0x77; 16]).unwrap();

        let mut payload = vec![0x03];
        payload.extend_from_slice(&[0x77; 16]);
        assert_eq!(
            sent(&mut device),
            packet::pack(CMD_KEY_SET, &payload, false).unwrap()
        );

        script(&mut device, &reply(CMD_USER_KEY_VERIFY, &[0x00]));
        device.verify_user_key(5).unwrap();
        assert_eq!(
            sent(&mut device),
            packet::pack(CMD_USER_KEY_VERIFY, &[5], false).unwrap()
        );
    }

    #[test]
    fn test_close_restores_baud_on_uart() {
        let mut device = mock_device(true);

        script(&mut device, &reply(CMD_BAUD, &[0x00]));
        device.set_baud(921_600).unwrap();
        sent(&mut device);

        script(&mut device, &reply(CMD_BAUD, &[0x00]));
        device.restore_baud();

        assert_eq!(device.baud_rate(), INITIAL_BAUD);
        assert_eq!(
            sent(&mut device),
            packet::pack(CMD_BAUD, &INITIAL_BAUD.to_be_bytes(), false)
                .unwrap()
        );
    }

    #[test]
    fn test_close_skips_restore_on_usb() {
        let mut device = mock_device(false);

        script(&mut device, &reply(CMD_BAUD, &[0x00]));
        device.set_baud(921_600).unwrap();
        sent(&mut device);

        device.restore_baud();
        assert!(sent(&mut device).is_empty());
        assert_eq!(device.baud_rate(), 921_600);
    }

    #[test]
    fn test_signature_decode_rejects_short() {
        assert!(Signature::decode(&[0u8; 40]).is_err());
        assert!(Boundary::decode(&[0u8; 9]).is_err());
    }

    #[test]
    fn test_enter_boot_mode() {
        let mut port = MockPort::new();

        // The pins end at their idle levels whichever way the board
        // is wired.
        enter_boot_mode(&mut port, false).unwrap();
        assert_eq!(port.rts_state, false);
        assert_eq!(port.dtr_state, false);

        port.rts_state = false;
        port.dtr_state = false;

        enter_boot_mode(&mut port, true).unwrap();
        assert_eq!(port.rts_state, false);
        assert_eq!(port.dtr_state, false);
    }
}
