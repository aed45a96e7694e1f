//! Serial bootloader programmer and remote firmware updater.
//!
//! Frames are length prefixed and CRC suffixed (see [`frame`]), every frame is
//! answered with a single acknowledge byte, and application images are sent
//! in 250 byte chunks each acknowledged before the next is sent.

use core::marker::PhantomData;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod crc;
pub mod firmware;
pub mod frame;
pub mod monitor;
pub mod protocol;

#[cfg(test)]
pub(crate) mod mock;

use frame::{CrcScope, Frame, FrameError};
use protocol::*;

/// Byte transport to the bootloader, with control of the target reset line
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn assert_reset(&mut self) -> Result<(), E>;
    fn release_reset(&mut self) -> Result<(), E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Connected,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError: core::fmt::Debug> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("bootloader returned NACK")]
    Nack,

    #[error("unexpected acknowledge byte 0x{0:02x}")]
    InvalidAck(u8),

    #[error("no response within timeout")]
    ResponseTimeout,

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

    #[error("{0}")]
    Frame(FrameError),

    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("chunk {index} (offset {offset}) not acknowledged: {cause:?}")]
    ChunkNotAcknowledged {
        index: usize,
        offset: usize,
        cause: Box<Error<SerialError>>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl<SerialError: core::fmt::Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError: core::fmt::Debug> Error<SerialError> {
    /// Transport failures abort the session, everything else is a command failure
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Serial(_) => true,
            Error::ChunkNotAcknowledged { cause, .. } => cause.is_fatal(),
            _ => false,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device when starting the bootloader
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the reset line asserted
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub reset_pulse_ms: u32,

    /// Period to wait for bootloader init after a reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "200"))]
    pub init_delay_ms: u32,

    /// Period between handshake attempts while waiting for the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub handshake_retry_ms: u32,

    /// Delay between application chunks
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub chunk_delay_ms: u32,

    /// Check (and strip) a CRC on response bodies
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub verify_response_crc: bool,

    /// Bytes covered by the frame CRC (body, length-and-body)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "body"))]
    pub crc_scope: CrcScope,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            reset_pulse_ms: 10,
            init_delay_ms: 200,
            handshake_retry_ms: 500,
            chunk_delay_ms: 100,
            verify_response_crc: false,
            crc_scope: CrcScope::Body,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Check the bootloader is listening
    pub fn say_hi(&mut self) -> Result<(), Error<E>> {
        let r = self.command(Command::SayHi, &[]).and_then(|_| self.discard_reply());

        self.state = match r {
            Ok(_) => State::Connected,
            Err(_) => State::Disconnected,
        };

        r
    }

    /// End the bootloader session
    pub fn say_bye(&mut self) -> Result<(), Error<E>> {
        self.command(Command::SayBye, &[])?;
        self.discard_reply()
    }

    /// Fetch the commands supported by the bootloader
    pub fn get_help(&mut self) -> Result<Vec<Command>, Error<E>> {
        let body = self.query(Command::GetHelp)?;

        let commands = body
            .iter()
            .filter_map(|b| match Command::try_from(*b) {
                Ok(c) => Some(c),
                Err(v) => {
                    debug!("Ignoring unknown command 0x{:02x}", v);
                    None
                }
            })
            .collect();

        Ok(commands)
    }

    /// Fetch the chip ID and bootloader version
    pub fn get_version(&mut self) -> Result<Version, Error<E>> {
        let body = self.query(Command::GetVersion)?;

        if body.len() < 3 {
            return Err(Error::InvalidResponse("version response too short"));
        }

        Ok(Version {
            chip_id: body[0],
            major: body[1],
            minor: body[2],
        })
    }

    /// Fetch the 96-bit hardware unique ID
    pub fn get_id(&mut self) -> Result<[u32; 3], Error<E>> {
        let body = self.query(Command::GetId)?;

        if body.len() < 12 {
            return Err(Error::InvalidResponse("ID response too short"));
        }

        let mut id = [0u32; 3];
        for (w, b) in id.iter_mut().zip(body.chunks_exact(4)) {
            *w = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }

        Ok(id)
    }

    /// Fetch version and unique ID
    pub fn identify(&mut self) -> Result<DeviceIdentity, Error<E>> {
        let v = self.get_version()?;

        let unique_id = match self.get_id() {
            Ok(id) => Some(id),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Unable to read unique ID: {}", e);
                None
            }
        };

        Ok(DeviceIdentity {
            chip_id: v.chip_id,
            major: v.major,
            minor: v.minor,
            unique_id,
        })
    }

    /// Erase `count` pages starting at `start_page`
    pub fn erase(&mut self, start_page: u8, count: u8) -> Result<(), Error<E>> {
        debug!("Erasing {} page(s) from page {}", count, start_page);

        self.command(Command::EraseFlash, &[start_page, count])
    }

    /// Jump to the provided address
    pub fn jump(&mut self, address: u32) -> Result<(), Error<E>> {
        debug!("Jumping to 0x{:08x}", address);

        self.command(Command::AddressJump, &address.to_le_bytes())
    }

    /// Write a single word to the provided address
    pub fn write_data(&mut self, address: u32, value: u32) -> Result<(), Error<E>> {
        debug!("Writing 0x{:08x} to 0x{:08x}", value, address);

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&address.to_le_bytes());
        payload[4..].copy_from_slice(&value.to_le_bytes());

        self.command(Command::WriteData, &payload)
    }

    /// Program an application image starting at `start_page`.
    ///
    /// `progress` is called with `(sent, total)` bytes after each acknowledged
    /// chunk.
    pub fn flash_application<F>(
        &mut self,
        start_page: u8,
        data: &[u8],
        progress: F,
    ) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        let chunks = (data.len() + MAX_CHUNK - 1) / MAX_CHUNK;
        if chunks > u8::MAX as usize {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                max: u8::MAX as usize * MAX_CHUNK,
            });
        }

        debug!(
            "Flashing {} bytes ({} chunks) from page {}",
            data.len(),
            chunks,
            start_page
        );

        self.command(Command::FlashApplication, &[start_page, chunks as u8])?;

        self.send_chunks(data, progress)
    }

    /// Send a buffer as a sequence of acknowledged chunk frames.
    ///
    /// Stops at the first chunk that is not acknowledged, the remainder of the
    /// buffer is not sent.
    pub fn send_chunks<F>(&mut self, data: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize, usize),
    {
        let total = data.len();
        let mut offset = 0;

        for (index, chunk) in data.chunks(MAX_CHUNK).enumerate() {
            if index > 0 {
                self.delay.delay_ms(self.options.chunk_delay_ms);
            }

            let frame = frame::encode_with(self.options.crc_scope, None, chunk);
            self.write_frame(&frame)?;

            if let Err(e) = self.await_ack() {
                error!("Chunk {} not acknowledged: {}", index, e);

                return Err(Error::ChunkNotAcknowledged {
                    index,
                    offset,
                    cause: Box::new(e),
                });
            }

            offset += chunk.len();
            trace!("Chunk {} acknowledged ({}/{})", index, offset, total);

            progress(offset, total);
        }

        Ok(())
    }

    /// Pulse the reset line
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.assert_reset()?;
        self.delay.delay_ms(self.options.reset_pulse_ms);
        self.port.release_reset()?;

        Ok(())
    }

    /// Leave the bootloader, the device restarts into its application
    pub fn exit_bootloader(&mut self) -> Result<(), Error<E>> {
        self.reset()?;
        self.state = State::Disconnected;
        Ok(())
    }

    /// Reset the target and retry the handshake until the bootloader responds.
    ///
    /// Returns the number of handshake attempts, or `Cancelled` once `running`
    /// is cleared.
    pub fn start_target_bootloader(&mut self, running: &AtomicBool) -> Result<usize, Error<E>> {
        if !self.options.no_reset {
            self.reset()?;
        }

        self.delay.delay_ms(self.options.init_delay_ms);

        debug!("Awaiting bootloader response");

        let mut attempts = 0;
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            attempts += 1;

            match self.say_hi() {
                Ok(_) => {
                    info!("Bootloader connected after {} attempt(s)", attempts);
                    return Ok(attempts);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("Handshake attempt {} failed: {}", attempts, e),
            }

            self.delay.delay_ms(self.options.handshake_retry_ms);
        }
    }

    /// Send a command frame and await the acknowledge
    fn command(&mut self, command: Command, payload: &[u8]) -> Result<(), Error<E>> {
        let frame = frame::encode_with(self.options.crc_scope, Some(command), payload);

        trace!("Sending {}: {:02x?}", command.name(), frame.as_bytes());

        self.write_frame(&frame)?;
        self.await_ack()
    }

    /// Send a command frame, await the acknowledge and read the response body
    fn query(&mut self, command: Command) -> Result<Vec<u8>, Error<E>> {
        self.command(command, &[])?;

        let raw = self.read_length_prefixed()?;

        frame::decode_body(raw, self.options.verify_response_crc).map_err(Error::Frame)
    }

    /// Consume an optional response body, the bootloader may answer with none
    fn discard_reply(&mut self) -> Result<(), Error<E>> {
        match self.read_length_prefixed() {
            Ok(body) => {
                trace!("Discarding {} byte reply", body.len());
                Ok(())
            }
            Err(Error::ResponseTimeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        for b in frame.as_bytes() {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    fn await_ack(&mut self) -> Result<(), Error<E>> {
        let mut t = Timeout::start(self.options.response_timeout_ms);

        match self.read_byte(&mut t)? {
            BOOT_ACK => {
                trace!("Received bootloader ack");
                Ok(())
            }
            BOOT_NACK => {
                debug!("Received bootloader nack");
                Err(Error::Nack)
            }
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidAck(v))
            }
        }
    }

    /// Read a length byte then that many bytes, each within a response timeout
    fn read_length_prefixed(&mut self) -> Result<Vec<u8>, Error<E>> {
        let mut t = Timeout::start(self.options.response_timeout_ms);
        let len = self.read_byte(&mut t)? as usize;

        self.read_exact(len)
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Error<E>> {
        let mut t = Timeout::start(self.options.response_timeout_ms);
        let mut buff = Vec::with_capacity(len);

        while buff.len() < len {
            let b = self.read_byte(&mut t)?;
            buff.push(b);
        }

        trace!("Received: {:02x?}", buff);

        Ok(buff)
    }

    /// Poll for a single byte until `t` expires
    fn read_byte(&mut self, t: &mut Timeout) -> Result<u8, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            if t.expired() {
                debug!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }

            // Wait for delay period
            self.delay.delay_ms(poll);
            t.waited += poll;
        }
    }
}

/// Response deadline, counting both issued delays and wall clock time spent
/// blocked in the port
struct Timeout {
    limit_ms: u32,
    waited: u32,
    started: Instant,
}

impl Timeout {
    fn start(limit_ms: u32) -> Self {
        Self {
            limit_ms,
            waited: 0,
            started: Instant::now(),
        }
    }

    fn expired(&self) -> bool {
        self.waited >= self.limit_ms
            || self.started.elapsed() >= Duration::from_millis(self.limit_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::{append_crc, crc32};
    use crate::mock::{MockDelay, MockError, MockPort};

    fn programmer(port: MockPort) -> Programmer<MockPort, MockDelay, MockError> {
        Programmer::new(port, MockDelay::new(), Options::default())
    }

    #[test]
    fn say_hi_acknowledged() {
        let mut p = programmer(MockPort::acks(1));
        assert_eq!(p.state(), State::Disconnected);

        p.say_hi().unwrap();

        assert_eq!(p.state(), State::Connected);
        assert_eq!(p.port.frames(), vec![frame::encode(Command::SayHi, &[]).into_bytes()]);
    }

    #[test]
    fn handshake_reply_body_consumed() {
        let rx = [BOOT_ACK, 0, BOOT_ACK, BOOT_ACK, 2, 0x10, 0x20, BOOT_ACK];
        let mut p = programmer(MockPort::with_rx(&rx));

        p.say_hi().unwrap();
        p.erase(31, 1).unwrap();
        p.say_bye().unwrap();
        p.erase(32, 1).unwrap();

        assert!(p.port.rx.is_empty());
        assert!(p.delay.log.is_empty());
    }

    #[test]
    fn handshake_without_reply_body() {
        let mut p = programmer(MockPort::acks(1));

        p.say_hi().unwrap();

        assert_eq!(p.state(), State::Connected);
        assert_eq!(p.delay.total(), p.options.response_timeout_ms);
    }

    #[test]
    fn nack_and_unexpected_bytes_fail() {
        let mut p = programmer(MockPort::with_rx(&[BOOT_NACK, 0x79]));

        assert_eq!(p.say_hi(), Err(Error::Nack));
        assert_eq!(p.state(), State::Disconnected);
        assert_eq!(p.say_bye(), Err(Error::InvalidAck(0x79)));
    }

    #[test]
    fn missing_ack_times_out() {
        let mut p = programmer(MockPort::new());

        assert_eq!(p.say_hi(), Err(Error::ResponseTimeout));
        assert_eq!(p.delay.total(), p.options.response_timeout_ms);
    }

    #[test]
    fn timeout_includes_blocked_reads() {
        let mut port = MockPort::new();
        port.read_latency_ms = 5;

        let mut opts = Options::default();
        opts.response_timeout_ms = 20;

        let mut p = Programmer::new(port, MockDelay::new(), opts);

        assert_eq!(p.say_hi(), Err(Error::ResponseTimeout));
        assert!(p.delay.total() < 20);
    }

    #[test]
    fn chunk_error_display() {
        let e: Error<MockError> = Error::ChunkNotAcknowledged {
            index: 1,
            offset: 250,
            cause: Box::new(Error::Nack),
        };

        let msg = e.to_string();
        assert!(msg.starts_with("chunk 1 (offset 250) not acknowledged"));
        assert!(msg.contains("Nack"));
        assert!(!e.is_fatal());
    }

    #[test]
    fn write_failure_is_fatal() {
        let mut port = MockPort::acks(1);
        port.fail_writes = true;
        let mut p = programmer(port);

        let e = p.say_hi().unwrap_err();
        assert_eq!(e, Error::Serial(MockError));
        assert!(e.is_fatal());
    }

    #[test]
    fn get_version_reads_reversed_body() {
        let mut p = programmer(MockPort::with_rx(&[BOOT_ACK, 3, 5, 2, 7]));

        let v = p.get_version().unwrap();
        assert_eq!(
            v,
            Version {
                chip_id: 7,
                major: 2,
                minor: 5
            }
        );
        assert_eq!(p.port.frames()[0][1], Command::GetVersion as u8);
    }

    #[test]
    fn get_version_short_body() {
        let mut p = programmer(MockPort::with_rx(&[BOOT_ACK, 2, 5, 2]));

        assert!(matches!(p.get_version(), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn get_version_body_timeout() {
        let mut p = programmer(MockPort::with_rx(&[BOOT_ACK, 3, 5]));

        assert_eq!(p.get_version(), Err(Error::ResponseTimeout));
    }

    #[test]
    fn get_id_words() {
        let id = [0x1122_3344u32, 0x5566_7788, 0x99aa_bbcc];

        let mut body: Vec<u8> = id.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect();
        body.reverse();

        let mut rx = vec![BOOT_ACK, 12];
        rx.extend_from_slice(&body);

        let mut p = programmer(MockPort::with_rx(&rx));
        assert_eq!(p.get_id().unwrap(), id);
    }

    #[test]
    fn identify_without_unique_id() {
        let mut p = programmer(MockPort::with_rx(&[BOOT_ACK, 3, 1, 0, 4, BOOT_NACK]));

        let id = p.identify().unwrap();
        assert_eq!(id.chip_id, 4);
        assert_eq!(id.major, 0);
        assert_eq!(id.minor, 1);
        assert_eq!(id.unique_id, None);
    }

    #[test]
    fn get_help_skips_unknown() {
        let mut p = programmer(MockPort::with_rx(&[BOOT_ACK, 4, 7, 0x42, 2, 1]));

        assert_eq!(
            p.get_help().unwrap(),
            vec![Command::GetHelp, Command::GetId, Command::SayHi]
        );
    }

    #[test]
    fn verified_response_crc() {
        let mut raw = vec![5, 2, 7];
        append_crc(&mut raw);

        let mut rx = vec![BOOT_ACK, raw.len() as u8];
        rx.extend_from_slice(&raw);

        let mut opts = Options::default();
        opts.verify_response_crc = true;

        let mut p = Programmer::new(MockPort::with_rx(&rx), MockDelay::new(), opts.clone());
        assert_eq!(p.get_version().unwrap().chip_id, 7);

        rx[3] ^= 0xff;
        let mut p = Programmer::new(MockPort::with_rx(&rx), MockDelay::new(), opts);
        assert!(matches!(p.get_version(), Err(Error::Frame(FrameError::Crc { .. }))));
    }

    #[test]
    fn command_payloads() {
        let mut p = programmer(MockPort::acks(3));

        p.erase(31, 1).unwrap();
        p.jump(0x0800_8000).unwrap();
        p.write_data(0x0800_7FF8, 0x0502_0700).unwrap();

        let frames = p.port.frames();
        assert_eq!(frames.len(), 3);

        assert_eq!(&frames[0][..4], &[7, Command::EraseFlash as u8, 31, 1]);
        assert_eq!(&frames[1][..6], &[9, Command::AddressJump as u8, 0x00, 0x80, 0x00, 0x08]);
        assert_eq!(
            &frames[2][..10],
            &[13, Command::WriteData as u8, 0xF8, 0x7F, 0x00, 0x08, 0x00, 0x07, 0x02, 0x05]
        );

        let crc = crc32(&[Command::EraseFlash as u8, 31, 1, 0]);
        assert_eq!(&frames[0][4..], &crc.to_le_bytes());
    }

    #[test]
    fn chunked_transfer() {
        let data: Vec<u8> = (0..300u32).map(|v| v as u8).collect();
        let mut p = programmer(MockPort::acks(3));

        let mut reports = vec![];
        p.flash_application(32, &data, |sent, total| reports.push((sent, total)))
            .unwrap();

        let frames = p.port.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..4], &[7, Command::FlashApplication as u8, 32, 2]);
        assert_eq!(frames[1].len(), 1 + 250 + 4);
        assert_eq!(&frames[1][1..251], &data[..250]);
        assert_eq!(frames[2].len(), 1 + 50 + 4);
        assert_eq!(&frames[2][1..51], &data[250..]);

        assert_eq!(reports, vec![(250, 300), (300, 300)]);
        assert_eq!(p.delay.count(p.options.chunk_delay_ms), 1);
    }

    #[test]
    fn chunk_transfer_stops_on_missing_ack() {
        let data = vec![0x55u8; 300];
        let mut p = programmer(MockPort::acks(2));

        let e = p.flash_application(32, &data, |_, _| ()).unwrap_err();
        assert_eq!(
            e,
            Error::ChunkNotAcknowledged {
                index: 1,
                offset: 250,
                cause: Box::new(Error::ResponseTimeout),
            }
        );

        assert_eq!(p.port.frames().len(), 3);
    }

    #[test]
    fn oversized_payload_rejected() {
        let data = vec![0u8; 256 * MAX_CHUNK];
        let mut p = programmer(MockPort::acks(1));

        assert!(matches!(
            p.flash_application(32, &data, |_, _| ()),
            Err(Error::PayloadTooLarge { .. })
        ));
        assert!(p.port.tx.is_empty());
    }

    #[test]
    fn bootloader_handshake_retries() {
        let mut p = programmer(MockPort::with_rx(&[BOOT_NACK, BOOT_NACK, BOOT_ACK, 0]));
        let running = AtomicBool::new(true);

        assert_eq!(p.start_target_bootloader(&running), Ok(3));

        assert_eq!(p.port.resets, vec![true, false]);
        assert_eq!(p.port.frames().len(), 3);
        for f in p.port.frames() {
            assert_eq!(f[1], Command::SayHi as u8);
        }

        assert_eq!(
            p.delay.log,
            vec![
                p.options.reset_pulse_ms,
                p.options.init_delay_ms,
                p.options.handshake_retry_ms,
                p.options.handshake_retry_ms
            ]
        );
        assert_eq!(p.state(), State::Connected);
    }

    #[test]
    fn bootloader_handshake_cancelled() {
        let mut p = programmer(MockPort::new());
        let running = AtomicBool::new(false);

        assert_eq!(p.start_target_bootloader(&running), Err(Error::Cancelled));
        assert!(p.port.tx.is_empty());
    }

    #[test]
    fn exit_pulses_reset() {
        let mut p = programmer(MockPort::acks(1));
        p.say_hi().unwrap();

        p.exit_bootloader().unwrap();

        assert_eq!(p.port.resets, vec![true, false]);
        assert_eq!(p.state(), State::Disconnected);
    }
}
