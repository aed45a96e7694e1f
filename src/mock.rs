//! Scripted port and recording delay for tests.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::BOOT_ACK;
use crate::SerialPort;

#[derive(Clone, Debug, PartialEq)]
pub struct MockError;

#[derive(Clone, Debug, Default)]
pub struct MockPort {
    /// Bytes written by the programmer
    pub tx: Vec<u8>,
    /// Bytes to be returned to the programmer, empty reads block
    pub rx: VecDeque<u8>,
    /// Reset line transitions, `true` for asserted
    pub resets: Vec<bool>,
    pub fail_writes: bool,
    /// Time each read blocks before returning
    pub read_latency_ms: u64,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rx(rx: &[u8]) -> Self {
        Self {
            rx: rx.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn acks(n: usize) -> Self {
        Self::with_rx(&vec![BOOT_ACK; n])
    }

    /// Split written bytes into frames using the length prefix
    pub fn frames(&self) -> Vec<Vec<u8>> {
        let mut frames = vec![];
        let mut i = 0;
        while i < self.tx.len() {
            let end = (i + 1 + self.tx[i] as usize).min(self.tx.len());
            frames.push(self.tx[i..end].to_vec());
            i = end;
        }
        frames
    }
}

impl Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        if self.fail_writes {
            return Err(nb::Error::Other(MockError));
        }
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        if self.read_latency_ms > 0 {
            thread::sleep(Duration::from_millis(self.read_latency_ms));
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<MockError> for MockPort {
    fn assert_reset(&mut self) -> Result<(), MockError> {
        self.resets.push(true);
        Ok(())
    }

    fn release_reset(&mut self) -> Result<(), MockError> {
        self.resets.push(false);
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockDelay {
    pub log: Vec<u32>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u32 {
        self.log.iter().sum()
    }

    /// Count of delays matching `ms` exactly
    pub fn count(&self, ms: u32) -> usize {
        self.log.iter().filter(|d| **d == ms).count()
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.log.push(ms);
    }
}
