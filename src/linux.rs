use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Delay, Serial, SysfsPin};
use serial_core::{
    BaudRate, CharSize, FlowControl, Parity, SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer, SerialPort};

/// Target reset line
pub enum ResetLine {
    /// Sysfs GPIO, idle high and asserted low
    Gpio(SysfsPin),
    /// Serial DTR and RTS lines
    Modem,
}

/// Linux serial port with target reset control
pub struct LinuxPort {
    serial: Serial,
    reset: ResetLine,
}

impl LinuxPort {
    /// Open a serial port (8N1) and, if provided, export a GPIO for target reset
    pub fn open<P: AsRef<Path>>(
        port: P,
        baud: usize,
        reset_gpio: Option<u64>,
    ) -> anyhow::Result<Self> {
        let path = port.as_ref();

        // Open port
        let mut serial = Serial::open(path)
            .with_context(|| format!("opening serial port {}", path.display()))?;

        // Apply settings
        let mut settings = serial.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        serial.0.write_settings(&settings)?;

        // Reads poll, timeouts are handled by the programmer
        serial.0.set_timeout(Duration::from_millis(1))?;

        let reset = match reset_gpio {
            Some(n) => {
                let pin = SysfsPin::new(n);
                pin.0
                    .export()
                    .with_context(|| format!("exporting reset GPIO {}", n))?;
                pin.0
                    .set_direction(Direction::High)
                    .with_context(|| format!("configuring reset GPIO {}", n))?;

                debug!("Using GPIO {} for target reset", n);
                ResetLine::Gpio(pin)
            }
            None => ResetLine::Modem,
        };

        Ok(Self { serial, reset })
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), IoErrorKind> {
        match &mut self.reset {
            ResetLine::Gpio(pin) => {
                let r = if asserted { pin.set_low() } else { pin.set_high() };
                r.map_err(|e| {
                    error!("Reset GPIO error: {:?}", e);
                    IoErrorKind::Other
                })
            }
            ResetLine::Modem => {
                let s = &mut self.serial.0;
                s.set_dtr(asserted)
                    .and_then(|_| s.set_rts(asserted))
                    .map_err(|e| {
                        error!("Reset modem line error: {:?}", e);
                        IoErrorKind::Other
                    })
            }
        }
    }
}

impl Drop for LinuxPort {
    fn drop(&mut self) {
        if let ResetLine::Gpio(pin) = &self.reset {
            let _ = pin.0.unexport();
        }
    }
}

impl Write<u8> for LinuxPort {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.serial.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        self.serial.flush()
    }
}

impl Read<u8> for LinuxPort {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.serial.read()
    }
}

impl SerialPort<IoErrorKind> for LinuxPort {
    fn assert_reset(&mut self) -> Result<(), IoErrorKind> {
        self.set_reset(true)
    }

    fn release_reset(&mut self) -> Result<(), IoErrorKind> {
        self.set_reset(false)
    }
}

impl Programmer<LinuxPort, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        reset_gpio: Option<u64>,
        options: Options,
    ) -> anyhow::Result<Self> {
        let port = LinuxPort::open(port, baud, reset_gpio)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
