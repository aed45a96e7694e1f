//! Bootloader protocol constants and types.

use std::convert::TryFrom;

/// Acknowledge byte returned by the bootloader after a frame
pub const BOOT_ACK: u8 = 1;

/// Negative acknowledge, any byte other than `BOOT_ACK` is treated the same
pub const BOOT_NACK: u8 = 2;

/// Maximum payload carried by a single chunk frame
pub const MAX_CHUNK: usize = 250;

/// Size of the trailing CRC on every frame
pub const CRC_LEN: usize = 4;

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const PAGE_SIZE: u32 = 1024;

/// First flash page of the application (pages below belong to the bootloader)
pub const APPLICATION_START_PAGE: u32 = 32;

/// Application base address, used as the jump target
pub const APPLICATION_ADDRESS: u32 = FLASH_BASE + APPLICATION_START_PAGE * PAGE_SIZE;

/// Flash available to the application, in KiB
pub const APPLICATION_SIZE_KB: u32 = 32;

/// Metadata words live at the end of the last bootloader page
pub const CRC_METADATA_ADDRESS: u32 = 0x0800_7FF4;
pub const VERSION_METADATA_ADDRESS: u32 = 0x0800_7FF8;
pub const BOOT_FLAG_ADDRESS: u32 = 0x0800_7FFC;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Fetch the list of commands supported by the bootloader
    GetHelp = 1,

    /// Fetch the 96-bit hardware unique ID
    GetId = 2,

    /// Fetch the chip ID and bootloader version
    GetVersion = 3,

    /// Erase `count` flash pages starting at `start_page`
    EraseFlash = 4,

    /// Announce an application image, followed by chunk frames
    FlashApplication = 5,

    /// Jump to the provided address
    AddressJump = 6,

    /// Handshake, used to check the bootloader is listening
    SayHi = 7,

    /// End the bootloader session
    SayBye = 8,

    /// Write a single 32-bit word to an address
    WriteData = 9,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::GetHelp,
        Command::GetId,
        Command::GetVersion,
        Command::EraseFlash,
        Command::FlashApplication,
        Command::AddressJump,
        Command::SayHi,
        Command::SayBye,
        Command::WriteData,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetHelp => "get-help",
            Command::GetId => "get-id",
            Command::GetVersion => "get-version",
            Command::EraseFlash => "erase-flash",
            Command::FlashApplication => "flash-application",
            Command::AddressJump => "address-jump",
            Command::SayHi => "say-hi",
            Command::SayBye => "say-bye",
            Command::WriteData => "write-data",
        }
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| *c as u8 == v)
            .ok_or(v)
    }
}

/// Firmware version triple, as stored in the version metadata word
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Version {
    pub chip_id: u8,
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Pack into the metadata word layout `minor | major | chip_id | 0x00`
    pub fn packed(&self) -> u32 {
        (self.minor as u32) << 24 | (self.major as u32) << 16 | (self.chip_id as u32) << 8
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "chip 0x{:02x} v{}.{}", self.chip_id, self.major, self.minor)
    }
}

/// Identity reported by a connected bootloader
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub chip_id: u8,
    pub major: u8,
    pub minor: u8,
    pub unique_id: Option<[u32; 3]>,
}

impl DeviceIdentity {
    pub fn version(&self) -> Version {
        Version {
            chip_id: self.chip_id,
            major: self.major,
            minor: self.minor,
        }
    }
}
