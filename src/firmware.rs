//! Application images and the update sequence.
//!
//! An update erases the metadata page, streams the image, then records the
//! image CRC and version in the metadata words the bootloader checks before
//! starting the application.
//!
//! Image versions come from the file name: `<name>.<chip_id>.<major>.<minor>.bin`.

use std::convert::TryFrom;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use embedded_hal::blocking::delay::DelayMs;

use crate::crc::target_crc;
use crate::protocol::*;
use crate::{Error, Programmer, SerialPort};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("no firmware image found at {0}")]
    NotFound(PathBuf),

    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to parse version from '{0}'")]
    InvalidName(String),

    #[error("image of {size} bytes exceeds application region of {max} bytes")]
    TooLarge { size: usize, max: usize },
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum UpdateError<E: core::fmt::Debug> {
    #[error("start page {0} out of range")]
    StartPage(u32),

    #[error("erasing metadata page failed: {0}")]
    Erase(Error<E>),

    #[error("application transfer failed: {0}")]
    Transfer(Error<E>),

    #[error("metadata write to 0x{address:08x} failed: {cause}")]
    MetadataWrite { address: u32, cause: Error<E> },

    #[error("starting application failed: {0}")]
    Boot(Error<E>),
}

impl<E: core::fmt::Debug> UpdateError<E> {
    pub fn is_fatal(&self) -> bool {
        match self {
            UpdateError::StartPage(_) => false,
            UpdateError::Erase(e) | UpdateError::Transfer(e) | UpdateError::Boot(e) => e.is_fatal(),
            UpdateError::MetadataWrite { cause, .. } => cause.is_fatal(),
        }
    }
}

/// Action once an image has been written
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Boot {
    /// Remain in the bootloader
    Stay,
    /// Jump to the application base address
    Jump,
    /// Pulse the reset line
    Reset,
}

impl Default for Boot {
    fn default() -> Self {
        Boot::Reset
    }
}

impl core::str::FromStr for Boot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stay" => Ok(Boot::Stay),
            "jump" => Ok(Boot::Jump),
            "reset" => Ok(Boot::Reset),
            _ => Err(format!("unknown boot action: {}", s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub start_page: u32,
    pub version: Version,
}

impl FirmwareImage {
    /// Locate, read and parse an image from a `.bin` file or a directory containing one
    pub fn load<P: AsRef<Path>>(path: P, start_page: u32) -> Result<Self, ImageError> {
        let path = find_image(path.as_ref())?;

        let bytes = fs::read(&path).map_err(|source| ImageError::Io {
            path: path.clone(),
            source,
        })?;

        let version = parse_version(&path)?;

        let max = APPLICATION_SIZE_KB as usize * 1024;
        if bytes.len() > max {
            return Err(ImageError::TooLarge {
                size: bytes.len(),
                max,
            });
        }

        debug!(
            "Loaded {} ({} bytes, {})",
            path.display(),
            bytes.len(),
            version
        );

        Ok(Self {
            path,
            bytes,
            start_page,
            version,
        })
    }

    /// CRC of the application region as computed by the bootloader
    pub fn target_crc(&self) -> u32 {
        target_crc(&self.bytes, APPLICATION_SIZE_KB as usize * 1024)
    }
}

/// Resolve an image path, picking the first `.bin` file (by name) when given a directory
pub fn find_image(path: &Path) -> Result<PathBuf, ImageError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    if !path.is_dir() {
        return Err(ImageError::NotFound(path.to_path_buf()));
    }

    let entries = fs::read_dir(path).map_err(|source| ImageError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut images: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|x| x == "bin").unwrap_or(false))
        .collect();

    images.sort();

    images
        .into_iter()
        .next()
        .ok_or_else(|| ImageError::NotFound(path.to_path_buf()))
}

/// Parse `chip_id`, `major` and `minor` from the 2nd, 3rd and 4th dot separated
/// fields of the file name
pub fn parse_version(path: &Path) -> Result<Version, ImageError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let fields: Vec<&str> = name.split('.').collect();
    if fields.len() < 4 {
        return Err(ImageError::InvalidName(name));
    }

    let field = |i: usize| {
        fields[i]
            .parse::<u8>()
            .map_err(|_| ImageError::InvalidName(name.clone()))
    };

    Ok(Version {
        chip_id: field(1)?,
        major: field(2)?,
        minor: field(3)?,
    })
}

/// Write an image and its metadata to a connected bootloader.
///
/// Each step must be acknowledged before the next is attempted.
pub fn flash_image<P, D, E, F>(
    programmer: &mut Programmer<P, D, E>,
    image: &FirmwareImage,
    boot: Boot,
    progress: F,
) -> Result<(), UpdateError<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
    F: FnMut(usize, usize),
{
    let start_page =
        u8::try_from(image.start_page).map_err(|_| UpdateError::StartPage(image.start_page))?;

    info!("Erasing metadata page");
    programmer
        .erase((APPLICATION_START_PAGE - 1) as u8, 1)
        .map_err(UpdateError::Erase)?;

    info!(
        "Writing {} bytes from page {}",
        image.bytes.len(),
        start_page
    );
    programmer
        .flash_application(start_page, &image.bytes, progress)
        .map_err(UpdateError::Transfer)?;

    let crc = image.target_crc();
    info!("Writing metadata (CRC 0x{:08x}, {})", crc, image.version);

    let metadata = [
        (CRC_METADATA_ADDRESS, crc),
        (VERSION_METADATA_ADDRESS, image.version.packed()),
    ];
    for (address, value) in metadata.iter() {
        programmer
            .write_data(*address, *value)
            .map_err(|cause| UpdateError::MetadataWrite {
                address: *address,
                cause,
            })?;
    }

    match boot {
        Boot::Stay => (),
        Boot::Jump => programmer.jump(APPLICATION_ADDRESS).map_err(UpdateError::Boot)?,
        Boot::Reset => programmer.exit_bootloader().map_err(UpdateError::Boot)?,
    }

    Ok(())
}
