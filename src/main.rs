use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::Delay;

use fota_loader::firmware::{self, Boot, FirmwareImage};
use fota_loader::linux::LinuxPort;
use fota_loader::monitor::{GitRepository, Monitor, MonitorOptions};
use fota_loader::{Options, Programmer};

type LinuxProgrammer = Programmer<LinuxPort, Delay, std::io::ErrorKind>;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyS0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// GPIO used to reset the target (DTR/RTS are used if not set)
    #[structopt(long)]
    reset_gpio: Option<u64>,

    /// Run the unattended remote update monitor
    #[structopt(short = "r", long)]
    remote_update: bool,

    #[structopt(flatten)]
    options: Options,

    #[structopt(flatten)]
    monitor: MonitorOptions,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Option<Operation>,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Show the chip ID, bootloader version and unique ID
    Info,
    /// List the commands supported by the bootloader
    Commands,
    /// Send a handshake
    Hi,
    /// End the bootloader session
    Bye,
    /// Erase flash pages
    Erase {
        /// First page to erase
        start_page: u8,
        /// Number of pages to erase
        count: u8,
    },
    /// Flash an application image and its metadata
    Flash {
        /// Image file, or directory containing a `.bin` image
        path: PathBuf,
        /// First application page
        #[structopt(long, default_value = "32")]
        start_page: u32,
        /// Action after flashing (stay, jump, reset)
        #[structopt(long, default_value = "stay")]
        boot: Boot,
    },
    /// Jump to an address
    Jump {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
    },
    /// Write a word to an address
    Write {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
        #[structopt(parse(try_from_str = parse_u32))]
        value: u32,
    },
    /// Leave the bootloader and start the application
    Exit,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Connecting to serial port {}", o.port);

    let mut p = Programmer::linux(&o.port, o.baud, o.reset_gpio, o.options.clone())?;

    if o.remote_update {
        return monitor(&mut p, o.monitor, running);
    }

    let operation = o.operation.unwrap_or(Operation::Info);

    if p.say_hi().is_err() {
        info!("Bootloader not responding, resetting target");
        p.start_target_bootloader(&running)?;
    }

    info!("Bootloader connected!");

    match operation {
        Operation::Info => {
            let id = p.identify()?;
            info!("Chip ID: 0x{:02x}", id.chip_id);
            info!("Version: {}.{}", id.major, id.minor);
            if let Some(uid) = id.unique_id {
                let bytes: Vec<u8> = uid.iter().flat_map(|w| w.to_be_bytes().to_vec()).collect();
                info!("Unique ID: {}", hex::encode(bytes));
            }
        }
        Operation::Commands => {
            for c in p.get_help()? {
                info!("  0x{:02x} {}", c as u8, c.name());
            }
        }
        Operation::Hi => info!("Bootloader acknowledged handshake"),
        Operation::Bye => p.say_bye()?,
        Operation::Erase { start_page, count } => {
            p.erase(start_page, count)?;
            info!("Erased {} page(s) from page {}", count, start_page);
        }
        Operation::Flash {
            path,
            start_page,
            boot,
        } => flash(&mut p, &path, start_page, boot)?,
        Operation::Jump { address } => p.jump(address)?,
        Operation::Write { address, value } => {
            p.write_data(address, value)?;
            info!("Wrote 0x{:08x} to 0x{:08x}", value, address);
        }
        Operation::Exit => {
            p.exit_bootloader()?;
            info!("Target reset");
        }
    }

    Ok(())
}

fn flash(
    p: &mut LinuxProgrammer,
    path: &Path,
    start_page: u32,
    boot: Boot,
) -> anyhow::Result<()> {
    let image = FirmwareImage::load(path, start_page)?;

    info!(
        "Flashing {} ({}, {})",
        image.path.display(),
        bytefmt::format(image.bytes.len() as u64),
        image.version
    );

    let pb = ProgressBar::new(image.bytes.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );

    // Spinner thread, ticks until the flash completes
    let ticking = Arc::new(AtomicBool::new(true));
    let ticker = {
        let (pb, ticking) = (pb.clone(), ticking.clone());
        thread::spawn(move || {
            while ticking.load(Ordering::SeqCst) {
                pb.tick();
                thread::sleep(Duration::from_millis(100));
            }
        })
    };

    let res = firmware::flash_image(p, &image, boot, |sent, _total| pb.set_position(sent as u64));

    ticking.store(false, Ordering::SeqCst);
    if ticker.join().is_err() {
        warn!("Progress thread panicked");
    }

    match &res {
        Ok(_) => pb.finish(),
        Err(_) => pb.abandon(),
    }

    res.with_context(|| format!("flashing {}", image.path.display()))?;

    info!("Flash complete (CRC 0x{:08x})", image.target_crc());

    Ok(())
}

fn monitor(
    p: &mut LinuxProgrammer,
    opts: MonitorOptions,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let repo = GitRepository::new(&opts.repo_path, &opts.remote_url, &opts.branch);
    let mut m = Monitor::new(repo, Delay {}, opts, running);

    m.run(p).context("update monitor failed")
}
