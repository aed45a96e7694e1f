//! Unattended update monitor.
//!
//! Watches a git mirror of a firmware repository and, once new commits land,
//! pulls them, waits for the target to enter its bootloader and flashes the
//! new image. Cycles repeat until the shared running flag is cleared.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;

use crate::firmware::{self, Boot, FirmwareImage, ImageError, UpdateError};
use crate::protocol::{Version, APPLICATION_START_PAGE};
use crate::{Error, Programmer, SerialPort};

/// Longest uninterrupted sleep, the running flag is checked in between
const SLEEP_SLICE_MS: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("unable to run git: {0}")]
    Spawn(#[from] io::Error),

    #[error("git {args} failed ({status}): {stderr}")]
    Git {
        args: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected git output: '{0}'")]
    Output(String),
}

/// Local mirror of the remote firmware repository
pub trait Repository {
    /// Local mirror path
    fn path(&self) -> &Path;

    /// Check whether the local mirror is present
    fn exists(&self) -> bool;

    /// Create the local mirror from the remote
    fn clone_remote(&mut self) -> Result<(), RepoError>;

    /// Fetch the remote, returning true if it holds commits not yet pulled
    fn fetch_has_update(&mut self) -> Result<bool, RepoError>;

    /// Bring the local mirror up to date with the remote
    fn pull(&mut self) -> Result<(), RepoError>;
}

/// [`Repository`] backed by the `git` command line tool
pub struct GitRepository {
    path: PathBuf,
    remote_url: String,
    branch: String,
}

impl GitRepository {
    pub fn new<P: AsRef<Path>>(path: P, remote_url: &str, branch: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            remote_url: remote_url.to_string(),
            branch: branch.to_string(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String, RepoError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(args)
            .output()?;

        check_output(args, output)
    }
}

fn check_output(args: &[&str], output: std::process::Output) -> Result<String, RepoError> {
    if !output.status.success() {
        return Err(RepoError::Git {
            args: args.join(" "),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl Repository for GitRepository {
    fn path(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> bool {
        self.path.join(".git").exists()
    }

    fn clone_remote(&mut self) -> Result<(), RepoError> {
        let path = self.path.to_string_lossy().to_string();
        let args = [
            "clone",
            "--branch",
            self.branch.as_str(),
            self.remote_url.as_str(),
            path.as_str(),
        ];

        let output = Command::new("git").args(&args).output()?;
        check_output(&args, output).map(|_| ())
    }

    fn fetch_has_update(&mut self) -> Result<bool, RepoError> {
        self.git(&["fetch", "origin"])?;

        let range = format!("HEAD..origin/{}", self.branch);
        let count = self.git(&["rev-list", "--count", range.as_str()])?;

        let count: usize = count.parse().map_err(|_| RepoError::Output(count))?;
        trace!("{} new commit(s) on origin/{}", count, self.branch);

        Ok(count > 0)
    }

    fn pull(&mut self) -> Result<(), RepoError> {
        self.git(&["pull", "origin", self.branch.as_str()]).map(|_| ())
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct MonitorOptions {
    /// Local firmware repository mirror
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "/home/root/FOTA"))]
    pub repo_path: PathBuf,

    /// Remote firmware repository
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "https://github.com/t0ti20/FOTA")
    )]
    pub remote_url: String,

    /// Branch to follow
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "master"))]
    pub branch: String,

    /// Image file or directory, relative paths are resolved within the repository
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "Application/Build")
    )]
    pub image_path: PathBuf,

    /// Period between remote update checks
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub poll_interval_ms: u32,

    /// Delay between bootloader handshake and flashing
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub settle_delay_ms: u32,

    /// Action after flashing (stay, jump, reset)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "reset"))]
    pub boot: Boot,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("/home/root/FOTA"),
            remote_url: "https://github.com/t0ti20/FOTA".to_string(),
            branch: "master".to_string(),
            image_path: PathBuf::from("Application/Build"),
            poll_interval_ms: 5000,
            settle_delay_ms: 100,
            boot: Boot::Reset,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Phase {
    Acquire,
    Poll,
    Sync,
    AwaitDevice,
    Flash,
    Resume,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError<E: core::fmt::Debug> {
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("device error: {0}")]
    Device(Error<E>),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("update failed: {0}")]
    Update(UpdateError<E>),

    #[error("monitor cancelled")]
    Cancelled,
}

impl<E: core::fmt::Debug> CycleError<E> {
    /// Transport failures end the monitor, other failures only end the cycle
    pub fn is_fatal(&self) -> bool {
        match self {
            CycleError::Device(e) => e.is_fatal(),
            CycleError::Update(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl<E: core::fmt::Debug> From<Error<E>> for CycleError<E> {
    fn from(e: Error<E>) -> Self {
        match e {
            Error::Cancelled => CycleError::Cancelled,
            e => CycleError::Device(e),
        }
    }
}

pub struct Monitor<R, D> {
    phase: Phase,
    options: MonitorOptions,
    repo: R,
    delay: D,
    running: Arc<AtomicBool>,
}

impl<R, D> Monitor<R, D>
where
    R: Repository,
    D: DelayMs<u32>,
{
    pub fn new(repo: R, delay: D, options: MonitorOptions, running: Arc<AtomicBool>) -> Self {
        Self {
            phase: Phase::Acquire,
            options,
            repo,
            delay,
            running,
        }
    }

    /// Fetch the current phase of the update cycle
    pub fn state(&self) -> Phase {
        self.phase
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Image location, relative paths resolve within the repository
    pub fn image_path(&self) -> PathBuf {
        if self.options.image_path.is_absolute() {
            self.options.image_path.clone()
        } else {
            self.repo.path().join(&self.options.image_path)
        }
    }

    /// Run update cycles until the running flag is cleared.
    ///
    /// Failed cycles are logged and restarted, only transport failures end the
    /// monitor early.
    pub fn run<P, PD, E>(
        &mut self,
        programmer: &mut Programmer<P, PD, E>,
    ) -> Result<(), CycleError<E>>
    where
        P: SerialPort<E>,
        PD: DelayMs<u32>,
        E: core::fmt::Debug,
    {
        info!(
            "Monitoring {} ({}) for updates",
            self.repo.path().display(),
            self.options.remote_url
        );

        while self.running.load(Ordering::SeqCst) {
            match self.run_cycle(programmer) {
                Ok(v) => info!("Update to {} complete", v),
                Err(CycleError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    error!("Update monitor stopped: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Update cycle failed: {}", e);

                    if !self.sleep(self.options.poll_interval_ms) {
                        break;
                    }
                }
            }
        }

        info!("Update monitor stopped");

        Ok(())
    }

    /// Run a single update cycle, returning the version flashed
    pub fn run_cycle<P, PD, E>(
        &mut self,
        programmer: &mut Programmer<P, PD, E>,
    ) -> Result<Version, CycleError<E>>
    where
        P: SerialPort<E>,
        PD: DelayMs<u32>,
        E: core::fmt::Debug,
    {
        self.phase = Phase::Acquire;
        if !self.repo.exists() {
            info!("Cloning {} into {}", self.options.remote_url, self.repo.path().display());
            self.repo.clone_remote()?;
        }

        self.phase = Phase::Poll;
        if !self.wait_for_update() {
            return Err(CycleError::Cancelled);
        }

        self.phase = Phase::Sync;
        info!("Update available, pulling");
        self.repo.pull()?;

        self.phase = Phase::AwaitDevice;
        info!("Waiting for target bootloader");
        programmer.start_target_bootloader(&self.running)?;

        self.delay.delay_ms(self.options.settle_delay_ms);
        programmer.say_hi()?;

        self.phase = Phase::Flash;
        let image = FirmwareImage::load(self.image_path(), APPLICATION_START_PAGE)?;

        info!("Flashing {} ({})", image.path.display(), image.version);

        let mut last = 0;
        firmware::flash_image(programmer, &image, Boot::Stay, |sent, total| {
            let pct = sent * 100 / total.max(1);
            if pct >= last + 25 || sent == total {
                debug!("Sent {}/{} bytes", sent, total);
                last = pct;
            }
        })
        .map_err(CycleError::Update)?;

        self.phase = Phase::Resume;
        match self.options.boot {
            Boot::Stay => (),
            Boot::Jump => programmer.jump(crate::protocol::APPLICATION_ADDRESS)?,
            Boot::Reset => programmer.exit_bootloader()?,
        }

        Ok(image.version)
    }

    /// Poll the remote until it reports an update, false if cancelled first
    fn wait_for_update(&mut self) -> bool {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }

            match self.repo.fetch_has_update() {
                Ok(true) => return true,
                Ok(false) => trace!("No update available"),
                Err(e) => warn!("Update check failed: {}", e),
            }

            if !self.sleep(self.options.poll_interval_ms) {
                return false;
            }
        }
    }

    /// Sleep in slices, returning false early once the running flag is cleared
    fn sleep(&mut self, ms: u32) -> bool {
        let mut remaining = ms;

        while remaining > 0 {
            if !self.running.load(Ordering::SeqCst) {
                return false;
            }

            let slice = remaining.min(SLEEP_SLICE_MS);
            self.delay.delay_ms(slice);
            remaining -= slice;
        }

        true
    }
}
