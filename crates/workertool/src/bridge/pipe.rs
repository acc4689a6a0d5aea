//! Named pipe transport between executor and worker tool.
//!
//! The executor creates both pipes and hands their names to the worker through
//! the environment. On Linux these are FIFOs under
//! `{temp_dir}/workertool-{pid}/{uuid}.pipe`, removed again on close.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};

pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// The named resource behind a pipe, independent of the stream opened on it.
pub trait NamedPipe: Send {
    /// Name the peer process uses to open the other end.
    fn name(&self) -> &str;

    /// Release the pipe resource. Streams opened on it must be closed first.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Creates named pipes. Extension point so tests can substitute in-memory pipes.
pub trait PipeFactory: Send + Sync {
    /// Create a pipe this process writes to.
    fn create_writer(&self) -> io::Result<(Box<dyn NamedPipe>, PipeWriter)>;

    /// Create a pipe this process reads from.
    fn create_reader(&self) -> io::Result<(Box<dyn NamedPipe>, PipeReader)>;
}

/// FIFO-backed pipes in a per-process directory.
#[derive(Debug, Clone)]
pub struct FifoPipeFactory {
    dir: PathBuf,
}

impl Default for FifoPipeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoPipeFactory {
    pub fn new() -> Self {
        Self::in_dir(std::env::temp_dir().join(format!("workertool-{}", std::process::id())))
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn create_fifo(&self) -> io::Result<FifoPipe> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.pipe", uuid::Uuid::new_v4()));
        make_fifo(&path)?;
        tracing::trace!(path = %path.display(), "Created fifo");
        Ok(FifoPipe {
            name: path.to_string_lossy().into_owned(),
            path,
            closed: false,
        })
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes are only supported on unix",
    ))
}

// Both ends are opened read-write so opening never blocks on, or fails for
// lack of, the peer. The pipe therefore never reports EOF on its own.
#[cfg(target_os = "linux")]
impl PipeFactory for FifoPipeFactory {
    fn create_writer(&self) -> io::Result<(Box<dyn NamedPipe>, PipeWriter)> {
        let fifo = self.create_fifo()?;
        let sender = tokio::net::unix::pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&fifo.path)?;
        Ok((Box::new(fifo), Box::new(sender)))
    }

    fn create_reader(&self) -> io::Result<(Box<dyn NamedPipe>, PipeReader)> {
        let fifo = self.create_fifo()?;
        let receiver = tokio::net::unix::pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&fifo.path)?;
        Ok((Box::new(fifo), Box::new(receiver)))
    }
}

#[cfg(not(target_os = "linux"))]
impl PipeFactory for FifoPipeFactory {
    fn create_writer(&self) -> io::Result<(Box<dyn NamedPipe>, PipeWriter)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fifo pipes require linux",
        ))
    }

    fn create_reader(&self) -> io::Result<(Box<dyn NamedPipe>, PipeReader)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fifo pipes require linux",
        ))
    }
}

/// A FIFO on the filesystem.
#[derive(Debug)]
pub struct FifoPipe {
    name: String,
    path: PathBuf,
    closed: bool,
}

impl FifoPipe {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl NamedPipe for FifoPipe {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        tracing::trace!(path = %self.path.display(), "Removing fifo");
        self.remove()
    }
}

impl Drop for FifoPipe {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove fifo");
        }
    }
}
