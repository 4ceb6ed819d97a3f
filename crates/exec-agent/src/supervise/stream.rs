use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use protocol::StreamMode;

/// Bytes read per call; also the fragmentation unit upstream, so a
/// buffer can never grow past twice this size between packetizations.
pub const READ_BUF_BYTES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select {
    Failed,
    Empty,
    Ready,
}

/// Non-blocking reader over the read end of one child pipe.
pub struct StreamReader {
    fd: Option<OwnedFd>,
    mode: StreamMode,
    capture_path: Option<PathBuf>,
    timeout_micros: u32,
    buf: Vec<u8>,
    last_read: usize,
    eof: bool,
}

impl StreamReader {
    pub fn new(mode: StreamMode, capture_path: &str) -> Self {
        let capture_path = if capture_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(capture_path))
        };
        Self {
            fd: None,
            mode,
            capture_path,
            timeout_micros: 0,
            buf: Vec::new(),
            last_read: 0,
            eof: false,
        }
    }

    /// Take ownership of the pipe read end and switch it to O_NONBLOCK.
    pub fn attach(&mut self, fd: OwnedFd) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        self.fd = Some(fd);
        Ok(())
    }

    pub fn set_timeout(&mut self, micros: u32) {
        self.timeout_micros = micros;
    }

    /// Bounded readiness wait; never blocks longer than the configured
    /// timeout. A poll interrupted by a signal counts as no data.
    ///
    /// Starting a new selection invalidates the previous read result,
    /// so `last_read()` only ever describes the current iteration.
    pub fn select(&mut self) -> Select {
        self.last_read = 0;
        let Some(fd) = &self.fd else {
            return Select::Empty;
        };
        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = (self.timeout_micros / 1000) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if rc < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                return Select::Empty;
            }
            return Select::Failed;
        }
        if rc == 0 {
            Select::Empty
        } else {
            Select::Ready
        }
    }

    /// Read one chunk into the stream buffer. Returns the byte count;
    /// 0 after a positive selection marks end of stream.
    pub fn read(&mut self) -> io::Result<usize> {
        let Some(fd) = &self.fd else {
            return Ok(0);
        };
        let mut chunk = [0u8; READ_BUF_BYTES];
        let count = unsafe { libc::read(fd.as_raw_fd(), chunk.as_mut_ptr().cast(), READ_BUF_BYTES) };
        if count < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                    self.last_read = 0;
                    Ok(0)
                }
                _ => Err(err),
            };
        }
        let count = count as usize;
        if count == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..count]);
        }
        self.last_read = count;
        Ok(count)
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn last_read(&self) -> usize {
        self.last_read
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Persist captured bytes: open, append, close per packet so a
    /// crash never loses more than the in-flight chunk.
    pub fn append_capture(&self, bytes: &[u8]) -> io::Result<()> {
        let Some(path) = &self.capture_path else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(bytes)
    }
}
