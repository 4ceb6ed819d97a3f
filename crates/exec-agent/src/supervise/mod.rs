mod clock;
mod identity;
mod logfile;
mod queue;
mod stream;

pub use clock::{Clock, SystemClock};
pub use queue::QueueSink;

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use protocol::{Command, Response, ResponseHeader};

use self::clock::TickTimer;
use self::logfile::{LogSink, Severity};
use self::stream::{Select, StreamReader};

/// Mid-run payload fragmentation threshold.
const MAX_PACKET_BYTES: usize = 1000;
/// Per-stream readiness budget for one loop iteration.
const SELECT_TIMEOUT_MICROS: u32 = 50_000;
/// Quiet seconds on both pipes before an "I'm alive" message.
const HEARTBEAT_SECS: u32 = 30;
/// Worker thread name, visible to operators inspecting a busy agent.
const WORKER_NAME: &str = "agent-child";

const CWD_MISSING_TEXT: &str = "Working Directory Does Not Exist on System";
const USER_MISSING_TEXT: &str = "User Does Not Exist on System";

/// Everything a worker needs besides the command itself.
pub struct Context {
    pub sink: Arc<dyn QueueSink>,
    pub clock: Arc<dyn Clock>,
    pub log_dir: PathBuf,
    pub log_level: u8,
}

/// Hand one command to a fresh worker thread; the caller returns to
/// its accept loop immediately.
pub fn spawn_worker(ctx: Context, command: Command) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(WORKER_NAME.to_string())
        .spawn(move || {
            let uuid = command.uuid.clone();
            let log = LogSink::open(
                &ctx.log_dir,
                ctx.log_level,
                std::process::id(),
                command.request_sequence_number,
            )
            .unwrap_or_else(|err| {
                tracing::warn!(uuid = %uuid, error = %err, "per-invocation log unavailable");
                LogSink::disabled(ctx.log_level)
            });
            if let Err(err) = Supervisor::new(ctx, command, log).run() {
                tracing::error!(uuid = %uuid, error = %err, "supervisor aborted");
            }
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Quiet,
    Active,
}

/// Drives one command from spawn to terminal response.
struct Supervisor {
    ctx: Context,
    command: Command,
    log: LogSink,
    out: StreamReader,
    err: StreamReader,
    child_pid: i32,
    response_count: u32,
    out_buf: Vec<u8>,
    err_buf: Vec<u8>,
    cwd_err: bool,
    uid_err: bool,
    spawn_err: bool,
    exit_flag: bool,
    activity: Activity,
}

impl Supervisor {
    fn new(ctx: Context, command: Command, log: LogSink) -> Self {
        let out = StreamReader::new(command.standard_output, &command.standard_output_path);
        let err = StreamReader::new(command.standard_error, &command.standard_err_path);
        Self {
            ctx,
            command,
            log,
            out,
            err,
            child_pid: 0,
            response_count: 1,
            out_buf: Vec::new(),
            err_buf: Vec::new(),
            cwd_err: false,
            uid_err: false,
            spawn_err: false,
            exit_flag: false,
            activity: Activity::Quiet,
        }
    }

    fn run(mut self) -> anyhow::Result<()> {
        self.log.write(
            Severity::Info,
            &format!(
                "supervising uuid {} program {} run_as {} timeout {}",
                self.command.uuid, self.command.program, self.command.run_as, self.command.timeout
            ),
        );

        if !Path::new(&self.command.working_directory).is_dir() {
            self.cwd_err = true;
            self.log.write(
                Severity::Error,
                &format!("working directory missing cwd {}", self.command.working_directory),
            );
            self.send(Response::progress(self.header(), CWD_MISSING_TEXT.as_bytes(), b""))?;
        }
        let user = match identity::resolve(&self.command.run_as) {
            Ok(user) => Some(user),
            Err(err) => {
                self.uid_err = true;
                self.log.write(
                    Severity::Error,
                    &format!("run_as lookup failed user {} error {err}", self.command.run_as),
                );
                self.send(Response::progress(self.header(), USER_MISSING_TEXT.as_bytes(), b""))?;
                None
            }
        };

        let mut child = None;
        if !self.cwd_err && !self.uid_err {
            if let Some(user) = &user {
                match self.spawn_child(user) {
                    Ok(spawned) => child = Some(spawned),
                    Err(err) => {
                        self.spawn_err = true;
                        self.log.write(
                            Severity::Error,
                            &format!("spawning child failed error {err}"),
                        );
                    }
                }
            }
        }

        let mut timed_out = false;
        if let Some(child) = child.as_mut() {
            self.child_pid = child.id() as i32;
            self.log.write(Severity::Info, &format!("child started pid {}", self.child_pid));
            match self.attach_pipes(child) {
                Ok(()) => timed_out = self.multiplex()?,
                Err(err) => {
                    self.spawn_err = true;
                    self.log.write(
                        Severity::Error,
                        &format!("wiring child pipes failed error {err}"),
                    );
                    self.kill_child();
                }
            }
        }

        if timed_out {
            self.last_check_and_send()?;
            self.send(Response::timeout(self.header()))?;
            self.kill_child();
            if self.out.at_eof() && self.err.at_eof() {
                self.send_exit()?;
            }
        } else {
            self.last_check_and_send()?;
            self.send_exit()?;
        }
        if let Some(child) = child.as_mut() {
            self.reap(child);
        }
        self.log.write(Severity::Info, "supervision finished");
        Ok(())
    }

    fn spawn_child(&mut self, user: &identity::ResolvedUser) -> std::io::Result<Child> {
        let exec_line = self.command.exec_line();
        self.log.write(
            Severity::Debug,
            &format!("exec line {exec_line} user {}", user.name),
        );
        let mut child = ProcessCommand::new("sh");
        child
            .arg("-c")
            .arg(exec_line)
            .current_dir(&self.command.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &self.command.environment {
            child.env(name, value);
        }
        let uid = user.uid;
        let gid = user.gid;
        unsafe {
            use std::os::unix::process::CommandExt;
            // own session so the whole tree can be killed as one group
            child.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                identity::apply(uid, gid)
            });
        }
        child.spawn()
    }

    fn attach_pipes(&mut self, child: &mut Child) -> anyhow::Result<()> {
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;
        self.out.attach(OwnedFd::from(stdout))?;
        self.err.attach(OwnedFd::from(stderr))?;
        Ok(())
    }

    /// The multiplex loop: paced by the 50ms selects, advancing the
    /// execution and heartbeat clocks each pass. Returns true when the
    /// execution timeout fired, false on end of both streams.
    fn multiplex(&mut self) -> anyhow::Result<bool> {
        let clock = Arc::clone(&self.ctx.clock);
        let mut exec_timer = TickTimer::start(clock.as_ref());
        let mut heart_timer = TickTimer::start(clock.as_ref());
        loop {
            self.out.set_timeout(SELECT_TIMEOUT_MICROS);
            self.err.set_timeout(SELECT_TIMEOUT_MICROS);
            let out_sel = self.out.select();
            let err_sel = self.err.select();

            if self.command.timeout > 0
                && exec_timer.tick(clock.as_ref()) >= self.command.timeout
            {
                self.log.write(
                    Severity::Warning,
                    &format!("execution timeout reached count {}", exec_timer.elapsed()),
                );
                return Ok(true);
            }

            match self.activity {
                Activity::Active => {
                    self.activity = Activity::Quiet;
                    heart_timer.reset(clock.as_ref());
                }
                Activity::Quiet => {
                    if heart_timer.tick(clock.as_ref()) >= HEARTBEAT_SECS {
                        self.emit_heartbeat()?;
                        heart_timer.reset(clock.as_ref());
                    }
                }
            }

            if out_sel == Select::Failed || err_sel == Select::Failed {
                anyhow::bail!("selecting child pipes failed");
            }
            if out_sel == Select::Ready {
                self.out.read().context("reading child stdout")?;
            }
            if err_sel == Select::Ready {
                self.err.read().context("reading child stderr")?;
            }

            if self.out.last_read() > 0 || self.err.last_read() > 0 {
                self.activity = Activity::Active;
                self.check_and_write()?;
            } else if self.out.at_eof() && self.err.at_eof() {
                self.log.write(Severity::Info, "both pipes reached end of stream");
                return Ok(false);
            }
        }
    }

    /// Fold freshly read chunks into the send buffers, persist capture
    /// bytes, and packetize any buffer that crossed the packet size.
    fn check_and_write(&mut self) -> anyhow::Result<()> {
        let out_chunk = self.out.take_buffer();
        if !out_chunk.is_empty() {
            if self.out.mode().captures() {
                if let Err(err) = self.out.append_capture(&out_chunk) {
                    self.log.write(
                        Severity::Error,
                        &format!("stdout capture append failed error {err}"),
                    );
                }
            }
            self.out_buf.extend_from_slice(&out_chunk);
        }
        let err_chunk = self.err.take_buffer();
        if !err_chunk.is_empty() {
            if self.err.mode().captures() {
                if let Err(err) = self.err.append_capture(&err_chunk) {
                    self.log.write(
                        Severity::Error,
                        &format!("stderr capture append failed error {err}"),
                    );
                }
            }
            self.err_buf.extend_from_slice(&err_chunk);
        }

        // any stderr output marks the run as non-clean
        if !self.err_buf.is_empty() {
            self.exit_flag = true;
        }

        let out_over = self.out_buf.len() >= MAX_PACKET_BYTES;
        let err_over = self.err_buf.len() >= MAX_PACKET_BYTES;
        if out_over || err_over {
            let out_packet: Vec<u8> = if out_over {
                self.out_buf.drain(..MAX_PACKET_BYTES).collect()
            } else {
                Vec::new()
            };
            let err_packet: Vec<u8> = if err_over {
                self.err_buf.drain(..MAX_PACKET_BYTES).collect()
            } else {
                Vec::new()
            };
            self.check_and_send(&out_packet, &err_packet)?;
        }
        Ok(())
    }

    /// One mid-run packet. Emits a single progress message when at
    /// least one stream is in a returning mode; payloads of
    /// non-returning streams are redacted.
    fn check_and_send(&mut self, out_packet: &[u8], err_packet: &[u8]) -> anyhow::Result<()> {
        let returns_out = self.command.standard_output.returns();
        let returns_err = self.command.standard_error.returns();
        if !returns_out && !returns_err {
            return Ok(());
        }
        let stdout = if returns_out { out_packet } else { &[][..] };
        let stderr = if returns_err { err_packet } else { &[][..] };
        self.send(Response::progress(self.header(), stdout, stderr))
    }

    fn emit_heartbeat(&mut self) -> anyhow::Result<()> {
        self.log.write(
            Severity::Info,
            &format!("no pipe activity for {HEARTBEAT_SECS}s, sending heartbeat"),
        );
        if self.out_buf.is_empty() && self.err_buf.is_empty() {
            return self.send(Response::heartbeat(self.header(), b"", b""));
        }
        let stdout = if self.command.standard_output.returns() {
            std::mem::take(&mut self.out_buf)
        } else {
            self.out_buf.clear();
            Vec::new()
        };
        let stderr = if self.command.standard_error.returns() {
            std::mem::take(&mut self.err_buf)
        } else {
            self.err_buf.clear();
            Vec::new()
        };
        self.send(Response::heartbeat(self.header(), &stdout, &stderr))
    }

    /// Flush residual buffers on loop exit, before the terminal
    /// message. Redacted-to-empty drains send nothing.
    fn last_check_and_send(&mut self) -> anyhow::Result<()> {
        if self.out_buf.is_empty() && self.err_buf.is_empty() {
            return Ok(());
        }
        let stdout = if self.command.standard_output.returns() {
            std::mem::take(&mut self.out_buf)
        } else {
            self.out_buf.clear();
            Vec::new()
        };
        let stderr = if self.command.standard_error.returns() {
            std::mem::take(&mut self.err_buf)
        } else {
            self.err_buf.clear();
            Vec::new()
        };
        if stdout.is_empty() && stderr.is_empty() {
            return Ok(());
        }
        self.send(Response::progress(self.header(), &stdout, &stderr))
    }

    fn send_exit(&mut self) -> anyhow::Result<()> {
        let exit_code =
            i32::from(self.exit_flag || self.cwd_err || self.uid_err || self.spawn_err);
        self.log.write(Severity::Info, &format!("sending exit exit_code {exit_code}"));
        self.send(Response::exit(self.header(), exit_code))
    }

    fn header(&self) -> ResponseHeader {
        ResponseHeader::for_command(&self.command, self.child_pid, self.response_count)
    }

    /// Encode and enqueue, spinning until the queue accepts the blob.
    fn send(&mut self, response: Response) -> anyhow::Result<()> {
        let blob = response.encode().context("encoding response")?;
        self.log.write(
            Severity::Debug,
            &format!("enqueue response count {} bytes {}", self.response_count, blob.len()),
        );
        if !queue::send_blocking(self.ctx.sink.as_ref(), Bytes::from(blob)) {
            anyhow::bail!("response queue closed before delivery");
        }
        self.response_count += 1;
        Ok(())
    }

    fn kill_child(&mut self) {
        if self.child_pid == 0 {
            return;
        }
        // the child leads its own session, so take down the whole group
        match kill(Pid::from_raw(-self.child_pid), Signal::SIGKILL) {
            Ok(()) => self.log.write(
                Severity::Warning,
                &format!("killed process group pid {}", self.child_pid),
            ),
            Err(errno) => self.log.write(
                Severity::Notice,
                &format!("kill failed pid {} errno {errno}", self.child_pid),
            ),
        }
    }

    /// Bounded reap; a child that keeps running after closing its
    /// streams is left to the process-wide SIGCHLD reaper.
    fn reap(&mut self, child: &mut Child) {
        for _ in 0..40 {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.log.write(Severity::Info, &format!("child reaped status {status}"));
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => return,
            }
        }
        self.log.write(Severity::Notice, "child still running after streams closed");
    }
}
