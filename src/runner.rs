//! Build execution: spawning the packaging tool and capturing its output.
//!
//! The child runs in its own process group with both pipes captured. One task
//! per pipe drains it line by line, forwarding every line to the live sink as
//! soon as it arrives and keeping a transcript. Both transcripts end up in the
//! build log, stdout first, then a labeled stderr section.

use log::{info, warn};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ForgeError, Result};

/// Heading that separates the two transcripts in the build log
pub const STDERR_HEADING: &str = "\nStandard Error:\n";

/// How long readers may keep draining after the child itself has exited.
/// Past this, leftover processes in the group are killed so the pipes close.
/// If the pipes are still open one more grace period later, the readers are
/// abandoned with whatever they have read.
const READER_GRACE: Duration = Duration::from_secs(5);

/// Process group of the build currently running, 0 when idle
static ACTIVE_GROUP: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of child output, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl BuildCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How the child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Termination {
    Exited(i32),
    Signalled(i32),
    TimedOut,
    Cancelled,
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signalled(signal),
            (None, None) => Self::Exited(-1),
        }
    }

    /// Exit code as a shell would report it; signals map to `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signalled(signal) => Some(128 + signal),
            Self::TimedOut | Self::Cancelled => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Everything captured from one build invocation.
#[derive(Debug, Clone)]
pub struct BuildRun {
    pub command_line: String,
    pub working_dir: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub termination: Termination,
    pub log_path: PathBuf,
}

/// Limits applied to a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub log_path: PathBuf,
    pub timeout: Option<Duration>,
    /// Flipping the value to `true` kills the build
    pub cancel: watch::Receiver<bool>,
}

/// Run `command` in `working_dir`, streaming its output into `sink`.
///
/// # Arguments
///
/// * `command` - Program and arguments; the program is looked up on `PATH`
/// * `working_dir` - Directory the child runs in
/// * `sink` - Called from the reader tasks as each line arrives
/// * `options` - Log destination, optional time limit and cancel switch
///
/// # Returns
///
/// The captured run, once the child has terminated and both pipes are
/// drained or abandoned. A non-zero exit, a timeout and a cancellation are
/// all normal results here.
///
/// # Errors
///
/// `ForgeError::Spawn` when the process cannot be launched or waited on, and
/// `ForgeError::Staging` when the log cannot be written.
pub async fn run_build<S>(
    command: &BuildCommand,
    working_dir: &Path,
    sink: S,
    options: RunOptions,
) -> Result<BuildRun>
where
    S: Fn(OutputLine) + Clone + Send + 'static,
{
    let command_line = command.command_line();
    info!("[Build] Running `{}` in {:?}", command_line, working_dir);

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ForgeError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let group = child.id().map(|pid| ActiveGroup::register(pid as i32));

    let stdout = child.stdout.take().ok_or_else(|| ForgeError::Spawn {
        program: command.program.clone(),
        source: std::io::Error::other("stdout was not captured"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| ForgeError::Spawn {
        program: command.program.clone(),
        source: std::io::Error::other("stderr was not captured"),
    })?;

    let (abandon, abandoned) = watch::channel(false);
    let stdout_task = tokio::spawn(drain(
        stdout,
        StreamKind::Stdout,
        sink.clone(),
        abandoned.clone(),
    ));
    let stderr_task = tokio::spawn(drain(stderr, StreamKind::Stderr, sink, abandoned));

    let pgid = group.as_ref().map(|g| g.0);
    let termination = wait_for_exit(&mut child, pgid, options.cancel, options.timeout)
        .await
        .map_err(|source| ForgeError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let (stdout, stderr) = collect_transcripts(stdout_task, stderr_task, pgid, abandon).await;
    drop(group);

    if termination.success() {
        info!("[Build] `{}` completed successfully", command_line);
    } else {
        warn!("[Build] `{}` stopped: {:?}", command_line, termination);
    }

    write_log(&options.log_path, &stdout, &stderr).await?;

    Ok(BuildRun {
        command_line,
        working_dir: working_dir.to_path_buf(),
        stdout,
        stderr,
        termination,
        log_path: options.log_path,
    })
}

/// Kill the process group of the running build, if any. Used on shutdown.
pub fn kill_active_build() -> bool {
    let pgid = ACTIVE_GROUP.load(Ordering::SeqCst);
    if pgid == 0 {
        return false;
    }
    kill_group(pgid);
    true
}

struct ActiveGroup(i32);

impl ActiveGroup {
    fn register(pgid: i32) -> Self {
        ACTIVE_GROUP.store(pgid, Ordering::SeqCst);
        Self(pgid)
    }
}

impl Drop for ActiveGroup {
    fn drop(&mut self) {
        let _ = ACTIVE_GROUP.compare_exchange(self.0, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

fn kill_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => info!("[Build] Sent SIGKILL to process group {}", pgid),
        Err(nix::errno::Errno::ESRCH) => (),
        Err(e) => warn!("[Build] Failed to kill process group {}: {}", pgid, e),
    }
}

enum Stop {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

async fn wait_for_exit(
    child: &mut Child,
    pgid: Option<i32>,
    mut cancel: watch::Receiver<bool>,
    timeout: Option<Duration>,
) -> std::io::Result<Termination> {
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                // Sender gone: nobody can cancel any more
                std::future::pending::<()>().await;
            }
        }
    };

    let stop = tokio::select! {
        status = child.wait() => Stop::Exited(status?),
        () = deadline => Stop::TimedOut,
        () = cancelled => Stop::Cancelled,
    };

    let termination = match stop {
        Stop::Exited(status) => return Ok(Termination::from_status(status)),
        Stop::TimedOut => {
            warn!("[Build] Timed out, killing build");
            Termination::TimedOut
        }
        Stop::Cancelled => {
            info!("[Build] Cancelled, killing build");
            Termination::Cancelled
        }
    };

    if let Some(pgid) = pgid {
        kill_group(pgid);
    }
    if let Err(e) = child.kill().await {
        warn!("[Build] Failed to kill build process: {}", e);
    }
    Ok(termination)
}

async fn collect_transcripts(
    mut stdout_task: JoinHandle<String>,
    mut stderr_task: JoinHandle<String>,
    pgid: Option<i32>,
    abandon: watch::Sender<bool>,
) -> (String, String) {
    let grace = tokio::time::sleep(READER_GRACE);
    tokio::pin!(grace);

    let mut stdout = None;
    let mut stderr = None;
    let mut killed = false;
    let mut abandoned = false;

    while stdout.is_none() || stderr.is_none() {
        tokio::select! {
            out = &mut stdout_task, if stdout.is_none() => stdout = Some(transcript_of(out)),
            err = &mut stderr_task, if stderr.is_none() => stderr = Some(transcript_of(err)),
            () = &mut grace, if !abandoned => {
                if killed {
                    // Held open from outside the group, e.g. a daemonized helper
                    warn!("[Build] Output still open after killing the group, abandoning readers");
                    abandon.send_replace(true);
                    abandoned = true;
                } else {
                    // Something else in the group still holds the pipes open
                    warn!("[Build] Output still open after exit, killing leftover processes");
                    if let Some(pgid) = pgid {
                        kill_group(pgid);
                    }
                    killed = true;
                    grace.as_mut().reset(tokio::time::Instant::now() + READER_GRACE);
                }
            }
        }
    }

    (stdout.unwrap_or_default(), stderr.unwrap_or_default())
}

fn transcript_of(joined: std::result::Result<String, tokio::task::JoinError>) -> String {
    joined.unwrap_or_else(|e| {
        warn!("[Build] Output reader failed: {}", e);
        String::new()
    })
}

async fn drain<R, S>(
    reader: R,
    stream: StreamKind,
    sink: S,
    mut abandoned: watch::Receiver<bool>,
) -> String
where
    R: AsyncRead + Unpin,
    S: Fn(OutputLine),
{
    let mut reader = BufReader::new(reader);
    let mut transcript = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read,
            _ = abandoned.wait_for(|stop| *stop) => break,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                transcript.push_str(&text);
                transcript.push('\n');
                sink(OutputLine { stream, text });
            }
            Err(e) => {
                warn!("[Build] {:?} read error: {}", stream, e);
                break;
            }
        }
    }

    transcript
}

async fn write_log(path: &Path, stdout: &str, stderr: &str) -> Result<()> {
    let mut log = String::with_capacity(stdout.len() + stderr.len() + STDERR_HEADING.len());
    log.push_str(stdout);
    log.push_str(STDERR_HEADING);
    log.push_str(stderr);

    tokio::fs::write(path, log)
        .await
        .map_err(|e| ForgeError::staging(path, e))?;
    info!("[Build] Wrote build log to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn channel_sink() -> (
        impl Fn(OutputLine) + Clone + Send + 'static,
        mpsc::UnboundedReceiver<OutputLine>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = move |line: OutputLine| {
            let _ = tx.send(line);
        };
        (sink, rx)
    }

    fn sh(script: &str) -> BuildCommand {
        BuildCommand::new("sh", ["-c", script])
    }

    fn options(dir: &Path, limit: Option<Duration>) -> (RunOptions, watch::Sender<bool>) {
        let (cancel_tx, cancel) = watch::channel(false);
        let options = RunOptions {
            log_path: dir.join("build_output.log"),
            timeout: limit,
            cancel,
        };
        (options, cancel_tx)
    }

    #[tokio::test]
    async fn lines_arrive_in_order_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), None);
        let workdir = dir.path().to_path_buf();

        let handle = tokio::spawn(async move {
            run_build(&sh("echo one; echo two; sleep 2; echo three"), &workdir, tx, opts).await
        });

        for expected in ["one", "two"] {
            let line = timeout(Duration::from_millis(1500), rx.recv())
                .await
                .expect("line should arrive while the child is still running")
                .unwrap();
            assert_eq!(line, OutputLine { stream: StreamKind::Stdout, text: expected.into() });
        }
        assert!(!handle.is_finished());

        let run = handle.await.unwrap().unwrap();
        assert!(run.termination.success());
        assert_eq!(run.stdout, "one\ntwo\nthree\n");
        assert_eq!(rx.recv().await.unwrap().text, "three");
    }

    #[tokio::test]
    async fn log_holds_both_transcripts_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), None);

        let run = run_build(&sh("echo out; echo err >&2; exit 3"), dir.path(), tx, opts)
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::Exited(3));
        assert!(!run.termination.success());
        assert_eq!(run.stderr, "err\n");
        let log = std::fs::read_to_string(&run.log_path).unwrap();
        assert_eq!(log, "out\n\nStandard Error:\nerr\n");

        let mut seen = Vec::new();
        while let Ok(line) = rx.try_recv() {
            seen.push(line);
        }
        assert!(seen.contains(&OutputLine { stream: StreamKind::Stderr, text: "err".into() }));
    }

    #[tokio::test]
    async fn log_is_overwritten_each_run() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), None);
        run_build(&sh("echo first"), dir.path(), tx.clone(), opts.clone()).await.unwrap();
        let run = run_build(&sh("echo second"), dir.path(), tx, opts).await.unwrap();

        let log = std::fs::read_to_string(&run.log_path).unwrap();
        assert_eq!(log, "second\n\nStandard Error:\n");
    }

    #[tokio::test]
    async fn exit_137_keeps_partial_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), None);

        let run = run_build(&sh("echo partial; exit 137"), dir.path(), tx, opts)
            .await
            .unwrap();

        assert_eq!(run.termination.exit_code(), Some(137));
        assert!(!run.termination.success());
        assert_eq!(run.stdout, "partial\n");
    }

    #[tokio::test]
    async fn signal_death_maps_to_shell_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), None);

        let run = run_build(&sh("echo before; kill -9 $$"), dir.path(), tx, opts)
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::Signalled(9));
        assert_eq!(run.termination.exit_code(), Some(137));
        assert_eq!(run.stdout, "before\n");
    }

    #[tokio::test]
    async fn cancel_kills_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = channel_sink();
        let (opts, cancel) = options(dir.path(), None);
        let workdir = dir.path().to_path_buf();

        let handle = tokio::spawn(async move {
            run_build(&sh("echo started; sleep 30; echo never"), &workdir, tx, opts).await
        });
        assert_eq!(rx.recv().await.unwrap().text, "started");
        cancel.send(true).unwrap();

        let run = timeout(Duration::from_secs(10), handle)
            .await
            .expect("cancelled build should stop promptly")
            .unwrap()
            .unwrap();
        assert_eq!(run.termination, Termination::Cancelled);
        assert_eq!(run.termination.exit_code(), None);
        assert_eq!(run.stdout, "started\n");
        assert!(run.log_path.exists());
    }

    #[tokio::test]
    async fn timeout_stops_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), Some(Duration::from_millis(200)));

        let run = timeout(
            Duration::from_secs(10),
            run_build(&sh("sleep 30"), dir.path(), tx, opts),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(run.termination, Termination::TimedOut);
        assert!(!run.termination.success());
    }

    #[tokio::test]
    async fn pipes_held_outside_the_group_do_not_hang_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), Some(Duration::from_secs(2)));

        let started = std::time::Instant::now();
        let run = timeout(
            Duration::from_secs(20),
            run_build(&sh("setsid sleep 60 & echo hi"), dir.path(), tx, opts),
        )
        .await
        .expect("readers should be abandoned after the grace periods")
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(run.termination, Termination::Exited(0));
        assert_eq!(run.stdout, "hi\n");
        assert!(run.log_path.exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = channel_sink();
        let (opts, _cancel) = options(dir.path(), None);

        let err = run_build(
            &BuildCommand::new("no-such-builder-on-this-host", ["android", "debug"]),
            dir.path(),
            tx,
            opts,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ForgeError::Spawn { .. }));
    }

    #[test]
    fn command_line_joins_arguments() {
        let command = BuildCommand::new("buildozer", ["-v", "android", "debug"]);
        assert_eq!(command.command_line(), "buildozer -v android debug");
    }
}
