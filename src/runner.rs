//! Channel execution: start scheduling, child supervision, termination.
//!
//! Each channel runs as one task. It waits for its start condition (top
//! level delays plus dependency clauses), spawns the child as the leader of
//! a fresh process group, pumps both output streams line by line, and
//! reports the exit. Cancellation at any suspension point drives the
//! SIGINT → SIGTERM → SIGKILL ladder against the whole group.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::events::{Bus, Event};
use crate::formula::{DepOn, Formula};
use crate::output::{Emitter, StreamKind};

/// Wait between escalating termination signals.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// One channel's scheduler and supervisor, run to completion as a task.
pub struct ChannelRunner {
    pub formula: Formula,
    pub bus: Bus,
    pub emitter: Arc<Emitter>,
    pub events: mpsc::Sender<Event>,
    pub cancel: CancellationToken,
    pub grace: Duration,
}

impl ChannelRunner {
    pub async fn run(self) {
        let satisfied = tokio::select! {
            _ = wait_start_condition(&self.formula, &self.bus) => true,
            _ = self.cancel.cancelled() => false,
        };
        if !satisfied {
            // Shutdown won the race: no STARTED, no process, stays Pending.
            let _ = self
                .events
                .send(Event::Skipped {
                    name: self.formula.name.clone(),
                })
                .await;
            return;
        }
        self.supervise().await;
    }

    async fn supervise(self) {
        let name = self.formula.name.clone();
        let mut command = Command::new(&self.formula.argv[0]);
        command.args(&self.formula.argv[1..]);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.emitter.note(&name, &format!("failed to spawn: {err}"));
                self.bus.fire_ended(&name, -1);
                let _ = self.events.send(Event::SpawnFailed { name }).await;
                return;
            }
        };
        let pid = child.id().unwrap_or(0);

        self.bus.fire_started(&name);
        self.emitter.spawn(&name, &self.formula.argv);
        let _ = self
            .events
            .send(Event::Started {
                name: name.clone(),
                pid,
            })
            .await;

        let mut pumps = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.spawn(pump_stream(
                name.clone(),
                StreamKind::Stdout,
                stdout,
                self.emitter.clone(),
                self.formula.actions.suppress_stdout(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.spawn(pump_stream(
                name.clone(),
                StreamKind::Stderr,
                stderr,
                self.emitter.clone(),
                self.formula.actions.suppress_stderr(),
            ));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status,
            None => self.terminate(&mut child, pid).await,
        };

        // Streams hit EOF once the child is gone; drain them before the
        // exit record so `<`/`!` always precede `=` within the channel.
        while pumps.join_next().await.is_some() {}

        let code = match status {
            Ok(status) => encode_status(status),
            Err(err) => {
                self.emitter.note(&name, &format!("wait failed: {err}"));
                -1
            }
        };
        self.emitter.exit(&name, code);
        self.bus.fire_ended(&name, code);
        let _ = self.events.send(Event::Ended { name, code }).await;
    }

    // SIGINT, then SIGTERM, then SIGKILL, each a grace period apart.
    async fn terminate(&self, child: &mut Child, pid: u32) -> io::Result<ExitStatus> {
        self.signal_group(pid, libc::SIGINT, "SIGINT");
        if let Some(status) = wait_for_exit(child, self.grace).await? {
            return Ok(status);
        }
        self.signal_group(pid, libc::SIGTERM, "SIGTERM");
        if let Some(status) = wait_for_exit(child, self.grace).await? {
            return Ok(status);
        }
        self.signal_group(pid, libc::SIGKILL, "SIGKILL");
        child.wait().await
    }

    fn signal_group(&self, pid: u32, signal: i32, label: &str) {
        if let Err(err) = send_group_signal(pid, signal) {
            self.emitter
                .note(&self.formula.name, &format!("{label} failed: {err}"));
        }
    }
}

/// Resolves when the channel may start: the summed top-level delays counted
/// from now, and every dependency clause counted from the moment its signal
/// fires. All clauses run concurrently; the latest one wins.
pub(crate) async fn wait_start_condition(formula: &Formula, bus: &Bus) {
    let mut waits = JoinSet::new();
    for dep in &formula.deps {
        let bus = bus.clone();
        let dep = dep.clone();
        waits.spawn(async move {
            if !dep.target.is_empty() {
                match dep.on {
                    DepOn::Start => bus.started(&dep.target).await,
                    DepOn::End => {
                        bus.ended(&dep.target).await;
                    }
                }
            }
            tokio::time::sleep(dep.after_total()).await;
        });
    }
    tokio::time::sleep(formula.start_delay_total()).await;
    while waits.join_next().await.is_some() {}
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

// Reads one stream line by line, byte-preserving. Suppressed streams are
// still drained so the child never blocks on a full pipe.
async fn pump_stream<R>(
    name: String,
    stream: StreamKind,
    reader: R,
    emitter: Arc<Emitter>,
    suppress: bool,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                if !suppress {
                    emitter.line(&name, stream, &String::from_utf8_lossy(&buf));
                }
            }
            // A read error on a child pipe is an end of stream.
            Err(_) => break,
        }
    }
}

fn encode_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Signals the whole group first, then the leader directly in case it moved
/// itself out of the group.
pub fn send_group_signal(pid: u32, signal: i32) -> io::Result<()> {
    let pid = pid as i32;
    let group = unsafe { libc::kill(-pid, signal) };
    let direct = unsafe { libc::kill(pid, signal) };
    if group == 0 || direct == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Best-effort sweep for process-group members that outlived their leader.
/// The group-wide signal is the primary mechanism; this catches grandchildren
/// re-parented to init.
pub fn reap_orphans(pgids: &[i32], emitter: &Emitter) {
    if pgids.is_empty() {
        return;
    }
    match find_group_members(pgids) {
        Ok(pids) => {
            for pid in pids {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
        Err(err) => emitter.note("*", &format!("orphan scan failed: {err}")),
    }
}

#[cfg(target_os = "linux")]
fn find_group_members(pgids: &[i32]) -> io::Result<Vec<i32>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        // Processes come and go while we scan; a vanished entry is fine.
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some(pgid) = stat_pgid(&stat) {
            if pgids.contains(&pgid) {
                found.push(pid);
            }
        }
    }
    Ok(found)
}

#[cfg(target_os = "linux")]
fn stat_pgid(stat: &str) -> Option<i32> {
    // pid (comm) state ppid pgrp ...; comm may itself contain spaces and
    // parentheses, so split after the last ')'.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(2)?.parse().ok()
}

#[cfg(target_os = "macos")]
fn find_group_members(pgids: &[i32]) -> io::Result<Vec<i32>> {
    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,pgid="])
        .output()?;
    let mut found = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(pgid)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (Ok(pid), Ok(pgid)) = (pid.parse::<i32>(), pgid.parse::<i32>()) else {
            continue;
        };
        if pgids.contains(&pgid) {
            found.push(pid);
        }
    }
    Ok(found)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn find_group_members(_pgids: &[i32]) -> io::Result<Vec<i32>> {
    Ok(Vec::new())
}
