//! Ownership of the external server process.
//!
//! The child runs in its own process group so that signals reach any helpers it spawns.
//! `stop` walks the interrupt → terminate → kill ladder; dropping a supervisor that still
//! owns a live child kills the whole group.

use crate::error::BenchError;
use bytes::BytesMut;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Most recent stderr bytes kept for diagnostics.
const STDERR_CAPACITY: usize = 64 * 1024;

/// Grace periods of the shutdown ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub interrupt_grace: Duration,
    pub terminate_grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            interrupt_grace: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

/// How the process ended when `stop` was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    AlreadyExited,
    Interrupt,
    Terminate,
    Kill,
}

pub struct ProcessSupervisor {
    policy: StopPolicy,
    child: Option<Child>,
    pid: Option<u32>,
    stderr: Arc<Mutex<BytesMut>>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    pub fn new(policy: StopPolicy) -> Self {
        Self {
            policy,
            child: None,
            pid: None,
            stderr: Arc::new(Mutex::new(BytesMut::new())),
            reader: None,
        }
    }

    /// True while the owned child has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn `command` (program first) with stdout discarded and stderr captured.
    pub fn start(&mut self, command: &[String]) -> Result<u32, BenchError> {
        if self.is_running() {
            return Err(BenchError::AlreadyRunning {
                pid: self.pid.unwrap_or_default(),
            });
        }
        let (program, args) = command.split_first().ok_or(BenchError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        clear(&self.stderr);
        let mut child = cmd.spawn().map_err(|source| BenchError::Start {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        if let Some(pipe) = child.stderr.take() {
            self.reader = Some(tokio::spawn(drain_stderr(pipe, self.stderr.clone())));
        }
        tracing::debug!(pid, program = %program, "server process spawned");

        self.child = Some(child);
        self.pid = Some(pid);
        Ok(pid)
    }

    /// Stop the child, escalating until it is gone. No-op without a child; never fails.
    ///
    /// The handle is only released once the child is gone, so a `stop` that is itself
    /// cancelled can simply be called again.
    pub async fn stop(&mut self) -> Option<Escalation> {
        let policy = self.policy;
        let pid = self.pid.unwrap_or_default();
        let child = self.child.as_mut()?;

        let how = if matches!(child.try_wait(), Ok(Some(_))) {
            Escalation::AlreadyExited
        } else if signal_group(pid, Signal::Interrupt)
            && exited_within(child, policy.interrupt_grace).await
        {
            Escalation::Interrupt
        } else if signal_group(pid, Signal::Terminate)
            && exited_within(child, policy.terminate_grace).await
        {
            Escalation::Terminate
        } else {
            signal_group(pid, Signal::Kill);
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid, error = %e, "kill after group signal");
            }
            if let Err(e) = child.wait().await {
                tracing::warn!(pid, error = %e, "waiting for killed server failed");
            }
            Escalation::Kill
        };
        self.child = None;
        self.pid = None;

        // Helpers that inherited the pipe may still hold it open.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::debug!(pid, ?how, "server process stopped");
        Some(how)
    }

    /// Everything captured from the child's stderr so far (lossy UTF-8).
    pub fn stderr_snapshot(&self) -> String {
        let buf = self.stderr.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// The last `max_chars` characters of captured stderr.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        let all = self.stderr_snapshot();
        let skip = all.chars().count().saturating_sub(max_chars);
        all.chars().skip(skip).collect()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Some(pid) = child.id() {
                signal_group(pid, Signal::Kill);
            }
            let _ = child.start_kill();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn exited_within(child: &mut Child, grace: Duration) -> bool {
    matches!(tokio::time::timeout(grace, child.wait()).await, Ok(Ok(_)))
}

async fn drain_stderr(mut pipe: tokio::process::ChildStderr, sink: Arc<Mutex<BytesMut>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > STDERR_CAPACITY {
                    let excess = buf.len() - STDERR_CAPACITY;
                    let _ = buf.split_to(excess);
                }
            }
        }
    }
}

fn clear(sink: &Mutex<BytesMut>) {
    sink.lock().unwrap_or_else(|e| e.into_inner()).clear();
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

/// Deliver `sig` to the child's process group. Returns false when nothing was sent.
#[cfg(unix)]
fn signal_group(pid: u32, sig: Signal) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pgid <= 0 {
        return false;
    }
    let signo = match sig {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the group id is our own
    // child's, created with process_group(0).
    unsafe { libc::kill(-pgid, signo) == 0 }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: Signal) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn quick_policy() -> StopPolicy {
        StopPolicy {
            interrupt_grace: Duration::from_millis(300),
            terminate_grace: Duration::from_millis(300),
        }
    }

    fn alive(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[tokio::test]
    async fn stop_without_process_is_noop() {
        let mut sup = ProcessSupervisor::new(StopPolicy::default());
        assert_eq!(sup.stop().await, None);
        assert_eq!(sup.stop().await, None);
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn interrupt_is_enough_for_a_cooperative_process() {
        let mut sup = ProcessSupervisor::new(quick_policy());
        let pid = sup.start(&sh("sleep 30")).unwrap();
        assert!(sup.is_running());
        assert_eq!(sup.stop().await, Some(Escalation::Interrupt));
        assert!(!alive(pid));
        assert!(!sup.is_running());
        assert_eq!(sup.stop().await, None);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed() {
        let mut sup = ProcessSupervisor::new(quick_policy());
        let pid = sup
            .start(&sh("trap '' INT TERM; while :; do sleep 1; done"))
            .unwrap();
        // Give the shell time to install its traps.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        assert_eq!(sup.stop().await, Some(Escalation::Kill));
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn refuses_second_start_while_running() {
        let mut sup = ProcessSupervisor::new(quick_policy());
        let pid = sup.start(&sh("sleep 30")).unwrap();
        match sup.start(&sh("sleep 30")) {
            Err(BenchError::AlreadyRunning { pid: running }) => assert_eq!(running, pid),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        sup.stop().await;
    }

    #[tokio::test]
    async fn exited_process_can_be_replaced() {
        let mut sup = ProcessSupervisor::new(quick_policy());
        sup.start(&sh("exit 0")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sup.is_running());
        assert!(sup.start(&sh("sleep 30")).is_ok());
        assert_eq!(sup.stop().await, Some(Escalation::Interrupt));
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_error() {
        let mut sup = ProcessSupervisor::new(quick_policy());
        let err = sup
            .start(&["/nonexistent/llama-server".to_string(), "-m".to_string()])
            .unwrap_err();
        assert!(matches!(err, BenchError::Start { .. }));
        assert!(matches!(sup.start(&[]), Err(BenchError::EmptyCommand)));
        assert_eq!(sup.stop().await, None);
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let mut sup = ProcessSupervisor::new(quick_policy());
        sup.start(&sh("echo 'error: model file not found' >&2; sleep 30"))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !sup.stderr_snapshot().contains("model file not found") {
            assert!(Instant::now() < deadline, "stderr never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sup.stderr_tail(6), "found\n");
        sup.stop().await;
    }
}
