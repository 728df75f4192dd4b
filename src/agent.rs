//! Agent process supervision.
//!
//! Resource and fencing agents run as child processes. Parameters are
//! delivered on stdin as `key=value` lines, one per line, with the action
//! supplied under the `action` key; the exit code is read back through the
//! OCF numbering. A child that outlives its timeout is sent SIGTERM, five
//! seconds later SIGKILL, and five seconds after that we give up and only
//! warn.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use slog::{debug, warn, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::executor::{AgentRc, OpStatus};

/// Environment variable naming the fencing device an agent runs for.
pub const STONITH_DEVICE_ENV: &str = "CRM_meta_st_device_id";

/// Grace period between the escalation steps.
const ESCALATION_GRACE: Duration = Duration::from_secs(5);

/// One agent invocation.
#[derive(Clone, Debug)]
pub struct AgentInvocation {
    /// Agent executable (name resolved via PATH, or an absolute path).
    pub agent: String,
    pub action: String,
    pub params: HashMap<String, String>,
    /// Device-local port and cluster node name of the victim, when the
    /// action needs one.
    pub victim: Option<AgentVictim>,
    pub timeout: Duration,
    /// Fencing device id, exported in the environment for stonith-class
    /// agents.
    pub device_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AgentVictim {
    pub port: String,
    pub nodename: String,
}

/// What happened to an agent child.
#[derive(Clone, Debug)]
pub struct AgentOutcome {
    pub status: OpStatus,
    pub rc: AgentRc,
    pub raw_exit_code: Option<i32>,
    pub stdout: String,
    pub timed_out: bool,
}

impl AgentOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == OpStatus::Done && self.rc == AgentRc::Ok
    }
}

fn stdin_payload(invocation: &AgentInvocation) -> String {
    let mut payload = String::new();
    payload.push_str(&format!("action={}\n", invocation.action));
    for (key, value) in &invocation.params {
        payload.push_str(&format!("{}={}\n", key, value));
    }
    if let Some(victim) = &invocation.victim {
        payload.push_str(&format!("port={}\n", victim.port));
        payload.push_str(&format!("nodename={}\n", victim.nodename));
    }
    payload
}

async fn reap_with_escalation(
    child: &mut Child,
    total_timeout: Duration,
    log: &Logger,
) -> (Option<std::process::ExitStatus>, bool) {
    match timeout(total_timeout, child.wait()).await {
        Ok(result) => return (result.ok(), false),
        Err(_) => {}
    }

    let pid = match child.id() {
        Some(pid) => Pid::from_raw(pid as i32),
        // Exited between the timeout firing and now.
        None => return (child.wait().await.ok(), true),
    };

    warn!(log, "Agent timed out, sending SIGTERM"; "pid" => pid.as_raw());
    let _ = kill(pid, Signal::SIGTERM);
    if let Ok(result) = timeout(ESCALATION_GRACE, child.wait()).await {
        return (result.ok(), true);
    }

    warn!(log, "Agent ignored SIGTERM, sending SIGKILL"; "pid" => pid.as_raw());
    let _ = kill(pid, Signal::SIGKILL);
    if let Ok(result) = timeout(ESCALATION_GRACE, child.wait()).await {
        return (result.ok(), true);
    }

    // No further signals; the reaper will get it eventually.
    warn!(log, "Agent still running after SIGKILL"; "pid" => pid.as_raw());
    (None, true)
}

/// Run one agent to completion (or escalation), draining its stdout.
pub async fn run_agent(invocation: &AgentInvocation, log: &Logger) -> AgentOutcome {
    debug!(log, "Running agent";
        "agent" => &invocation.agent,
        "action" => &invocation.action,
        "victim" => invocation.victim.as_ref().map(|v| v.nodename.clone()));

    let mut command = Command::new(&invocation.agent);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(device_id) = &invocation.device_id {
        command.env(STONITH_DEVICE_ENV, device_id);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(log, "Failed to spawn agent";
                "agent" => &invocation.agent, "error" => err.to_string());
            return AgentOutcome {
                status: OpStatus::NotInstalled,
                rc: AgentRc::NotInstalled,
                raw_exit_code: None,
                stdout: String::new(),
                timed_out: false,
            };
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let payload = stdin_payload(invocation);
        // A dead child at this point surfaces through wait() below.
        let _ = stdin.write_all(payload.as_bytes()).await;
        drop(stdin);
    }

    let mut stdout_pipe = child.stdout.take();
    let drain = tokio::spawn(async move {
        let mut output = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut output).await;
        }
        output
    });

    let (exit, timed_out) = reap_with_escalation(&mut child, invocation.timeout, log).await;
    let stdout = drain.await.unwrap_or_default();

    let (status, rc, raw_exit_code) = match exit {
        Some(exit) => match exit.code() {
            Some(code) if !timed_out => {
                let rc = AgentRc::from_exit_code(code);
                (OpStatus::Done, rc, Some(code))
            }
            Some(code) => (OpStatus::Timeout, AgentRc::from_exit_code(code), Some(code)),
            // Killed by a signal.
            None if timed_out => (OpStatus::Timeout, AgentRc::UnknownError, None),
            None => (OpStatus::Error, AgentRc::UnknownError, None),
        },
        None if timed_out => (OpStatus::Timeout, AgentRc::UnknownError, None),
        None => (OpStatus::Error, AgentRc::UnknownError, None),
    };

    AgentOutcome { status, rc, raw_exit_code, stdout, timed_out }
}
