//! Local script invocation for responder and timer actions.
//!
//! Scripts run with a wall-clock deadline and a capped stdout so a
//! runaway hook cannot stall the automation loop or balloon memory.

use crate::error::{Error, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub const SCRIPT_DEADLINE: Duration = Duration::from_secs(10);
pub const STDOUT_CAP: usize = 1024 * 1024;

#[derive(Debug)]
pub struct ScriptOutput {
    pub stdout: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Runs a script with the given environment additions, enforcing the
/// deadline and the stdout cap.
pub fn run_script(command: &str, env: &[(String, String)]) -> Result<ScriptOutput> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::validation("empty script command"))?;
    let args: Vec<&str> = parts.collect();

    let mut child = Command::new(program)
        .args(&args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    // Drain stdout on a helper thread so a chatty script cannot block on a
    // full pipe while we wait for it.
    let stdout = child.stdout.take().expect("Stdout was piped");
    let (stdout_tx, stdout_rx) = mpsc::channel();

    thread::spawn(move || {
        let mut collected = Vec::new();
        let mut reader = stdout.take((STDOUT_CAP + 1) as u64);
        drop(reader.read_to_end(&mut collected));
        // Discard the rest so the child does not block on a full pipe.
        let mut sink = [0u8; 4096];
        let mut inner = reader.into_inner();
        while matches!(inner.read(&mut sink), Ok(n) if n > 0) {}
        drop(stdout_tx.send(collected));
    });

    let started = Instant::now();
    let mut timed_out = false;

    let exit_code = loop {
        match child.try_wait()? {
            Some(status) => break status.code(),
            None => {
                if started.elapsed() >= SCRIPT_DEADLINE {
                    timed_out = true;
                    drop(child.kill());
                    drop(child.wait());
                    break None;
                }

                thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let mut collected = stdout_rx
        .recv_timeout(Duration::from_secs(1))
        .unwrap_or_default();
    collected.truncate(STDOUT_CAP);

    Ok(ScriptOutput {
        stdout: String::from_utf8_lossy(&collected).into_owned(),
        exit_code,
        timed_out,
    })
}
