//! Built-in demo job types the `scheduler` binary registers so that a
//! descriptor file (spec.md §4.H) has something concrete to reference via
//! its `type` field. Embedding applications register their own factories
//! through [`scheduler_core::JobFactoryRegistry`] instead of these.

use std::process::{Command, Stdio};
use std::time::Duration;

use scheduler_core::{simple_factory, Job, JobFactoryRegistry, RunOutcome, SchedulerResult};
use tracing::{info, warn};

/// Logs its merged context data at `info` level and succeeds. Useful for
/// smoke-testing a descriptor's trigger timing without any side effects.
struct LogJob;

impl Job for LogJob {
    fn run(&mut self, ctx: &scheduler_core::context::JobContext) -> SchedulerResult<RunOutcome> {
        info!(
            job = ctx.job_name(),
            trigger = ctx.trigger_name(),
            fire_time = %ctx.fire_time(),
            "log job fired"
        );
        Ok(RunOutcome::Success)
    }
}

/// Runs the string in its `command` context key as a shell command,
/// polling the child cooperatively so `Scheduler::stop_job` can kill it
/// mid-run instead of waiting for natural completion.
struct ShellJob;

impl Job for ShellJob {
    fn run(&mut self, ctx: &scheduler_core::context::JobContext) -> SchedulerResult<RunOutcome> {
        let Some(command) = ctx.get_str("command") else {
            return Ok(RunOutcome::MissingParameter("command".into()));
        };

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                warn!(error = %err, command, "failed to spawn shell job");
                return Err(scheduler_core::SchedulerError::Runtime(format!(
                    "failed to spawn '{command}': {err}"
                )));
            }
        };

        loop {
            if ctx.is_interrupted() {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(RunOutcome::Interrupted);
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        warn!(command, ?status, "shell job exited non-zero");
                    }
                    return Ok(RunOutcome::Success);
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(err) => {
                    return Err(scheduler_core::SchedulerError::Runtime(format!(
                        "failed to poll '{command}': {err}"
                    )))
                }
            }
        }
    }
}

/// Build the factory registry the `scheduler` binary wires into every
/// descriptor load (spec.md §4.H `type` lookup).
pub fn builtin_registry() -> JobFactoryRegistry {
    let mut registry = JobFactoryRegistry::new();
    registry.register("log", simple_factory(|| LogJob));
    registry.register("shell", simple_factory(|| ShellJob));
    registry
}
