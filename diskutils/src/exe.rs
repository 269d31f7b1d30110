use std::{
    io::Write,
    process::{Command, Output, Stdio},
};

use anyhow::{anyhow, Context, Error};
use log::trace;
use nix::unistd::Uid;
use once_cell::sync::Lazy;

/// Whether this process holds root privileges. Evaluated once; every command
/// builder consults it to decide on a `sudo` prefix.
static IS_ROOT: Lazy<bool> = Lazy::new(|| Uid::effective().is_root());

/// Builds a [`Command`] for `program`, prefixed with `sudo` when the current
/// effective user is not root.
pub fn privileged(program: &str) -> Command {
    command_for(program, *IS_ROOT)
}

fn command_for(program: &str, is_root: bool) -> Command {
    if is_root {
        Command::new(program)
    } else {
        let mut command = Command::new("sudo");
        command.arg(program);
        command
    }
}

/// Extension for `std::process::Output` to check status and extract output.
pub trait OutputChecker {
    /// Check if the process exited successfully.
    fn is_success(&self) -> bool;

    /// Get the exit code of the process, if it exited normally.
    fn exit_code(&self) -> Option<i32>;

    /// Get stdout.
    fn output(&self) -> String;

    /// Get stderr.
    fn error_output(&self) -> String;

    /// All captured output, for error reporting. Streams with nothing in
    /// them are left out entirely.
    fn output_report(&self) -> String {
        let sections: Vec<String> = [("stdout", self.output()), ("stderr", self.error_output())]
            .into_iter()
            .filter(|(_, text)| !text.is_empty())
            .map(|(stream, text)| format!("{stream}:\n{text}\n"))
            .collect();
        sections.join("\n")
    }

    /// Check if the process exited successfully, otherwise produce an error
    /// carrying the captured output.
    fn check(&self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }

        let exit = match self.exit_code() {
            Some(code) => format!("process exited with status: {code}"),
            None => "process was terminated by a signal".into(),
        };

        Err(match self.output_report() {
            report if !report.is_empty() => {
                anyhow!("Process output:\n{report}").context(exit)
            }
            _ => anyhow!("(No output was captured)").context(exit),
        })
    }

    /// Check for success and return stdout.
    fn check_output(&self) -> Result<String, Error> {
        self.check()?;
        Ok(self.output())
    }
}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn output(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }

    fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }
}

/// Extension for [`Command`] to run, capture and check in one call.
pub trait RunAndCheck {
    /// Run to completion and fail unless the process exits cleanly.
    fn run_and_check(&mut self) -> Result<(), Error>;

    /// Run to completion, fail unless the process exits cleanly, and return
    /// stdout.
    fn output_and_check(&mut self) -> Result<String, Error>;

    /// Run to completion and hand back the raw output without judging the
    /// exit status. Only spawning failures are errors.
    fn capture(&mut self) -> Result<Output, Error>;

    /// Like [`RunAndCheck::capture`], but writes `input` to the child's
    /// stdin first.
    fn capture_with_input(&mut self, input: &str) -> Result<Output, Error>;

    /// Shell-style rendering of the program and its arguments.
    fn render_command(&self) -> String;
}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        self.capture()?
            .check()
            .with_context(|| format!("Error when running: {}", self.render_command()))
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        self.capture()?
            .check_output()
            .with_context(|| format!("Error when running: {}", self.render_command()))
    }

    fn capture(&mut self) -> Result<Output, Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");

        let result = self
            .output()
            .with_context(|| format!("Failed to execute: {rendered}"))?;

        trace!(
            "Executed '{rendered}' (status {:?}). Report:\n{}",
            result.exit_code(),
            result.output_report(),
        );

        Ok(result)
    }

    fn capture_with_input(&mut self, input: &str) -> Result<Output, Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}' with piped input");

        self.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self
            .spawn()
            .with_context(|| format!("Failed to execute: {rendered}"))?;

        {
            // Scope closes the pipe so the child sees EOF after the write.
            let mut stdin = child.stdin.take().context("Child process has no stdin")?;
            if !input.is_empty() {
                stdin
                    .write_all(input.as_bytes())
                    .with_context(|| format!("Failed to write input to: {rendered}"))?;
            }
        }

        let result = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for: {rendered}"))?;

        trace!(
            "Executed '{rendered}' (status {:?}). Report:\n{}",
            result.exit_code(),
            result.output_report(),
        );

        Ok(result)
    }

    fn render_command(&self) -> String {
        let mut rendered = self.get_program().to_string_lossy().into_owned();
        for arg in self.get_args() {
            let arg = arg.to_string_lossy();
            rendered.push(' ');
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'') {
                // Shell-style quoting; an embedded quote closes the span,
                // emits an escaped quote, and reopens it.
                rendered.push('\'');
                rendered.push_str(&arg.replace('\'', r"'\''"));
                rendered.push('\'');
            } else {
                rendered.push_str(&arg);
            }
        }
        rendered
    }
}

/// Strips an optional `sudo ` prefix, for assertions that must hold no
/// matter which user runs the test suite.
pub fn unprivileged_rendering(rendered: &str) -> &str {
    rendered.strip_prefix("sudo ").unwrap_or(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_checker() {
        let output = Command::new("echo").arg("something").output().unwrap();
        assert!(output.is_success());
        assert_eq!(output.exit_code(), Some(0));
        assert_eq!(output.output(), "something\n");
        assert_eq!(output.error_output(), "");
        assert!(matches!(output.check(), Ok(())));
        assert!(matches!(output.check_output(), Ok(s) if s == "something\n"));

        let output = Command::new("false").output().unwrap();
        assert!(!output.is_success());
        assert_eq!(output.exit_code(), Some(1));
        output.check().unwrap_err();
    }

    #[test]
    fn test_run_and_check() {
        let mut command = Command::new("echo");
        command.arg("something");
        assert_eq!(command.output_and_check().unwrap(), "something\n");

        Command::new("nonexistent_command_1234")
            .run_and_check()
            .unwrap_err();

        Command::new("false").run_and_check().unwrap_err();

        Command::new("cat")
            .arg("/nonexistent_file_1234")
            .run_and_check()
            .unwrap_err();
    }

    #[test]
    fn test_capture_does_not_judge() {
        let output = Command::new("false").capture().unwrap();
        assert!(!output.is_success());
        assert_eq!(output.exit_code(), Some(1));

        Command::new("nonexistent_command_1234").capture().unwrap_err();
    }

    #[test]
    fn test_capture_with_input() {
        let output = Command::new("cat").capture_with_input("fed via stdin").unwrap();
        assert!(output.is_success());
        assert_eq!(output.output(), "fed via stdin");

        // An empty input still closes the pipe, so the child terminates.
        let output = Command::new("cat").capture_with_input("").unwrap();
        assert!(output.is_success());
        assert_eq!(output.output(), "");
    }

    #[test]
    fn test_render_command() {
        let mut command = Command::new("echo");
        command.arg("something");
        assert_eq!(command.render_command(), "echo something");

        let mut command = Command::new("echo");
        command.arg("something with spaces");
        assert_eq!(command.render_command(), "echo 'something with spaces'");

        let mut command = Command::new("echo");
        command.arg("");
        command.arg("it's");
        assert_eq!(command.render_command(), r"echo '' 'it'\''s'");
    }

    #[test]
    fn test_privilege_prefix() {
        assert_eq!(command_for("mdadm", true).render_command(), "mdadm");

        let mut command = command_for("mdadm", false);
        command.arg("--create");
        assert_eq!(command.render_command(), "sudo mdadm --create");
    }

    #[test]
    fn test_unprivileged_rendering() {
        assert_eq!(unprivileged_rendering("sudo pvs /dev/sdb1"), "pvs /dev/sdb1");
        assert_eq!(unprivileged_rendering("pvs /dev/sdb1"), "pvs /dev/sdb1");
    }
}
