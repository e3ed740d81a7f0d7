// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Shell script execution with a multiplexed control channel.

use std::{
    io::{self, Read, Write},
    os::fd::AsFd,
    os::unix::fs::PermissionsExt,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use fs_err as fs;
use nix::poll::{poll, PollFd, PollFlags};
use thiserror::Error;

use super::ctl;
use crate::errors;

const POLL_TIMEOUT_MS: i32 = 100;

/// Where child process output goes.
///
/// Output is always piped through the runner so the control channel can be
/// serviced while the child runs; the sink only decides where the bytes
/// end up.
#[derive(Debug, Clone, Default)]
pub enum Output {
    #[default]
    Inherit,
    Null,
    File(PathBuf),
}

impl Output {
    fn stdout_writer(&self) -> io::Result<Box<dyn Write>> {
        match self {
            Output::Inherit => Ok(Box::new(io::stdout())),
            Output::Null => Ok(Box::new(io::sink())),
            Output::File(path) => Ok(Box::new(fs::OpenOptions::new().create(true).append(true).open(path)?)),
        }
    }

    fn stderr_writer(&self) -> io::Result<Box<dyn Write>> {
        match self {
            Output::Inherit => Ok(Box::new(io::stderr())),
            Output::Null => Ok(Box::new(io::sink())),
            Output::File(path) => Ok(Box::new(fs::OpenOptions::new().create(true).append(true).open(path)?)),
        }
    }
}

/// Control channel serviced while the child runs.
pub struct Ctl<'a> {
    pub server: &'a mut ctl::Server,
    pub handler: &'a mut dyn ctl::Handler,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("process exited with code {exit_code}")]
    Process { exit_code: i32, stderr: Vec<u8> },
    #[error(transparent)]
    Engine(Box<errors::Error>),
    #[error("io")]
    Io(#[from] io::Error),
}

/// Write the script for `commands` at `script_path`.
///
/// The prologue pins the shell, fails fast and traces every command;
/// the optional environment script is sourced before tracing starts.
pub fn write_script(commands: &[String], script_path: &Path, environment_script: Option<&Path>) -> io::Result<()> {
    let mut content = String::from("#!/bin/bash\nset -euo pipefail\n");

    if let Some(environment_script) = environment_script {
        content.push_str(&format!("source {}\n", environment_script.display()));
    }

    content.push_str("set -x\n");

    for command in commands {
        content.push_str(command);
        content.push('\n');
    }

    fs::write(script_path, content)?;
    fs::set_permissions(script_path, std::fs::Permissions::from_mode(0o755))?;

    Ok(())
}

/// Write and execute a script, pumping the control channel until the child
/// exits.
///
/// Child stdout/stderr and the control listener are waited on from a
/// single poll loop so a blocked child writer can never deadlock the
/// server. A fatal control fault kills the child and surfaces the engine
/// error; a non-zero exit surfaces a process error carrying the captured
/// stderr.
pub fn run(
    commands: &[String],
    script_path: &Path,
    cwd: &Path,
    environment_script: Option<&Path>,
    output: &Output,
    mut ctl: Option<Ctl<'_>>,
) -> Result<(), Error> {
    write_script(commands, script_path, environment_script)?;

    let script_path = std::path::absolute(script_path)?;
    log::debug!("executing {}", script_path.display());

    let mut child = Command::new(&script_path)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut child_out = child.stdout.take().unwrap();
    let mut child_err = child.stderr.take().unwrap();

    let mut stdout_sink = output.stdout_writer()?;
    let mut stderr_sink = output.stderr_writer()?;
    let mut captured = Vec::new();

    let mut out_open = true;
    let mut err_open = true;
    let mut buf = [0u8; 8192];

    #[derive(Clone, Copy)]
    enum Source {
        Out,
        Err,
        Listener,
        Conn(usize),
    }

    while out_open || err_open {
        if let Some(ctl) = ctl.as_mut() {
            ctl.server.reap();
        }

        let out_fd = out_open.then(|| child_out.as_fd());
        let err_fd = err_open.then(|| child_err.as_fd());
        let listener_fd = ctl.as_ref().map(|ctl| ctl.server.listener_fd());
        let conn_fds = ctl
            .as_ref()
            .map(|ctl| ctl.server.connection_fds())
            .unwrap_or_default();

        let mut fds = Vec::new();
        let mut sources = Vec::new();

        if let Some(out_fd) = out_fd.as_ref() {
            fds.push(PollFd::new(out_fd, PollFlags::POLLIN));
            sources.push(Source::Out);
        }
        if let Some(err_fd) = err_fd.as_ref() {
            fds.push(PollFd::new(err_fd, PollFlags::POLLIN));
            sources.push(Source::Err);
        }
        if let Some(listener_fd) = listener_fd.as_ref() {
            fds.push(PollFd::new(listener_fd, PollFlags::POLLIN));
            sources.push(Source::Listener);
            for (index, fd) in conn_fds.iter().enumerate() {
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                sources.push(Source::Conn(index));
            }
        }

        let ready = match poll(&mut fds, POLL_TIMEOUT_MS) {
            Ok(ready) => ready,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(err) => return Err(io::Error::from(err).into()),
        };

        let mut events = Vec::new();
        if ready > 0 {
            let interest = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            for (fd, source) in fds.iter().zip(&sources) {
                if fd.revents().unwrap_or(PollFlags::empty()).intersects(interest) {
                    events.push(*source);
                }
            }
        }
        drop(fds);

        for event in events {
            match event {
                Source::Out => {
                    let read = child_out.read(&mut buf)?;
                    if read == 0 {
                        out_open = false;
                    } else {
                        stdout_sink.write_all(&buf[..read])?;
                    }
                }
                Source::Err => {
                    let read = child_err.read(&mut buf)?;
                    if read == 0 {
                        err_open = false;
                    } else {
                        stderr_sink.write_all(&buf[..read])?;
                        captured.extend_from_slice(&buf[..read]);
                    }
                }
                Source::Listener => {
                    let ctl = ctl.as_mut().unwrap();
                    ctl.server.accept_pending()?;
                }
                Source::Conn(index) => {
                    let ctl = ctl.as_mut().unwrap();
                    if let Err(error) = ctl.server.service(index, ctl.handler) {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::Engine(Box::new(error)));
                    }
                }
            }
        }
    }

    let status = child.wait()?;

    if !status.success() {
        let exit_code = status
            .code()
            .or_else(|| status.signal().map(|signal| -signal))
            .unwrap_or(-1);

        return Err(Error::Process {
            exit_code,
            stderr: captured,
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use fs_err as fs;

    use super::{run, write_script, Error, Output};

    #[test]
    fn script_has_the_fixed_prologue() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("build.sh");

        write_script(&["echo hi".to_owned()], &script, None).unwrap();

        assert_eq!(
            fs::read_to_string(&script).unwrap(),
            "#!/bin/bash\nset -euo pipefail\nset -x\necho hi\n"
        );
    }

    #[test]
    fn environment_script_is_sourced_before_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("build.sh");
        let env = dir.path().join("environment.sh");

        write_script(&["echo hi".to_owned()], &script, Some(&env)).unwrap();

        assert_eq!(
            fs::read_to_string(&script).unwrap(),
            format!("#!/bin/bash\nset -euo pipefail\nsource {}\nset -x\necho hi\n", env.display())
        );
    }

    #[test]
    fn script_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");

        write_script(&[], &script, None).unwrap();

        let mode = fs::metadata(&script).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn commands_run_in_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("work");
        fs::create_dir_all(&cwd).unwrap();

        run(
            &["touch marker".to_owned()],
            &dir.path().join("run.sh"),
            &cwd,
            None,
            &Output::Null,
            None,
        )
        .unwrap();

        assert!(cwd.join("marker").is_file());
    }

    #[test]
    fn nonzero_exit_is_a_process_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();

        let result = run(
            &["exit 3".to_owned()],
            &dir.path().join("run.sh"),
            dir.path(),
            None,
            &Output::Null,
            None,
        );

        match result {
            Err(Error::Process { exit_code, stderr }) => {
                assert_eq!(exit_code, 3);
                let stderr = String::from_utf8_lossy(&stderr);
                assert!(stderr.contains("+ exit 3"), "unexpected stderr: {stderr}");
            }
            other => panic!("expected process error, got {other:?}"),
        }
    }

    #[test]
    fn sourced_environment_is_visible_to_commands() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("environment.sh");
        let out = dir.path().join("out.txt");
        fs::write(&env, "export GREETING=hello\n").unwrap();

        run(
            &[format!("echo -n \"$GREETING\" > {}", out.display())],
            &dir.path().join("run.sh"),
            dir.path(),
            Some(&env),
            &Output::Null,
            None,
        )
        .unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "hello");
    }

    #[test]
    fn output_file_sink_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");

        run(
            &["echo hi".to_owned()],
            &dir.path().join("run.sh"),
            dir.path(),
            None,
            &Output::File(log.clone()),
            None,
        )
        .unwrap();

        assert!(fs::read_to_string(&log).unwrap().contains("hi"));
    }
}
