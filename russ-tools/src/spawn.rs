// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spawning transient servers: create a fresh socket path, bind it, and
//! start the configured server binary with the listening socket inherited
//! on descriptor 3.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use russ_ipc::listener::Listener;
use russ_ipc::{addr, listener, Conf};

/// Listening socket descriptor number a spawned server inherits.
pub const SPAWN_LISTENER_FD: i32 = 3;

pub struct SpawnPlan {
    pub conf: Conf,
    pub server_bin: String,
    pub sock_path: PathBuf,
    pub passthrough: Vec<String>,
}

/// Digest `-f`/`-c` arguments into a plan: which server binary to run and
/// which socket path to announce. Without `main:path` a fresh path is
/// generated under the temporary directory.
pub fn plan(mut args: Vec<String>) -> Result<SpawnPlan> {
    let conf = Conf::load_args(&mut args).map_err(|e| anyhow::anyhow!("{e}"))?;
    let server_bin = conf
        .get("main", "server")
        .context("main:server is required")?
        .to_string();
    let sock_path = match conf.get("main", "path") {
        Some(path) => PathBuf::from(addr::resolve_spath(path)),
        None => fresh_socket_path(),
    };
    Ok(SpawnPlan { conf, server_bin, sock_path, passthrough: args })
}

fn fresh_socket_path() -> PathBuf {
    let tmp = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    PathBuf::from(tmp).join(format!(".russ-{}-{nanos:08}", std::process::id()))
}

/// Bind the socket for the plan.
pub fn announce(plan: &SpawnPlan) -> Result<Listener> {
    let mode = u32::from_str_radix(&plan.conf.get_or("main", "mode", "0600"), 8)
        .context("bad main:mode")?;
    listener::announce(
        plan.sock_path.to_str().context("socket path is not utf-8")?,
        mode,
        None,
        None,
    )
    .map_err(|e| anyhow::anyhow!("cannot announce {}: {e}", plan.sock_path.display()))
}

/// The bare listening descriptor handed on to the server.
pub fn listener_fd(lis: Listener) -> OwnedFd {
    OwnedFd::from(lis.into_unix_listener())
}

/// Build the server command line: the inherited-descriptor setting, every
/// configuration item except the spawn-only ones, then passthrough args.
/// The descriptor is moved onto fd 3 in the child just before exec.
pub fn server_command(plan: &SpawnPlan, lis_fd: OwnedFd) -> Command {
    let mut cmd = Command::new(&plan.server_bin);
    cmd.arg("-c").arg(format!("main:sd={SPAWN_LISTENER_FD}"));
    for section in plan.conf.sections() {
        for option in plan.conf.options(section) {
            if section == "main" && matches!(option, "server" | "path" | "sd" | "mode") {
                continue;
            }
            if let Some(value) = plan.conf.get(section, option) {
                cmd.arg("-c").arg(format!("{section}:{option}={value}"));
            }
        }
    }
    cmd.args(&plan.passthrough);

    let raw = lis_fd.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            // dup2 lands the listener on fd 3 and clears close-on-exec
            if raw != SPAWN_LISTENER_FD {
                if libc::dup2(raw, SPAWN_LISTENER_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else {
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    // keep the descriptor open across spawn; the child owns it after exec
    std::mem::forget(lis_fd);
    cmd
}

/// Locate the reaper binary: next to the current executable, else on PATH.
pub fn rureap_command(pid: i32, sock_path: &Path) -> Command {
    let rureap = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("rureap")))
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rureap".to_string());
    let mut cmd = Command::new(rureap);
    cmd.arg(pid.to_string()).arg(sock_path);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_requires_server() {
        let args: Vec<String> = vec!["-c".into(), "main:path=/tmp/x".into()];
        assert!(plan(args).is_err());
    }

    #[test]
    fn test_plan_generates_fresh_path() {
        let args: Vec<String> = vec!["-c".into(), "main:server=/bin/true".into()];
        let plan = plan(args).unwrap();
        assert_eq!(plan.server_bin, "/bin/true");
        assert!(plan.sock_path.to_string_lossy().contains(".russ-"));
    }

    #[test]
    fn test_server_command_filters_spawn_options() {
        let args: Vec<String> = vec![
            "-c".into(),
            "main:server=/bin/true".into(),
            "-c".into(),
            "main:accepttimeout=30".into(),
            "--".into(),
            "extra".into(),
        ];
        let plan = plan(args).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        let lis = listener::announce(path.to_str().unwrap(), 0o600, None, None).unwrap();

        let cmd = server_command(&plan, listener_fd(lis));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"main:sd=3".to_string()));
        assert!(args.contains(&"main:accepttimeout=30".to_string()));
        assert!(args.contains(&"extra".to_string()));
        assert!(!args.iter().any(|a| a.contains("main:server=")));
    }
}
