// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service announcement: a bound, listening UNIX socket with a known
//! filesystem path.

use std::fs;
use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use io_lifetimes::OwnedFd;
use nix::poll::PollFlags;
use nix::unistd::{Gid, Uid};
use tracing::warn;

use crate::error::{Error, Result};
use crate::sconn::ServerConn;
use crate::time::Deadline;
use crate::{addr, fds, io};

#[derive(Debug)]
pub struct Listener {
    sd: UnixListener,
    path: Option<PathBuf>,
}

/// True when something is currently accepting connections at `path`.
pub fn is_listening<P: AsRef<Path>>(path: P) -> bool {
    UnixStream::connect(path).is_ok()
}

/// Announce a service at a socket path with the given file mode and
/// ownership.
///
/// A pre-existing path is replaced only when nothing is accepting on it
/// (connect fails with ECONNREFUSED): the stale entry is unlinked and the
/// bind retried exactly once. A path that is accepting is never unlinked.
pub fn announce(spath: &str, mode: u32, uid: Option<u32>, gid: Option<u32>) -> Result<Listener> {
    let path = PathBuf::from(addr::resolve_spath(spath));
    let sd = match UnixListener::bind(&path) {
        Ok(sd) => sd,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            // reclaim only when nothing is accepting: a refused connect
            // marks the entry as stale, anything else leaves it alone
            match UnixStream::connect(&path) {
                Err(ce) if ce.kind() == ErrorKind::ConnectionRefused => {
                    warn!(path = %path.display(), "replacing stale socket file");
                    fs::remove_file(&path).map_err(Error::Transport)?;
                    UnixListener::bind(&path)?
                }
                _ => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };
    fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
    nix::unistd::chown(
        &path,
        uid.map(Uid::from_raw),
        gid.map(Gid::from_raw),
    )?;
    Ok(Listener { sd, path: Some(path) })
}

impl Listener {
    /// Adopt a listening socket inherited from a spawning parent.
    pub fn from_inherited(fd: OwnedFd) -> Listener {
        Listener { sd: UnixListener::from(fd), path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Give up the wrapper, keeping the bound socket. The filesystem entry
    /// stays for a reap collaborator to remove.
    pub fn into_unix_listener(self) -> UnixListener {
        self.sd
    }

    /// Accept one connection within the deadline and read the peer's
    /// credentials.
    pub fn accept(&self, deadline: Deadline) -> Result<ServerConn> {
        let revents = io::wait_ready(self.sd.as_fd(), PollFlags::POLLIN, deadline)?;
        if !revents.intersects(PollFlags::POLLIN) {
            return Err(Error::protocol("listener socket hangup"));
        }
        let (stream, _) = self.sd.accept()?;
        let creds = fds::get_creds(&stream)?;
        if crate::env::debug().accept {
            tracing::debug!(pid = creds.pid, uid = creds.uid, "accepted connection");
        }
        Ok(ServerConn::from_stream(stream, creds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_creates_socket_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        let lis = announce(path.to_str().unwrap(), 0o600, None, None).unwrap();
        assert_eq!(lis.path(), Some(path.as_path()));
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_announce_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        drop(UnixListener::bind(&path).unwrap());
        // the old file refuses connections now, so announce reclaims it
        let _lis = announce(path.to_str().unwrap(), 0o666, None, None).unwrap();
        assert!(is_listening(&path));
    }

    #[test]
    fn test_announce_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        let _live = announce(path.to_str().unwrap(), 0o666, None, None).unwrap();
        announce(path.to_str().unwrap(), 0o666, None, None).unwrap_err();
        assert!(path.exists());
    }

    #[test]
    fn test_accept_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        let lis = announce(path.to_str().unwrap(), 0o666, None, None).unwrap();
        let err = lis.accept(Deadline::after_ms(30)).unwrap_err();
        assert!(matches!(err, Error::DeadlineExpired));
    }

    #[test]
    fn test_accept_reads_peer_creds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        let lis = announce(path.to_str().unwrap(), 0o666, None, None).unwrap();
        let _client = UnixStream::connect(&path).unwrap();
        let sconn = lis.accept(Deadline::after_ms(1000)).unwrap();
        assert_eq!(sconn.creds().uid, nix::unistd::getuid().as_raw());
    }
}
