// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Descriptor plumbing: pipe/socketpair creation, peer credentials, and
//! transfer of single descriptors through ancillary data.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use io_lifetimes::OwnedFd;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use sendfd::{RecvWithFd, SendWithFd};

use crate::error::{Error, Result};

/// Peer identity read from the kernel at accept time. `pid` is -1 on
/// platforms that do not expose it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Make `count` pipes, returning read sides and write sides.
///
/// For the standard connection set (count == 3) socketpairs are substituted,
/// so the stdin "pipe" of a standard connection is full duplex. Partially
/// created descriptors are released on failure.
pub fn make_pipes(count: usize) -> Result<(Vec<OwnedFd>, Vec<OwnedFd>)> {
    let mut rfds = Vec::with_capacity(count);
    let mut wfds = Vec::with_capacity(count);
    for _ in 0..count {
        if count == 3 {
            let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())?;
            rfds.push(a);
            wfds.push(b);
        } else {
            let (r, w) = nix::unistd::pipe()?;
            rfds.push(r);
            wfds.push(w);
        }
    }
    Ok((rfds, wfds))
}

/// Read peer `(pid, uid, gid)` from an accepted socket.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn get_creds(sock: &UnixStream) -> Result<Credentials> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    let cred = getsockopt(sock, PeerCredentials)?;
    Ok(Credentials {
        pid: cred.pid(),
        uid: cred.uid(),
        gid: cred.gid(),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn get_creds(sock: &UnixStream) -> Result<Credentials> {
    let (uid, gid) = nix::unistd::getpeereid(sock.as_raw_fd())?;
    Ok(Credentials {
        pid: -1,
        uid: uid.as_raw(),
        gid: gid.as_raw(),
    })
}

/// Send exactly one descriptor through ancillary data. The one-byte payload
/// is required by the transport and ignored by the receiver.
pub fn send_fd(sock: &UnixStream, fd: BorrowedFd<'_>) -> Result<()> {
    let n = sock.send_with_fd(b" ", &[fd.as_raw_fd()])?;
    if n == 0 {
        return Err(Error::protocol("descriptor channel closed while sending"));
    }
    Ok(())
}

/// Receive exactly one descriptor. A missing or negative descriptor is a
/// protocol error.
pub fn recv_fd(sock: &UnixStream) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    let mut fds: [RawFd; 1] = [-1];
    let (n, nfds) = sock.recv_with_fd(&mut payload, &mut fds)?;
    if n == 0 && nfds == 0 {
        return Err(Error::protocol("descriptor channel closed"));
    }
    if nfds != 1 || fds[0] < 0 {
        return Err(Error::protocol("expected exactly one descriptor"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fds[0]) })
}
