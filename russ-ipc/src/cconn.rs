// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client side of a call: dial a service, send the framed request, receive
//! the descriptor set, wait for the exit status.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use io_lifetimes::OwnedFd;
use nix::fcntl::{fcntl, F_GETFL, F_SETFL, OFlag};
use nix::poll::PollFlags;
use nix::sys::socket::{connect, socket, sockopt, AddressFamily, SockFlag, SockType, UnixAddr};
use tracing::debug;

use crate::error::{Error, Result};
use crate::time::Deadline;
use crate::{addr, codes, env, fds, io};
use crate::request::{Op, Request};
use crate::CONN_STD_NFDS;

/// Client connection. Owns the dialed socket, the three data descriptors
/// and the system descriptor carrying the exit status.
pub struct ClientConn {
    sd: UnixStream,
    pub fds: [Option<OwnedFd>; CONN_STD_NFDS],
    sysfds: [Option<OwnedFd>; 1],
    req: Request,
}

impl ClientConn {
    /// Dial a service: resolve the spath, connect to the backing socket
    /// within the deadline, send the request, and receive the four
    /// descriptors. On return the connection is streaming.
    pub fn dialv(
        deadline: Deadline,
        op: &str,
        spath: &str,
        attrv: &[String],
        argv: &[String],
    ) -> Result<ClientConn> {
        let targ = addr::find_service_target(spath)?;
        let req = Request::new(Op::from(op), &targ.spath, attrv.to_vec(), argv.to_vec())?;
        if env::debug().dialv {
            debug!(saddr = %targ.saddr.display(), spath = %req.spath, op = %req.op, "dialing");
        }

        let sd = connect_deadline(&targ.saddr, deadline)?;
        io::fd_write_all_deadline(sd.as_fd(), &req.encode()?, deadline)?;

        let mut conn = ClientConn { sd, fds: [None, None, None], sysfds: [None], req };
        for i in 0..CONN_STD_NFDS + 1 {
            let revents = io::wait_ready(conn.sd.as_fd(), PollFlags::POLLIN, deadline)?;
            if !revents.intersects(PollFlags::POLLIN) {
                return Err(Error::protocol("connection closed during descriptor handoff"));
            }
            let fd = fds::recv_fd(&conn.sd)?;
            if i < CONN_STD_NFDS {
                conn.fds[i] = Some(fd);
            } else {
                conn.sysfds[0] = Some(fd);
            }
        }
        Ok(conn)
    }

    pub fn request(&self) -> &Request {
        &self.req
    }

    /// Transfer ownership of a data descriptor (to a forwarder or relay).
    pub fn take_fd(&mut self, i: usize) -> Option<OwnedFd> {
        self.fds[i].take()
    }

    pub fn take_exit_fd(&mut self) -> Option<OwnedFd> {
        self.sysfds[0].take()
    }

    pub fn exit_fd(&self) -> Option<BorrowedFd<'_>> {
        self.sysfds[0].as_ref().map(|fd| fd.as_fd())
    }

    /// Wait for the exit status: poll the system descriptor, read one i32.
    /// A descriptor closed without a status is an abnormal termination
    /// reported as `EXIT_SYS_FAILURE`. Consumes the descriptor; at most one
    /// status per connection.
    pub fn wait(&mut self, deadline: Deadline) -> Result<i32> {
        let fd = self
            .sysfds[0]
            .as_ref()
            .ok_or_else(|| Error::protocol("exit status already consumed"))?;
        let revents = io::wait_ready(fd.as_fd(), PollFlags::POLLIN, deadline)?;

        let mut status = codes::EXIT_SYS_FAILURE;
        if revents.intersects(PollFlags::POLLIN) {
            let mut b = [0u8; 4];
            let n = io::fd_read_exact(fd.as_fd(), &mut b)?;
            if n == b.len() {
                status = i32::from_le_bytes(b);
            }
        }
        self.sysfds[0] = None;
        Ok(status)
    }

    /// Close all descriptors. Closing before the exit status arrives is
    /// legal; the status then defaults to sys-failure.
    pub fn close(self) {}
}

/// Connect to a UNIX socket bounded by a deadline: nonblocking connect,
/// wait for writability, surface the socket error.
fn connect_deadline(path: &Path, deadline: Deadline) -> Result<UnixStream> {
    let sock = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    let flags = OFlag::from_bits_truncate(fcntl(sock.as_raw_fd(), F_GETFL)?);
    fcntl(sock.as_raw_fd(), F_SETFL(flags | OFlag::O_NONBLOCK))?;

    let addr = UnixAddr::new(path)?;
    if env::debug().connect_deadline {
        debug!(path = %path.display(), ?deadline, "connecting");
    }
    match connect(sock.as_raw_fd(), &addr) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINPROGRESS) | Err(nix::errno::Errno::EAGAIN) => {
            io::wait_ready(sock.as_fd(), PollFlags::POLLOUT, deadline)?;
            let err = nix::sys::socket::getsockopt(&sock, sockopt::SocketError)?;
            if err != 0 {
                return Err(std::io::Error::from_raw_os_error(err).into());
            }
        }
        Err(e) => return Err(e.into()),
    }

    fcntl(sock.as_raw_fd(), F_SETFL(flags & !OFlag::O_NONBLOCK))?;
    Ok(UnixStream::from(sock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_deadline_reports_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone");
        // bind then drop to leave a refusing socket file behind
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        let err = connect_deadline(&path, Deadline::after_ms(500)).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_connect_deadline_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc");
        let _lis = std::os::unix::net::UnixListener::bind(&path).unwrap();
        connect_deadline(&path, Deadline::after_ms(500)).unwrap();
    }
}
