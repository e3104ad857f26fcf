// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Descriptor-level I/O: EINTR-retrying reads and writes plus the
//! deadline-aware poll wrapper every blocking operation goes through.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::BorrowedFd;

use io_lifetimes::AsFilelike;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Error, Result};
use crate::time::Deadline;

/// Hangup-ish conditions: hangup, error, invalid descriptor.
pub fn poll_hen() -> PollFlags {
    PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL
}

pub(crate) fn poll_timeout(deadline: Deadline) -> PollTimeout {
    match deadline.timeout_ms() {
        None => PollTimeout::NONE,
        Some(ms) => {
            let ms = ms.min(i32::MAX as u64) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

/// Poll with automatic restart on signal interruption, recomputing the
/// remaining timeout each iteration until the deadline is reached. Returns
/// the number of ready descriptors; zero means the deadline passed.
pub fn poll_deadline(fds: &mut [PollFd], deadline: Deadline) -> Result<usize> {
    loop {
        match poll(fds, poll_timeout(deadline)) {
            Ok(n) if n > 0 => return Ok(n as usize),
            Ok(_) => {
                if deadline.expired() {
                    return Ok(0);
                }
            }
            Err(Errno::EINTR) => {
                if deadline.expired() {
                    return Ok(0);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Wait until `fd` reports one of `events` (or a hangup condition). Errors
/// with `DeadlineExpired` when the deadline passes first.
pub fn wait_ready(fd: BorrowedFd<'_>, events: PollFlags, deadline: Deadline) -> Result<PollFlags> {
    let mut fds = [PollFd::new(fd, events)];
    if poll_deadline(&mut fds, deadline)? == 0 {
        return Err(Error::DeadlineExpired);
    }
    Ok(fds[0].revents().unwrap_or(PollFlags::empty()))
}

/// Read with auto retry on EINTR.
pub fn fd_read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let file = fd.as_filelike_view::<File>();
    loop {
        match (&*file).read(buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            r => return r,
        }
    }
}

/// Read a line of bytes; stops after a newline, EOF, or a full buffer.
pub fn fd_readline(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = fd_read(fd, &mut buf[total..total + 1])?;
        if n == 0 {
            break;
        }
        total += n;
        if buf[total - 1] == b'\n' {
            break;
        }
    }
    Ok(total)
}

/// Guaranteed read: returns short only on EOF.
pub fn fd_read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = fd_read(fd, &mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Write with auto retry on EINTR.
pub fn fd_write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    let file = fd.as_filelike_view::<File>();
    loop {
        match (&*file).write(buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            r => return r,
        }
    }
}

/// Guaranteed write of the whole buffer.
pub fn fd_write_all(fd: BorrowedFd<'_>, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match fd_write(fd, buf) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "failed to write whole buffer")),
            Ok(n) => buf = &buf[n..],
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Guaranteed write bounded by a deadline; each chunk waits for writability.
pub fn fd_write_all_deadline(fd: BorrowedFd<'_>, mut buf: &[u8], deadline: Deadline) -> Result<()> {
    while !buf.is_empty() {
        let revents = wait_ready(fd, PollFlags::POLLOUT, deadline)?;
        if !revents.intersects(PollFlags::POLLOUT) {
            return Err(Error::protocol("peer hung up mid-frame"));
        }
        match fd_write(fd, buf) {
            Ok(0) => {
                return Err(Error::Transport(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole buffer",
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Guaranteed read bounded by a deadline; short reads only at EOF.
pub fn fd_read_exact_deadline(fd: BorrowedFd<'_>, buf: &mut [u8], deadline: Deadline) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let revents = wait_ready(fd, PollFlags::POLLIN, deadline)?;
        if !revents.intersects(PollFlags::POLLIN) {
            // hangup with nothing buffered reads as EOF
            return Ok(total);
        }
        match fd_read(fd, &mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fds;
    use std::os::fd::AsFd;

    #[test]
    fn test_write_read_roundtrip() {
        let (r, w) = fds::make_pipes(1).unwrap();
        fd_write_all(w[0].as_fd(), b"hello").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(fd_read_exact(r[0].as_fd(), &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_readline_stops_at_newline() {
        let (r, w) = fds::make_pipes(1).unwrap();
        fd_write_all(w[0].as_fd(), b"one\ntwo\n").unwrap();
        let mut buf = [0u8; 64];
        let n = fd_readline(r[0].as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"one\n");
        let n = fd_readline(r[0].as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"two\n");
    }

    #[test]
    fn test_poll_deadline_times_out() {
        let (r, _w) = fds::make_pipes(1).unwrap();
        let start = std::time::Instant::now();
        let revents = wait_ready(r[0].as_fd(), PollFlags::POLLIN, Deadline::after_ms(40));
        assert!(matches!(revents, Err(Error::DeadlineExpired)));
        assert!(start.elapsed().as_millis() >= 40);
    }

    #[test]
    fn test_poll_now_returns_immediately() {
        let (r, _w) = fds::make_pipes(1).unwrap();
        let mut fds = [PollFd::new(r[0].as_fd(), PollFlags::POLLIN)];
        assert_eq!(poll_deadline(&mut fds, Deadline::Now).unwrap(), 0);
    }

    #[test]
    fn test_read_deadline_sees_eof_on_closed_writer() {
        let (r, w) = fds::make_pipes(1).unwrap();
        fd_write_all(w[0].as_fd(), b"xy").unwrap();
        drop(w);
        let mut buf = [0u8; 8];
        let n = fd_read_exact_deadline(r[0].as_fd(), &mut buf, Deadline::after_ms(1000)).unwrap();
        assert_eq!(&buf[..n], b"xy");
    }
}
