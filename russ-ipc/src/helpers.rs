// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dial-and-wait conveniences: drive a whole call from buffers, capturing
//! output up to each buffer's capacity.

use std::os::fd::AsFd;

use nix::poll::{PollFd, PollFlags};

use crate::buf::Buf;
use crate::cconn::ClientConn;
use crate::codes;
use crate::error::Result;
use crate::io;
use crate::time::Deadline;

/// Dial and wait for the exit status; connection I/O goes to and comes
/// from zero-capacity buffers, mimicking /dev/null.
pub fn dialv_wait(
    deadline: Deadline,
    op: &str,
    spath: &str,
    attrv: &[String],
    argv: &[String],
) -> Result<i32> {
    let mut rbufs = [Buf::new(0), Buf::new(0), Buf::new(0)];
    dialv_wait_inouterr(deadline, op, spath, attrv, argv, &mut rbufs)
}

/// Dial, auto-perform I/O and collect the exit status in one call.
///
/// `rbufs[0]` supplies the service's input and is drained until exhausted,
/// then the input descriptor is closed (half-close). `rbufs[1]`/`rbufs[2]`
/// capture output and error up to their capacity; a capacity of zero reads
/// and discards. Returns once the exit status has arrived and the data
/// descriptors have drained.
pub fn dialv_wait_inouterr(
    deadline: Deadline,
    op: &str,
    spath: &str,
    attrv: &[String],
    argv: &[String],
    rbufs: &mut [Buf; 3],
) -> Result<i32> {
    let mut conn = ClientConn::dialv(deadline, op, spath, attrv, argv)?;
    let mut status: Option<i32> = None;
    let mut scratch = [0u8; 1 << 16];

    // nothing to send: half-close input immediately
    if rbufs[0].pending().is_empty() {
        drop(conn.take_fd(0));
    }

    loop {
        let mut entries: Vec<usize> = Vec::with_capacity(4);
        let mut pollfds: Vec<PollFd> = Vec::with_capacity(4);
        if let Some(fd) = &conn.fds[0] {
            entries.push(0);
            pollfds.push(PollFd::new(fd.as_fd(), PollFlags::POLLOUT));
        }
        for i in [1, 2] {
            if let Some(fd) = &conn.fds[i] {
                entries.push(i);
                pollfds.push(PollFd::new(fd.as_fd(), PollFlags::POLLIN));
            }
        }
        if let Some(fd) = conn.exit_fd() {
            entries.push(3);
            pollfds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        if pollfds.is_empty() {
            break;
        }

        if io::poll_deadline(&mut pollfds, deadline)? == 0 {
            return Err(crate::error::Error::DeadlineExpired);
        }
        let revents: Vec<PollFlags> = pollfds
            .iter()
            .map(|p| p.revents().unwrap_or_else(PollFlags::empty))
            .collect();
        drop(pollfds);

        for (&i, revents) in entries.iter().zip(revents) {
            if revents.is_empty() {
                continue;
            }
            match i {
                0 => {
                    let mut done = !revents.intersects(PollFlags::POLLOUT);
                    if !done {
                        let fd = conn.fds[0].as_ref().map(|f| f.as_fd());
                        if let Some(fd) = fd {
                            match io::fd_write(fd, rbufs[0].pending()) {
                                Ok(n) => {
                                    rbufs[0].consume(n);
                                    done = rbufs[0].pending().is_empty();
                                }
                                Err(_) => done = true,
                            }
                        }
                    }
                    if done {
                        drop(conn.take_fd(0));
                    }
                }
                1 | 2 => {
                    let mut done = !revents.intersects(PollFlags::POLLIN);
                    if !done {
                        let fd = conn.fds[i].as_ref().map(|f| f.as_fd());
                        if let Some(fd) = fd {
                            let space = rbufs[i].space();
                            let want = if rbufs[i].cap() > 0 { space } else { scratch.len() };
                            if want == 0 {
                                done = true;
                            } else {
                                let want = want.min(scratch.len());
                                match io::fd_read(fd, &mut scratch[..want]) {
                                    Ok(0) | Err(_) => done = true,
                                    Ok(n) => {
                                        if rbufs[i].cap() > 0 {
                                            rbufs[i].push(&scratch[..n]);
                                        }
                                    }
                                }
                            }
                        }
                    }
                    if done {
                        drop(conn.take_fd(i));
                    }
                }
                _ => {
                    status = Some(conn.wait(deadline)?);
                }
            }
        }
    }
    Ok(status.unwrap_or(codes::EXIT_SYS_FAILURE))
}

/// Dial with the `execute` operation.
pub fn execv(deadline: Deadline, spath: &str, attrv: &[String], argv: &[String]) -> Result<ClientConn> {
    ClientConn::dialv(deadline, "execute", spath, attrv, argv)
}

/// Dial with the `help` operation.
pub fn help(deadline: Deadline, spath: &str) -> Result<ClientConn> {
    ClientConn::dialv(deadline, "help", spath, &[], &[])
}

/// Dial with the `info` operation.
pub fn info(deadline: Deadline, spath: &str) -> Result<ClientConn> {
    ClientConn::dialv(deadline, "info", spath, &[], &[])
}

/// Dial with the `list` operation.
pub fn list(deadline: Deadline, spath: &str) -> Result<ClientConn> {
    ClientConn::dialv(deadline, "list", spath, &[], &[])
}
