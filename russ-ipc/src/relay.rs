// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-task alternative to a set of forwarders: one poll drives up to K
//! streams plus an exit observer. Read sides are watched while a stream's
//! buffer is empty, write sides while it holds pending bytes; exit-fd
//! readability ends the relay with the reported status.

use std::os::fd::AsFd;

use io_lifetimes::OwnedFd;
use nix::poll::{PollFd, PollFlags};
use tracing::debug;

use crate::buf::Buf;
use crate::codes;
use crate::error::{Error, Result};
use crate::io;
use crate::time::Deadline;
use crate::RELAY_BUF_SIZE;

struct RelayFd {
    fd: OwnedFd,
    refs: u32,
}

struct Stream {
    rfd: usize,
    wfd: usize,
    rbuf: Buf,
    auto_close: bool,
    active: bool,
}

/// A bounded collection of relay streams. Descriptors are owned by the
/// relay; a bidirectional pair registers each descriptor once and
/// reference-counts it so it closes exactly once.
pub struct Relay {
    capacity: usize,
    fds: Vec<Option<RelayFd>>,
    streams: Vec<Stream>,
}

#[derive(Clone, Copy)]
enum PollEntry {
    Read(usize),
    Write(usize),
    Exit,
}

impl Relay {
    pub fn new(capacity: usize) -> Relay {
        Relay { capacity, fds: Vec::new(), streams: Vec::new() }
    }

    fn register(&mut self, fd: OwnedFd) -> usize {
        self.fds.push(Some(RelayFd { fd, refs: 1 }));
        self.fds.len() - 1
    }

    fn unref(&mut self, i: usize) {
        if let Some(slot) = &mut self.fds[i] {
            slot.refs -= 1;
            if slot.refs == 0 {
                self.fds[i] = None;
            }
        }
    }

    /// Add a one-directional stream copying `rfd` to `wfd`.
    pub fn add(&mut self, rfd: OwnedFd, wfd: OwnedFd, auto_close: bool) -> Result<()> {
        if self.streams.len() >= self.capacity {
            return Err(Error::bad_args("relay stream capacity exhausted"));
        }
        let rfd = self.register(rfd);
        let wfd = self.register(wfd);
        self.streams.push(Stream {
            rfd,
            wfd,
            rbuf: Buf::new(RELAY_BUF_SIZE),
            auto_close,
            active: true,
        });
        Ok(())
    }

    /// Add a bidirectional pair between two duplex descriptors: one stream
    /// per direction, both mapping onto the same descriptor numbers.
    pub fn add_pair(&mut self, a: OwnedFd, b: OwnedFd, auto_close: bool) -> Result<()> {
        if self.streams.len() + 2 > self.capacity {
            return Err(Error::bad_args("relay stream capacity exhausted"));
        }
        let a = self.register(a);
        let b = self.register(b);
        for i in [a, b] {
            if let Some(slot) = self.fds[i].as_mut() {
                slot.refs += 1;
            }
        }
        for (rfd, wfd) in [(a, b), (b, a)] {
            self.streams.push(Stream {
                rfd,
                wfd,
                rbuf: Buf::new(RELAY_BUF_SIZE),
                auto_close,
                active: true,
            });
        }
        Ok(())
    }

    fn retire(&mut self, i: usize) {
        if !self.streams[i].active {
            return;
        }
        self.streams[i].active = false;
        if self.streams[i].auto_close {
            let (rfd, wfd) = (self.streams[i].rfd, self.streams[i].wfd);
            self.unref(rfd);
            self.unref(wfd);
        }
    }

    fn fd_at(&self, i: usize) -> Option<&OwnedFd> {
        self.fds[i].as_ref().map(|slot| &slot.fd)
    }

    /// Drive all streams until the exit descriptor becomes readable, then
    /// flush what is pending and return the reported status. An exit
    /// descriptor closed without a status reads as sys-failure.
    pub fn serve(mut self, deadline: Deadline, exit_fd: OwnedFd) -> Result<i32> {
        loop {
            let mut entries: Vec<PollEntry> = Vec::with_capacity(self.streams.len() + 1);
            let mut pollfds: Vec<PollFd> = Vec::with_capacity(self.streams.len() + 1);
            for (i, stream) in self.streams.iter().enumerate() {
                if !stream.active {
                    continue;
                }
                if stream.rbuf.is_empty() {
                    if let Some(fd) = self.fd_at(stream.rfd) {
                        entries.push(PollEntry::Read(i));
                        pollfds.push(PollFd::new(fd.as_fd(), PollFlags::POLLIN));
                    }
                } else if let Some(fd) = self.fd_at(stream.wfd) {
                    entries.push(PollEntry::Write(i));
                    pollfds.push(PollFd::new(fd.as_fd(), PollFlags::POLLOUT));
                }
            }
            entries.push(PollEntry::Exit);
            pollfds.push(PollFd::new(exit_fd.as_fd(), PollFlags::POLLIN));

            if io::poll_deadline(&mut pollfds, deadline)? == 0 {
                return Err(Error::DeadlineExpired);
            }
            let revents: Vec<PollFlags> = pollfds
                .iter()
                .map(|p| p.revents().unwrap_or_else(PollFlags::empty))
                .collect();
            drop(pollfds);

            for (entry, revents) in entries.iter().zip(revents) {
                if revents.is_empty() {
                    continue;
                }
                match *entry {
                    PollEntry::Read(i) => {
                        if revents.intersects(PollFlags::POLLIN) {
                            self.fill(i);
                        } else if revents.intersects(io::poll_hen()) {
                            self.retire(i);
                        }
                    }
                    PollEntry::Write(i) => {
                        if revents.intersects(PollFlags::POLLOUT) {
                            self.drain(i);
                        } else if revents.intersects(io::poll_hen()) {
                            self.retire(i);
                        }
                    }
                    PollEntry::Exit => {
                        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                            let status = read_exit(&exit_fd);
                            self.flush_pending();
                            debug!(status, "relay finished");
                            return Ok(status);
                        }
                    }
                }
            }
        }
    }

    /// A ready read fills the stream's buffer.
    fn fill(&mut self, i: usize) {
        let mut chunk = [0u8; RELAY_BUF_SIZE];
        let space = self.streams[i].rbuf.space().min(chunk.len());
        let Some(fd) = self.fd_at(self.streams[i].rfd) else {
            self.retire(i);
            return;
        };
        match io::fd_read(fd.as_fd(), &mut chunk[..space]) {
            Ok(0) | Err(_) => self.retire(i),
            Ok(n) => {
                self.streams[i].rbuf.push(&chunk[..n]);
            }
        }
    }

    /// A ready write drains the stream's buffer.
    fn drain(&mut self, i: usize) {
        let Some(fd) = self.fd_at(self.streams[i].wfd) else {
            self.retire(i);
            return;
        };
        match io::fd_write(fd.as_fd(), self.streams[i].rbuf.pending()) {
            Ok(0) | Err(_) => self.retire(i),
            Ok(n) => self.streams[i].rbuf.consume(n),
        }
    }

    /// Best-effort flush of buffered output after the exit status arrived.
    fn flush_pending(&mut self) {
        for i in 0..self.streams.len() {
            if !self.streams[i].active || self.streams[i].rbuf.is_empty() {
                continue;
            }
            self.drain(i);
            self.retire(i);
        }
    }
}

fn read_exit(exit_fd: &OwnedFd) -> i32 {
    let mut b = [0u8; 4];
    match io::fd_read_exact(exit_fd.as_fd(), &mut b) {
        Ok(n) if n == b.len() => i32::from_le_bytes(b),
        _ => codes::EXIT_SYS_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fds::make_pipes;
    use crate::io::{fd_read_exact_deadline, fd_write_all};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let (mut r, mut w) = make_pipes(1).unwrap();
        (r.remove(0), w.remove(0))
    }

    #[test]
    fn test_relay_bridges_and_reports_exit() {
        let (src_r, src_w) = pipe();
        let (dst_r, dst_w) = pipe();
        let (exit_r, exit_w) = pipe();

        let mut relay = Relay::new(4);
        relay.add(src_r, dst_w, true).unwrap();

        let feeder = std::thread::spawn(move || {
            fd_write_all(src_w.as_fd(), b"across the relay").unwrap();
            drop(src_w);
            std::thread::sleep(std::time::Duration::from_millis(50));
            fd_write_all(exit_w.as_fd(), &7i32.to_le_bytes()).unwrap();
        });

        let status = relay.serve(Deadline::after_ms(5000), exit_r).unwrap();
        assert_eq!(status, 7);
        feeder.join().unwrap();

        let mut got = [0u8; 32];
        let n = fd_read_exact_deadline(dst_r.as_fd(), &mut got, Deadline::after_ms(1000)).unwrap();
        assert_eq!(&got[..n], b"across the relay");
    }

    #[test]
    fn test_bidirectional_pair_bridges_both_ways() {
        let (a0, a1) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap();
        let (b0, b1) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap();
        let (exit_r, exit_w) = pipe();

        let mut relay = Relay::new(4);
        relay.add_pair(a1, b0, true).unwrap();

        let driver = std::thread::spawn(move || {
            fd_write_all(a0.as_fd(), b"ping").unwrap();
            let mut got = [0u8; 4];
            fd_read_exact_deadline(b1.as_fd(), &mut got, Deadline::after_ms(2000)).unwrap();
            assert_eq!(&got, b"ping");

            fd_write_all(b1.as_fd(), b"pong").unwrap();
            fd_read_exact_deadline(a0.as_fd(), &mut got, Deadline::after_ms(2000)).unwrap();
            assert_eq!(&got, b"pong");

            fd_write_all(exit_w.as_fd(), &0i32.to_le_bytes()).unwrap();
        });

        let status = relay.serve(Deadline::after_ms(5000), exit_r).unwrap();
        assert_eq!(status, 0);
        driver.join().unwrap();
    }

    #[test]
    fn test_exit_closed_without_status_is_sys_failure() {
        let (exit_r, exit_w) = pipe();
        drop(exit_w);
        let relay = Relay::new(2);
        let status = relay.serve(Deadline::after_ms(1000), exit_r).unwrap();
        assert_eq!(status, codes::EXIT_SYS_FAILURE);
    }

    #[test]
    fn test_relay_deadline() {
        let (exit_r, _exit_w) = pipe();
        let relay = Relay::new(2);
        let err = relay.serve(Deadline::after_ms(30), exit_r).unwrap_err();
        assert!(matches!(err, Error::DeadlineExpired));
    }

    #[test]
    fn test_capacity_bound() {
        let (a_r, _aw) = pipe();
        let (_br, b_w) = pipe();
        let mut relay = Relay::new(0);
        relay.add(a_r, b_w, true).unwrap_err();
    }
}
