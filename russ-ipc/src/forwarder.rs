// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte forwarder: one thread copying bytes between a pair of descriptors
//! with an optional byte budget. Forwarders launched for the same
//! connection are independent data paths; nothing is shared between them.

use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::thread;

use io_lifetimes::OwnedFd;
use nix::poll::PollFlags;

use crate::error::Error;
use crate::io;
use crate::time::Deadline;
use crate::FORWARD_BLOCK_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FwdMode {
    /// Copy read-sized chunks.
    Blocks,
    /// Copy up to and including each newline.
    Lines,
}

/// Which descriptors to close when the forwarder finishes. Descriptors not
/// closed are handed back in the outcome for reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosePolicy {
    Neither,
    In,
    Out,
    Both,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FwdReason {
    Eof,
    Error,
    Timeout,
    Count,
    InHup,
    OutHup,
}

pub struct FwdOutcome {
    pub reason: FwdReason,
    pub in_fd: Option<OwnedFd>,
    pub out_fd: Option<OwnedFd>,
}

/// Builder for one forwarding agent. Defaults: unlimited budget, block
/// mode, standard block size, both descriptors closed on exit, no
/// deadline.
pub struct Forwarder {
    in_fd: OwnedFd,
    out_fd: OwnedFd,
    count: Option<u64>,
    blocksize: usize,
    mode: FwdMode,
    close: ClosePolicy,
    deadline: Deadline,
}

impl Forwarder {
    pub fn new(in_fd: OwnedFd, out_fd: OwnedFd) -> Forwarder {
        Forwarder {
            in_fd,
            out_fd,
            count: None,
            blocksize: FORWARD_BLOCK_SIZE,
            mode: FwdMode::Blocks,
            close: ClosePolicy::Both,
            deadline: Deadline::Never,
        }
    }

    /// Byte budget; the transfer stops after exactly this many bytes.
    pub fn count(mut self, count: u64) -> Forwarder {
        self.count = Some(count);
        self
    }

    pub fn blocksize(mut self, blocksize: usize) -> Forwarder {
        self.blocksize = blocksize.max(1);
        self
    }

    pub fn mode(mut self, mode: FwdMode) -> Forwarder {
        self.mode = mode;
        self
    }

    pub fn close_policy(mut self, close: ClosePolicy) -> Forwarder {
        self.close = close;
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Forwarder {
        self.deadline = deadline;
        self
    }

    /// Run on the current thread until the budget, EOF, error, hangup or
    /// deadline ends the transfer.
    pub fn run(self) -> FwdOutcome {
        let Forwarder { in_fd, out_fd, count, blocksize, mode, close, deadline } = self;
        let mut buf = vec![0u8; blocksize];
        let mut remaining = count;

        let reason = loop {
            if remaining == Some(0) {
                break FwdReason::Count;
            }
            let want = buf
                .len()
                .min(remaining.unwrap_or(u64::MAX).min(usize::MAX as u64) as usize);

            if deadline != Deadline::Never {
                match io::wait_ready(in_fd.as_fd(), PollFlags::POLLIN, deadline) {
                    Err(Error::DeadlineExpired) => break FwdReason::Timeout,
                    Err(_) => break FwdReason::Error,
                    Ok(revents) if !revents.intersects(PollFlags::POLLIN) => break FwdReason::InHup,
                    Ok(_) => {}
                }
            }

            let n = match mode {
                FwdMode::Blocks => io::fd_read(in_fd.as_fd(), &mut buf[..want]),
                FwdMode::Lines => io::fd_readline(in_fd.as_fd(), &mut buf[..want]),
            };
            match n {
                Ok(0) => break FwdReason::Eof,
                Err(_) => break FwdReason::Error,
                Ok(n) => {
                    match io::fd_write_all(out_fd.as_fd(), &buf[..n]) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::BrokenPipe => break FwdReason::OutHup,
                        Err(_) => break FwdReason::Error,
                    }
                    if let Some(r) = &mut remaining {
                        *r -= n as u64;
                    }
                }
            }
        };

        let keep_in = matches!(close, ClosePolicy::Neither | ClosePolicy::Out);
        let keep_out = matches!(close, ClosePolicy::Neither | ClosePolicy::In);
        FwdOutcome {
            reason,
            in_fd: keep_in.then_some(in_fd),
            out_fd: keep_out.then_some(out_fd),
        }
    }

    /// Launch on its own thread.
    pub fn start(self) -> FwdHandle {
        FwdHandle(thread::spawn(move || self.run()))
    }
}

pub struct FwdHandle(thread::JoinHandle<FwdOutcome>);

impl FwdHandle {
    pub fn join(self) -> FwdOutcome {
        match self.0.join() {
            Ok(outcome) => outcome,
            Err(_) => FwdOutcome { reason: FwdReason::Error, in_fd: None, out_fd: None },
        }
    }
}

/// Launch a batch of forwarders together; join each individually.
pub fn run_forwarders(fwds: Vec<Forwarder>) -> Vec<FwdHandle> {
    fwds.into_iter().map(Forwarder::start).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fds::make_pipes;
    use crate::io::{fd_read_exact_deadline, fd_write_all};
    use std::os::fd::AsFd;

    fn pipe() -> (OwnedFd, OwnedFd) {
        let (mut r, mut w) = make_pipes(1).unwrap();
        (r.remove(0), w.remove(0))
    }

    #[test]
    fn test_infinite_budget_copies_until_eof() {
        let (src_r, src_w) = pipe();
        let (dst_r, dst_w) = pipe();
        fd_write_all(src_w.as_fd(), b"the whole payload").unwrap();
        drop(src_w);

        let outcome = Forwarder::new(src_r, dst_w).run();
        assert_eq!(outcome.reason, FwdReason::Eof);

        let mut got = [0u8; 32];
        let n = fd_read_exact_deadline(dst_r.as_fd(), &mut got, Deadline::after_ms(1000)).unwrap();
        assert_eq!(&got[..n], b"the whole payload");
    }

    #[test]
    fn test_budget_transfers_exactly_count_bytes() {
        let (src_r, src_w) = pipe();
        let (dst_r, dst_w) = pipe();
        fd_write_all(src_w.as_fd(), b"0123456789").unwrap();

        let outcome = Forwarder::new(src_r, dst_w).count(4).run();
        assert_eq!(outcome.reason, FwdReason::Count);

        let mut got = [0u8; 16];
        let n = fd_read_exact_deadline(dst_r.as_fd(), &mut got, Deadline::after_ms(1000)).unwrap();
        assert_eq!(&got[..n], b"0123");
    }

    #[test]
    fn test_budget_larger_than_source() {
        let (src_r, src_w) = pipe();
        let (dst_r, dst_w) = pipe();
        fd_write_all(src_w.as_fd(), b"ab").unwrap();
        drop(src_w);

        let outcome = Forwarder::new(src_r, dst_w).count(100).run();
        assert_eq!(outcome.reason, FwdReason::Eof);

        let mut got = [0u8; 16];
        let n = fd_read_exact_deadline(dst_r.as_fd(), &mut got, Deadline::after_ms(1000)).unwrap();
        assert_eq!(&got[..n], b"ab");
    }

    #[test]
    fn test_line_mode_forwards_line_at_a_time() {
        let (src_r, src_w) = pipe();
        let (dst_r, dst_w) = pipe();
        fd_write_all(src_w.as_fd(), b"one\ntwo\n").unwrap();
        drop(src_w);

        let handle = Forwarder::new(src_r, dst_w).mode(FwdMode::Lines).start();
        let mut got = [0u8; 16];
        let n = fd_read_exact_deadline(dst_r.as_fd(), &mut got, Deadline::after_ms(1000)).unwrap();
        assert_eq!(&got[..n], b"one\ntwo\n");
        assert_eq!(handle.join().reason, FwdReason::Eof);
    }

    #[test]
    fn test_deadline_reports_timeout() {
        let (src_r, _src_w) = pipe();
        let (_dst_r, dst_w) = pipe();
        let outcome = Forwarder::new(src_r, dst_w)
            .deadline(Deadline::after_ms(30))
            .run();
        assert_eq!(outcome.reason, FwdReason::Timeout);
    }

    #[test]
    fn test_close_policy_returns_kept_fds() {
        let (src_r, src_w) = pipe();
        let (_dst_r, dst_w) = pipe();
        drop(src_w);
        let outcome = Forwarder::new(src_r, dst_w)
            .close_policy(ClosePolicy::In)
            .run();
        assert!(outcome.in_fd.is_none());
        assert!(outcome.out_fd.is_some());
    }
}
