// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server side of a call: read the request, answer with a descriptor set,
//! stream, and signal the exit status exactly once.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;

use io_lifetimes::OwnedFd;

use crate::cconn::ClientConn;
use crate::error::{Error, Result};
use crate::fds::{self, Credentials};
use crate::io;
use crate::request::Request;
use crate::time::Deadline;
use crate::{CONN_STD_NFDS, MAX_REQUEST_BUF_SIZE};

/// Server connection. The in/out/err descriptors here are the server-side
/// ends of the pipes handed to the client; the system descriptor is the
/// write side of the exit channel. The handler owns them until it closes
/// each one or delegates it to a forwarder or relay.
#[derive(Debug)]
pub struct ServerConn {
    sd: UnixStream,
    creds: Credentials,
    pub fds: [Option<OwnedFd>; CONN_STD_NFDS],
    sysfds: [Option<OwnedFd>; 1],
    answered: bool,
    exited: bool,
}

impl ServerConn {
    pub fn from_stream(sd: UnixStream, creds: Credentials) -> ServerConn {
        ServerConn {
            sd,
            creds,
            fds: [None, None, None],
            sysfds: [None],
            answered: false,
            exited: false,
        }
    }

    pub fn creds(&self) -> Credentials {
        self.creds
    }

    pub fn answered(&self) -> bool {
        self.answered
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    /// Read the framed request within the deadline. Must happen before any
    /// descriptor is written to the peer.
    pub fn await_request(&mut self, deadline: Deadline) -> Result<Request> {
        if self.answered {
            return Err(Error::protocol("request read after answer"));
        }
        let mut size_b = [0u8; 4];
        let n = io::fd_read_exact_deadline(self.sd.as_fd(), &mut size_b, deadline)?;
        if n < size_b.len() {
            return Err(Error::protocol("connection closed before request"));
        }
        let size = u32::from_le_bytes(size_b) as usize;
        if size < 4 || size > MAX_REQUEST_BUF_SIZE {
            return Err(Error::protocol("request frame size out of bounds"));
        }
        let mut payload = vec![0u8; size];
        let n = io::fd_read_exact_deadline(self.sd.as_fd(), &mut payload, deadline)?;
        if n < payload.len() {
            return Err(Error::protocol("request frame truncated"));
        }
        Request::decode(&payload)
    }

    /// Answer with the standard descriptor set: three data pipes (stdin end
    /// pair swapped so the client holds the write side) plus the exit
    /// channel. Client copies are closed after the handoff; the opposite
    /// ends stay here for the handler's I/O.
    pub fn standard_answer(&mut self) -> Result<()> {
        if self.answered {
            return Ok(());
        }
        let (mut rfds, mut wfds) = fds::make_pipes(CONN_STD_NFDS)?;
        std::mem::swap(&mut rfds[0], &mut wfds[0]);
        let (exit_r, exit_w) = nix::unistd::pipe()?;

        let client = [&rfds[0], &rfds[1], &rfds[2], &exit_r];
        for fd in client {
            fds::send_fd(&self.sd, fd.as_fd())?;
        }
        drop(exit_r);
        drop(rfds);

        let [in_w, out_w, err_w] = <[OwnedFd; 3]>::try_from(wfds)
            .map_err(|_| Error::protocol("descriptor set size mismatch"))?;
        self.fds = [Some(in_w), Some(out_w), Some(err_w)];
        self.sysfds = [Some(exit_w)];
        self.answered = true;
        Ok(())
    }

    /// Pass a dialed downstream connection's descriptor set through to our
    /// client untouched, so the downstream service and the client talk
    /// directly and the downstream exit status propagates unchanged.
    pub fn splice(&mut self, mut dconn: ClientConn) -> Result<()> {
        if self.answered {
            return Err(Error::protocol("already answered"));
        }
        let mut set: Vec<OwnedFd> = Vec::with_capacity(CONN_STD_NFDS + 1);
        for i in 0..CONN_STD_NFDS {
            set.push(
                dconn
                    .take_fd(i)
                    .ok_or_else(|| Error::protocol("downstream connection missing descriptors"))?,
            );
        }
        set.push(
            dconn
                .take_exit_fd()
                .ok_or_else(|| Error::protocol("downstream connection missing exit descriptor"))?,
        );
        for fd in &set {
            fds::send_fd(&self.sd, fd.as_fd())?;
        }
        // transferred; our copies close here, the exit flows downstream
        self.answered = true;
        self.exited = true;
        Ok(())
    }

    /// Redial a request against the service namespace and splice the new
    /// connection through to our client. Used by pass-through, redirect
    /// and rewrite services: they pick up a dial, dial downstream, and get
    /// out of the way.
    pub fn redial_and_splice(&mut self, deadline: Deadline, req: &Request) -> Result<()> {
        match ClientConn::dialv(deadline, req.op.as_str(), &req.spath, &req.attrv, &req.argv) {
            Ok(dconn) => self.splice(dconn),
            Err(e) => {
                let _ = self.fatal(crate::msgs::MSG_NO_SERVICE, crate::codes::EXIT_CALL_FAILURE);
                Err(e)
            }
        }
    }

    /// Send the exit status and close the exit channel. At most one status
    /// per connection; a second call is a protocol error.
    pub fn exit(&mut self, status: i32) -> Result<()> {
        let fd = self
            .sysfds[0]
            .take()
            .ok_or_else(|| Error::protocol("exit status already sent"))?;
        self.exited = true;
        io::fd_write_all(fd.as_fd(), &status.to_le_bytes())?;
        Ok(())
    }

    /// Write a line to the error descriptor, send the exit code, close.
    pub fn fatal(&mut self, msg: &str, status: i32) -> Result<()> {
        if !self.answered {
            self.standard_answer()?;
        }
        if let Some(err_fd) = &self.fds[2] {
            let mut line = msg.as_bytes().to_vec();
            line.push(b'\n');
            let _ = io::fd_write_all(err_fd.as_fd(), &line);
        }
        self.exit(status)
    }

    /// Transfer ownership of a data descriptor to a forwarder or relay.
    pub fn take_fd(&mut self, i: usize) -> Option<OwnedFd> {
        self.fds[i].take()
    }

    /// Write formatted text to a data descriptor.
    pub fn dprint(&self, i: usize, text: &str) -> Result<()> {
        let fd = self.fds[i]
            .as_ref()
            .ok_or_else(|| Error::protocol("data descriptor already transferred"))?;
        io::fd_write_all(fd.as_fd(), text.as_bytes())?;
        Ok(())
    }
}
