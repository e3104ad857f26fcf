// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server object and its two scheduling variants: fork-per-request and
//! thread-per-request. The dispatch tree and server settings are built
//! once and read-only while serving; per-call state is owned by the
//! handling process or thread.

use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use io_lifetimes::OwnedFd;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::SFlag;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, setsid, ForkResult, Gid, Uid};
use tracing::{debug, info, warn};

use crate::conf::Conf;
use crate::error::{Error, Result};
use crate::listener::{self, Listener};
use crate::request::{Op, Request};
use crate::sconn::ServerConn;
use crate::svcnode::SvcNode;
use crate::time::Deadline;
use crate::{codes, msgs, REQ_SPATH_MAX};

const DEFAULT_AWAIT_TIMEOUT_MS: u64 = 15000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerKind {
    Fork,
    Thread,
}

/// Per-call context handed to service handlers.
pub struct Session<'a> {
    pub svr: &'a Server,
    pub sconn: ServerConn,
    pub req: Request,
    /// Slash-separated path prefix matched while descending the tree.
    pub matched: String,
}

pub struct Server {
    root: SvcNode,
    kind: ServerKind,
    help: Option<String>,
    accept_timeout_ms: Option<u64>,
    await_timeout_ms: u64,
    auto_switch_user: bool,
    match_client_user: bool,
    close_on_accept: bool,
}

impl Server {
    pub fn new(root: SvcNode, kind: ServerKind) -> Server {
        Server {
            root,
            kind,
            help: None,
            accept_timeout_ms: None,
            await_timeout_ms: DEFAULT_AWAIT_TIMEOUT_MS,
            auto_switch_user: false,
            match_client_user: false,
            close_on_accept: false,
        }
    }

    /// Build a server and its listener from a `#russ` configuration:
    /// `main:path`, `main:mode` (octal), `main:sd` (inherited descriptor),
    /// `main:type`, `main:accepttimeout`, `main:closeonaccept`,
    /// `main:autoswitchuser`, `main:matchclientuser`, `main:help`.
    pub fn init_from_conf(conf: &Conf, root: SvcNode) -> Result<(Server, Listener)> {
        let kind = match conf.get("main", "type") {
            Some("thread") => ServerKind::Thread,
            _ => ServerKind::Fork,
        };
        let mut svr = Server::new(root, kind);
        let accept_timeout = conf.get_int("main", "accepttimeout", -1);
        if accept_timeout >= 0 {
            svr.set_accept_timeout_ms(Some(accept_timeout as u64 * 1000));
        }
        svr.set_close_on_accept(conf.get_int("main", "closeonaccept", 0) != 0);
        svr.set_auto_switch_user(conf.get_int("main", "autoswitchuser", 0) != 0);
        svr.set_match_client_user(conf.get_int("main", "matchclientuser", 0) != 0);
        if let Some(help) = conf.get("main", "help") {
            svr.set_help(Some(help.to_string()));
        }

        let sd = conf.get_int("main", "sd", -1);
        let lis = if sd >= 0 {
            adopt_inherited_listener(sd as RawFd)?
        } else {
            let path = conf
                .get("main", "path")
                .ok_or_else(|| Error::bad_args("missing main:path or main:sd"))?;
            let mode = u32::from_str_radix(conf.get("main", "mode").unwrap_or("0666"), 8)
                .map_err(|_| Error::bad_args("bad main:mode"))?;
            listener::announce(
                path,
                mode,
                Some(Uid::current().as_raw()),
                Some(Gid::current().as_raw()),
            )?
        };
        Ok((svr, lis))
    }

    pub fn root(&self) -> &SvcNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut SvcNode {
        &mut self.root
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub fn set_help(&mut self, help: Option<String>) -> &mut Self {
        self.help = help;
        self
    }

    /// Bound the time spent blocking in accept; reaching it shuts the
    /// server down (transient servers exit when idle).
    pub fn set_accept_timeout_ms(&mut self, ms: Option<u64>) -> &mut Self {
        self.accept_timeout_ms = ms;
        self
    }

    pub fn set_await_timeout_ms(&mut self, ms: u64) -> &mut Self {
        self.await_timeout_ms = ms;
        self
    }

    /// Drop privileges to the peer's uid/gid before invoking the handler.
    pub fn set_auto_switch_user(&mut self, value: bool) -> &mut Self {
        self.auto_switch_user = value;
        self
    }

    /// Refuse calls unless the peer uid matches the server's own.
    pub fn set_match_client_user(&mut self, value: bool) -> &mut Self {
        self.match_client_user = value;
        self
    }

    /// Close the listener after the first accept and exit once that call
    /// is served.
    pub fn set_close_on_accept(&mut self, value: bool) -> &mut Self {
        self.close_on_accept = value;
        self
    }

    fn accept_deadline(&self) -> Deadline {
        match self.accept_timeout_ms {
            None => Deadline::Never,
            Some(ms) => Deadline::after_ms(ms),
        }
    }

    /// Run the server loop on the given listener until shutdown.
    pub fn serve(self, lis: Listener) -> Result<()> {
        let kind = self.kind;
        let svr = Arc::new(self);
        match kind {
            ServerKind::Fork => loop_fork(svr, lis),
            ServerKind::Thread => loop_thread(svr, lis),
        }
    }
}

/// Thread-per-request: accept, then spawn a task owning the connection.
fn loop_thread(svr: Arc<Server>, lis: Listener) -> Result<()> {
    loop {
        match lis.accept(svr.accept_deadline()) {
            Ok(sconn) => {
                if svr.close_on_accept {
                    drop(lis);
                    handle(&svr, sconn);
                    return Ok(());
                }
                let svr = Arc::clone(&svr);
                thread::spawn(move || handle(&svr, sconn));
            }
            Err(Error::DeadlineExpired) => {
                info!("accept deadline reached, shutting down");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "cannot accept connection");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
}

/// Fork-per-request: the child detaches, closes the listener, serves the
/// call in a grandchild and exits; the parent reaps the intermediate
/// child immediately.
fn loop_fork(svr: Arc<Server>, lis: Listener) -> Result<()> {
    let mut lis = Some(lis);
    loop {
        let Some(listener) = lis.as_ref() else {
            return Ok(());
        };
        let sconn = match listener.accept(svr.accept_deadline()) {
            Ok(sconn) => sconn,
            Err(Error::DeadlineExpired) => {
                info!("accept deadline reached, shutting down");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "cannot accept connection");
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                if let Err(e) = setsid() {
                    warn!(error = %e, "setsid failed");
                }
                unsafe {
                    let _ = signal(Signal::SIGHUP, SigHandler::SigIgn);
                }
                drop(lis.take());
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => {
                        handle(&svr, sconn);
                        std::process::exit(0);
                    }
                    _ => std::process::exit(0),
                }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(sconn);
                let _ = waitpid(child, None);
            }
            Err(e) => {
                warn!(error = %e, "fork failed, dropping connection");
                drop(sconn);
            }
        }
        if svr.close_on_accept {
            return Ok(());
        }
    }
}

/// Per-connection service: read the request, dispatch on the tree, run the
/// handler, fall back to the built-in help/list answers, and guarantee a
/// terminating status.
fn handle(svr: &Server, mut sconn: ServerConn) {
    let deadline = Deadline::after_ms(svr.await_timeout_ms);
    let req = match sconn.await_request(deadline) {
        Ok(req) => req,
        Err(e) => {
            debug!(error = %e, "dropping connection before answer");
            return;
        }
    };
    if crate::env::debug().server_loop {
        debug!(op = %req.op, spath = %req.spath, uid = sconn.creds().uid, "request");
    }

    let Some((node, matched)) = svr.root.find(&req.spath, REQ_SPATH_MAX) else {
        if req.op == Op::Help && svr.help.is_some() {
            let _ = answer_help(svr, &mut sconn);
        } else {
            let _ = sconn.fatal(msgs::MSG_NO_SERVICE, codes::EXIT_FAILURE);
        }
        return;
    };

    if svr.match_client_user && sconn.creds().uid != Uid::effective().as_raw() {
        let _ = sconn.fatal(msgs::MSG_BAD_USER, codes::EXIT_FAILURE);
        return;
    }
    if svr.auto_switch_user && switch_user(sconn.creds().uid, sconn.creds().gid).is_err() {
        let _ = sconn.fatal(msgs::MSG_NO_SWITCH_USER, codes::EXIT_FAILURE);
        return;
    }

    if node.autoanswer() && sconn.standard_answer().is_err() {
        return;
    }

    let mut sess = Session { svr, sconn, req, matched };
    if let Some(handler) = node.handler() {
        if let Err(e) = handler(&mut sess) {
            debug!(error = %e, "handler failed");
        }
    }
    let Session { mut sconn, req, .. } = sess;

    if !sconn.exited() {
        match req.op {
            Op::Help if svr.help.is_some() => {
                let _ = answer_help(svr, &mut sconn);
            }
            Op::List => {
                if node.has_children() && !node.is_virtual() {
                    let listing: String =
                        node.child_names().map(|n| format!("{n}\n")).collect();
                    let _ = sconn.standard_answer();
                    let _ = sconn.dprint(1, &listing);
                    let _ = sconn.exit(codes::EXIT_SUCCESS);
                } else {
                    let _ = sconn.fatal(msgs::MSG_NO_LIST, codes::EXIT_FAILURE);
                }
            }
            _ => {}
        }
    }

    // failsafe: the client always observes a terminating status
    if !sconn.exited() {
        let _ = sconn.fatal(msgs::MSG_NO_EXIT, codes::EXIT_SYS_FAILURE);
    }
}

fn answer_help(svr: &Server, sconn: &mut ServerConn) -> Result<()> {
    sconn.standard_answer()?;
    if let Some(help) = svr.help() {
        sconn.dprint(1, help)?;
    }
    sconn.exit(codes::EXIT_SUCCESS)
}

/// Drop privileges to the given uid/gid (with a matching supplemental
/// group list). A no-op when already running as that user.
pub fn switch_user(uid: u32, gid: u32) -> Result<()> {
    if Uid::effective().as_raw() == uid {
        return Ok(());
    }
    let gid = Gid::from_raw(gid);
    nix::unistd::setgroups(&[gid])?;
    nix::unistd::setgid(gid)?;
    nix::unistd::setuid(Uid::from_raw(uid))?;
    Ok(())
}

/// Broken data descriptors must surface as write errors, not signals.
pub fn ignore_sigpipe() {
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

fn adopt_inherited_listener(sd: RawFd) -> Result<Listener> {
    let st = nix::sys::stat::fstat(sd)?;
    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFSOCK {
        return Err(Error::bad_args(format!("inherited descriptor {sd} is not a socket")));
    }
    Ok(Listener::from_inherited(unsafe { OwnedFd::from_raw_fd(sd) }))
}
