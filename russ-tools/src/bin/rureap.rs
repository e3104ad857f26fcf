// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reaper for spawned servers: wait on the server pid, then remove its
//! socket file. Termination signals forward one SIGTERM to the process
//! group first.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

const USAGE: &str = "usage: rureap <pid> <path>

Wait on the child process at <pid>. When it exits, reap it and clean up
the socket file at <path>.";

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn reap_sigh(_signum: libc::c_int) {
    if !SIGNALLED.swap(true, Ordering::SeqCst) {
        unsafe {
            libc::kill(-libc::getpgrp(), libc::SIGTERM);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return;
    }
    let (pid, path) = match (args.first().map(|a| a.parse::<i32>()), args.get(1)) {
        (Some(Ok(pid)), Some(path)) if args.len() == 2 => (pid, path.clone()),
        _ => {
            eprintln!("error: bad/missing arguments");
            std::process::exit(1);
        }
    };

    // detach from inherited descriptors; keep 0-2 occupied by /dev/null
    unsafe {
        for fd in 0..1024 {
            libc::close(fd);
        }
        libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY);
        libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);

        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
            let _ = signal(sig, SigHandler::Handler(reap_sigh));
        }
    }

    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
    let _ = std::fs::remove_file(&path);
}
