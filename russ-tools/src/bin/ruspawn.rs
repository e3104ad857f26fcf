// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spawn a russ server from configuration, printing the path of the
//! dynamically created socket file. The listening socket is passed to the
//! server; a reaper process waits on it and removes the socket file.
//!
//! The lifetime of the server is governed by the configuration settings
//! `main:closeonaccept` and `main:accepttimeout`.

use std::io::Write;
use std::os::unix::process::CommandExt;

use anyhow::{Context, Result};
use nix::unistd::{fork, ForkResult};

use russ_ipc::server::ignore_sigpipe;
use russ_tools::spawn;

const USAGE: &str = "usage: ruspawn (-f <path>|-c <sect:opt>=<value>) [...] [-- ...]

Spawn a russ server using the configuration, outputting the path of a
dynamically created socket file. The listener socket is passed to the
server on descriptor 3.";

fn main() {
    ignore_sigpipe();
    russ_tools::init_logging(false);
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return;
    }
    match run(args) {
        Ok(sock_path) => {
            // no trailing newline: callers substitute the path directly
            print!("{sock_path}");
            let _ = std::io::stdout().flush();
        }
        Err(e) => {
            eprintln!("error: cannot spawn server: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(args: Vec<String>) -> Result<String> {
    let plan = spawn::plan(args)?;
    let lis = spawn::announce(&plan)?;
    let sock_path = plan.sock_path.clone();

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => Ok(sock_path.display().to_string()),
        ForkResult::Child => {
            // this process becomes the reaper: start the server as our
            // child, then replace ourselves with rureap so the server's
            // exit removes the socket file
            let child = spawn::server_command(&plan, spawn::listener_fd(lis)).spawn();
            match child {
                Ok(child) => {
                    let err = spawn::rureap_command(child.id() as i32, &sock_path).exec();
                    eprintln!("error: cannot exec reaper: {err}");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("error: cannot start server: {e}");
                    let _ = std::fs::remove_file(&sock_path);
                    std::process::exit(1);
                }
            }
        }
    }
}
