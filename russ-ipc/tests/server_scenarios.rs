// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

//! End-to-end calls against thread-variant servers on throwaway sockets.

use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;

use russ_ipc::codes::{EXIT_FAILURE, EXIT_SUCCESS};
use russ_ipc::helpers::{dialv_wait, dialv_wait_inouterr};
use russ_ipc::io::{fd_read, fd_write_all};
use russ_ipc::svcnode::Handler;
use russ_ipc::{listener, Buf, ClientConn, Deadline, Op, Server, ServerKind, Session, SvcNode};

fn echo_handler() -> Handler {
    Arc::new(|sess: &mut Session| {
        if sess.req.op == Op::Execute {
            let mut buf = [0u8; 1024];
            loop {
                let Some(in_fd) = sess.sconn.fds[0].as_ref() else { break };
                let n = fd_read(in_fd.as_fd(), &mut buf).unwrap_or(0);
                if n == 0 {
                    break;
                }
                if let Some(out_fd) = sess.sconn.fds[1].as_ref() {
                    fd_write_all(out_fd.as_fd(), &buf[..n])?;
                }
            }
            sess.sconn.exit(EXIT_SUCCESS)?;
        }
        Ok(())
    })
}

/// Launch a thread-variant server on a fresh socket; returns the socket
/// path. The serving thread lives for the rest of the test process.
fn start_server(svr: Server) -> String {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("svc");
    let lis = listener::announce(path.to_str().unwrap(), 0o666, None, None).unwrap();
    thread::spawn(move || {
        let _keep = dir;
        let _ = svr.serve(lis);
    });
    path.to_string_lossy().into_owned()
}

fn start_echo_server() -> String {
    let mut root = SvcNode::new("", None);
    root.set_handler(Some(echo_handler()));
    let mut svr = Server::new(root, ServerKind::Thread);
    svr.set_help(Some("Echoes input back.\n".to_string()));
    start_server(svr)
}

#[test]
fn test_echo_execute_roundtrip() {
    let sock = start_echo_server();
    let mut rbufs = [
        Buf::from_slice(b"hello\n"),
        Buf::new(64),
        Buf::new(64),
    ];
    let status = dialv_wait_inouterr(
        Deadline::after_ms(5000),
        "execute",
        &sock,
        &[],
        &[],
        &mut rbufs,
    )
    .unwrap();
    assert_eq!(status, EXIT_SUCCESS);
    assert_eq!(rbufs[1].as_slice(), b"hello\n");
    assert_eq!(rbufs[2].as_slice(), b"");
}

#[test]
fn test_help_for_any_sub_path() {
    let sock = start_echo_server();
    let spath = format!("{sock}/whatever");
    let mut rbufs = [Buf::new(0), Buf::new(256), Buf::new(0)];
    let status =
        dialv_wait_inouterr(Deadline::after_ms(5000), "help", &spath, &[], &[], &mut rbufs)
            .unwrap();
    assert_eq!(status, EXIT_SUCCESS);
    assert_eq!(rbufs[1].as_slice(), b"Echoes input back.\n");
}

#[test]
fn test_dial_wait_with_capture() {
    let sock = start_echo_server();
    let mut rbufs = [Buf::from_slice(b"abc"), Buf::new(16), Buf::new(0)];
    let status =
        dialv_wait_inouterr(Deadline::after_ms(5000), "execute", &sock, &[], &[], &mut rbufs)
            .unwrap();
    assert_eq!(status, EXIT_SUCCESS);
    assert_eq!(rbufs[1].len(), 3);
    assert_eq!(rbufs[1].as_slice(), b"abc");
}

#[test]
fn test_list_names_children_sorted() {
    let mut root = SvcNode::new("", None);
    root.add("zeta", None).unwrap();
    root.add("alpha", None).unwrap();
    let svr = Server::new(root, ServerKind::Thread);
    let sock = start_server(svr);

    let mut rbufs = [Buf::new(0), Buf::new(256), Buf::new(0)];
    let status =
        dialv_wait_inouterr(Deadline::after_ms(5000), "list", &sock, &[], &[], &mut rbufs)
            .unwrap();
    assert_eq!(status, EXIT_SUCCESS);
    assert_eq!(rbufs[1].as_slice(), b"alpha\nzeta\n");
}

#[test]
fn test_unknown_sub_path_is_no_service() {
    let mut root = SvcNode::new("", None);
    root.add("only", None).unwrap();
    let svr = Server::new(root, ServerKind::Thread);
    let sock = start_server(svr);

    let spath = format!("{sock}/absent");
    let mut rbufs = [Buf::new(0), Buf::new(0), Buf::new(256)];
    let status =
        dialv_wait_inouterr(Deadline::after_ms(5000), "execute", &spath, &[], &[], &mut rbufs)
            .unwrap();
    assert_eq!(status, EXIT_FAILURE);
    assert_eq!(rbufs[2].as_slice(), b"+ no service available\n");
}

#[test]
fn test_pass_through_splices_descriptor_set() {
    // downstream: answers itself and reports a distinctive status
    let mut root = SvcNode::new("", None);
    root.set_virtual(true);
    root.set_handler(Some(Arc::new(|sess: &mut Session| {
        if let Some(out_fd) = sess.sconn.fds[1].as_ref() {
            fd_write_all(out_fd.as_fd(), b"from downstream\n")?;
        }
        sess.sconn.exit(42)
    })));
    let downstream_sock = start_server(Server::new(root, ServerKind::Thread));

    // front: never answers; redials downstream and splices the set through
    let target = downstream_sock.clone();
    let mut front_root = SvcNode::new("", None);
    front_root.set_virtual(true);
    front_root.set_autoanswer(false);
    front_root.set_handler(Some(Arc::new(move |sess: &mut Session| {
        let spath = format!("{}{}", target, sess.req.spath);
        let dconn = ClientConn::dialv(
            Deadline::after_ms(3000),
            sess.req.op.as_str(),
            &spath,
            &sess.req.attrv,
            &sess.req.argv,
        )?;
        sess.sconn.splice(dconn)
    })));
    let front_sock = start_server(Server::new(front_root, ServerKind::Thread));

    let spath = format!("{front_sock}/foo/bar");
    let mut rbufs = [Buf::new(0), Buf::new(64), Buf::new(64)];
    let status =
        dialv_wait_inouterr(Deadline::after_ms(5000), "execute", &spath, &[], &[], &mut rbufs)
            .unwrap();
    // the downstream exit status propagates unchanged
    assert_eq!(status, 42);
    assert_eq!(rbufs[1].as_slice(), b"from downstream\n");
}

#[test]
fn test_set_then_forward_rewrites_request() {
    // downstream: reports the argv and spath it was dialed with
    let mut root = SvcNode::new("", None);
    root.set_virtual(true);
    root.set_handler(Some(Arc::new(|sess: &mut Session| {
        let line = format!("{} {}\n", sess.req.argv.join(","), sess.req.spath);
        if let Some(out_fd) = sess.sconn.fds[1].as_ref() {
            fd_write_all(out_fd.as_fd(), line.as_bytes())?;
        }
        sess.sconn.exit(EXIT_SUCCESS)
    })));
    let downstream_sock = start_server(Server::new(root, ServerKind::Thread));

    // front: wired like the set service, with a wildcard virtual node that
    // strips `index=value` settings up to the `.` marker, applies them to
    // the request, and forwards the remainder downstream
    let target = downstream_sock.clone();
    let mut front_root = SvcNode::new("", None);
    let node = front_root.add("*", None).unwrap();
    node.set_wildcard(true);
    node.set_virtual(true);
    node.set_autoanswer(false);
    node.set_handler(Some(Arc::new(move |sess: &mut Session| {
        let mut req = sess.req.clone();
        let components: Vec<&str> =
            sess.req.spath.trim_start_matches('/').split('/').collect();
        let marker = components.iter().position(|c| *c == ".").unwrap();
        for setting in &components[..marker] {
            let (index, value) = setting.split_once('=').unwrap();
            let index: usize = index.parse().unwrap();
            if index == req.argv.len() {
                req.argv.push(value.to_string());
            } else {
                req.argv[index] = value.to_string();
            }
        }
        req.spath = format!("{}/{}", target, components[marker + 1..].join("/"));
        let dconn = ClientConn::dialv(
            Deadline::after_ms(3000),
            req.op.as_str(),
            &req.spath,
            &req.attrv,
            &req.argv,
        )?;
        sess.sconn.splice(dconn)
    })));
    let front_sock = start_server(Server::new(front_root, ServerKind::Thread));

    let spath = format!("{front_sock}/0=cat/./foo");
    let mut rbufs = [Buf::new(0), Buf::new(64), Buf::new(0)];
    let status =
        dialv_wait_inouterr(Deadline::after_ms(5000), "execute", &spath, &[], &[], &mut rbufs)
            .unwrap();
    assert_eq!(status, EXIT_SUCCESS);
    // downstream saw argv[0] == "cat" and spath == "/foo"
    assert_eq!(rbufs[1].as_slice(), b"cat /foo\n");
}

#[cfg(target_os = "linux")]
fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
#[cfg(target_os = "linux")]
fn test_descriptor_conservation() {
    let sock = start_echo_server();
    // warm up lazily created descriptors (logging, sockets)
    let _ = dialv_wait(Deadline::after_ms(5000), "execute", &sock, &[], &[]).unwrap();
    thread::sleep(std::time::Duration::from_millis(200));

    let before = open_fd_count();
    for _ in 0..3 {
        let mut conn =
            ClientConn::dialv(Deadline::after_ms(5000), "execute", &sock, &[], &[]).unwrap();
        // exactly four descriptors were received
        assert!(conn.fds.iter().all(|fd| fd.is_some()));
        assert!(conn.exit_fd().is_some());
        drop(conn.take_fd(0));
        let status = conn.wait(Deadline::after_ms(5000)).unwrap();
        assert_eq!(status, EXIT_SUCCESS);
        conn.close();
    }
    // the in-process serving threads also hold per-call descriptors; give
    // them a moment to finish closing before the leak check
    thread::sleep(std::time::Duration::from_millis(200));
    assert_eq!(open_fd_count(), before);
}

#[test]
fn test_exit_status_carried_once() {
    let mut root = SvcNode::new("", None);
    root.set_handler(Some(Arc::new(|sess: &mut Session| {
        sess.sconn.exit(17)?;
        // a second status must be refused
        assert!(sess.sconn.exit(17).is_err());
        Ok(())
    })));
    let sock = start_server(Server::new(root, ServerKind::Thread));

    let mut conn = ClientConn::dialv(Deadline::after_ms(5000), "execute", &sock, &[], &[]).unwrap();
    // the residual sub-path for a socket dialed directly is the root
    assert_eq!(conn.request().spath, "/");
    assert_eq!(conn.wait(Deadline::after_ms(5000)).unwrap(), 17);
    // and the client can only consume it once
    assert!(conn.wait(Deadline::after_ms(100)).is_err());
}
