// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service-path resolution: rewrite the `+`//`+` service-root prefix and
//! walk ancestors until one resolves to a listening socket. The portion
//! above the socket is the residual sub-path delivered in the request.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Symlink hops tolerated before the walk is declared cyclic.
const RESOLVE_MAX_HOPS: usize = 64;

/// Current service root: `RUSS_SERVICES_DIR` or the built-in default.
pub fn services_dir() -> String {
    std::env::var("RUSS_SERVICES_DIR").unwrap_or_else(|_| crate::SERVICES_DIR.to_string())
}

/// Rewrite a leading `+` or `/+` to the service root.
pub fn resolve_spath(spath: &str) -> String {
    let rest = if let Some(rest) = spath.strip_prefix("/+") {
        rest
    } else if let Some(rest) = spath.strip_prefix('+') {
        rest
    } else {
        return spath.to_string();
    };
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        services_dir()
    } else {
        format!("{}/{}", services_dir(), rest)
    }
}

/// A resolved dial target: the socket file to connect to and the residual
/// sub-path to carry in the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub saddr: PathBuf,
    pub spath: String,
}

/// Resolve a logical service path into `(socket path, residual sub-path)`.
/// Symlinks are dereferenced at any level; nonexistent trailing components
/// accumulate into the residual. An empty residual is delivered as `/`.
pub fn find_service_target(spath: &str) -> Result<Target> {
    let full = resolve_spath(spath);
    if !full.starts_with('/') {
        return Err(Error::Resolution(format!("not an absolute service path: {full}")));
    }

    let mut saddr = PathBuf::from(&full);
    let mut residual: Vec<OsString> = Vec::new();
    for _ in 0..RESOLVE_MAX_HOPS {
        match fs::symlink_metadata(&saddr) {
            Ok(md) if md.file_type().is_symlink() => {
                let link = fs::read_link(&saddr)?;
                saddr = if link.is_absolute() {
                    link
                } else {
                    saddr.parent().map(|p| p.join(&link)).unwrap_or(link)
                };
            }
            Ok(md) if md.file_type().is_socket() => {
                let mut sub = String::new();
                for comp in &residual {
                    let comp = comp
                        .to_str()
                        .ok_or_else(|| Error::Resolution(format!("non-utf8 component in {full}")))?;
                    sub.push('/');
                    sub.push_str(comp);
                }
                if sub.is_empty() {
                    sub.push('/');
                }
                return Ok(Target { saddr, spath: sub });
            }
            Ok(_) => {
                // an existing non-socket ancestor means no service here
                return Err(Error::Resolution(format!("no socket under {full}")));
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                match saddr.file_name() {
                    Some(name) => {
                        residual.insert(0, name.to_os_string());
                        if !saddr.pop() || saddr.as_os_str().is_empty() {
                            return Err(Error::Resolution(format!("no socket under {full}")));
                        }
                    }
                    None => return Err(Error::Resolution(format!("no socket under {full}"))),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Resolution(format!("too many symlink hops under {full}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_plain_paths_pass_through() {
        assert_eq!(resolve_spath("/a/b"), "/a/b");
    }

    #[test]
    fn test_service_root_rewrite() {
        // one test mutates the process environment; keep all prefix cases
        // here so no parallel test observes the change midway
        std::env::set_var("RUSS_SERVICES_DIR", "/tmp/russ-test-root");
        assert_eq!(resolve_spath("+/x/y"), "/tmp/russ-test-root/x/y");
        assert_eq!(resolve_spath("/+x/y"), "/tmp/russ-test-root/x/y");
        assert_eq!(resolve_spath("+"), "/tmp/russ-test-root");
        assert_eq!(resolve_spath("/+"), "/tmp/russ-test-root");
        std::env::remove_var("RUSS_SERVICES_DIR");
        assert_eq!(resolve_spath("+/z"), format!("{}/z", crate::SERVICES_DIR));
    }

    #[test]
    fn test_target_splits_at_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("svc");
        let _lis = UnixListener::bind(&sock).unwrap();

        let full = format!("{}/foo/bar", sock.display());
        let targ = find_service_target(&full).unwrap();
        assert_eq!(targ.saddr, sock);
        assert_eq!(targ.spath, "/foo/bar");
    }

    #[test]
    fn test_exact_socket_yields_root_spath() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("svc");
        let _lis = UnixListener::bind(&sock).unwrap();

        let targ = find_service_target(sock.to_str().unwrap()).unwrap();
        assert_eq!(targ.spath, "/");
    }

    #[test]
    fn test_symlinks_are_dereferenced() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("svc");
        let _lis = UnixListener::bind(&sock).unwrap();
        let link = dir.path().join("alias");
        std::os::unix::fs::symlink(&sock, &link).unwrap();

        let full = format!("{}/sub", link.display());
        let targ = find_service_target(&full).unwrap();
        assert_eq!(targ.saddr, sock);
        assert_eq!(targ.spath, "/sub");
    }

    #[test]
    fn test_unresolvable_path_is_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        let miss = dir.path().join("nothing/here");
        let err = find_service_target(miss.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn test_symlink_cycle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::os::unix::fs::symlink(&a, &b).unwrap();
        std::os::unix::fs::symlink(&b, &a).unwrap();
        let err = find_service_target(a.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }
}
