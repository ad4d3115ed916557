//! The server keeps accepting after running out of file descriptors
//!
//! Lowers this process's descriptor limit, so it lives in its own test
//! binary.

#![cfg(unix)]

mod common;

use common::*;
use std::fs::File;

const FD_LIMIT: libc::rlim_t = 256;

fn lower_fd_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit), 0);
    }
    limit.rlim_cur = FD_LIMIT.min(limit.rlim_max);
    unsafe {
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &limit), 0);
    }
}

/// Open descriptors until the process limit is reached
fn exhaust_descriptors() -> Vec<File> {
    let mut files = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(file) => files.push(file),
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => return files,
            Err(e) => panic!("unexpected open error: {}", e),
        }
    }
}

#[test]
fn test_accept_survives_descriptor_exhaustion() {
    lower_fd_limit();
    let server = TestServer::start(TestConfigBuilder::new().build());

    let mut files = exhaust_descriptors();
    assert!(!files.is_empty());

    // The client takes the last free descriptor, leaving none for accept
    files.pop();
    let mut stalled = connect(server.addr);
    assert!(matches!(
        File::open("/dev/null"),
        Err(e) if e.raw_os_error() == Some(libc::EMFILE)
    ));
    settle();

    drop(files);

    // A new connection wakes the listener; both are served
    let mut fresh = connect(server.addr);
    assert_eq!(greet(&mut fresh, &[0]), 0);
    assert_eq!(greet(&mut stalled, &[0]), 0);
}
