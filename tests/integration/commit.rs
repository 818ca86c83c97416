use rand::Rng;

use fsal::backend::memory::Fault;
use fsal::backend::NfsTime;
use fsal::error::BackendError;
use fsal::NfsStatus;

use crate::helpers::{commit_args, TestExport};

/// Test 1: A commit past the end grows the file to the last written byte.
#[test]
fn test_commit_grows_size() {
    let t = TestExport::new();
    let file = t.file("/f", b"0123");
    let res = file.layoutcommit(&commit_args(Some(99), None)).unwrap();
    assert!(res.commit_done);
    assert!(res.size_supplied);
    assert_eq!(res.new_size, 100);
    assert_eq!(file.getattr().unwrap().size, 100);
    assert_eq!(t.cluster.stats().setattrs, 1);
}

/// Test 2: A commit inside the file never shrinks it.
#[test]
fn test_commit_never_shrinks() {
    let t = TestExport::new();
    let file = t.file("/f", &[7u8; 64]);
    let res = file.layoutcommit(&commit_args(Some(10), None)).unwrap();
    assert!(!res.size_supplied);
    assert_eq!(file.getattr().unwrap().size, 64);

    // last_write + 1 == size is not growth either.
    let res = file.layoutcommit(&commit_args(Some(63), None)).unwrap();
    assert!(!res.size_supplied);
    assert_eq!(t.cluster.data(file.vino().ino).unwrap().len(), 64);
}

/// Test 3: A client time newer than the file's mtime is taken as is.
#[test]
fn test_newer_client_time_is_used() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let ahead = NfsTime::new(NfsTime::now().seconds + 3600, 17);
    file.layoutcommit(&commit_args(None, Some(ahead))).unwrap();
    assert_eq!(file.getattr().unwrap().mtime, ahead);
}

/// Test 4: An older client time moves mtime to now instead.
#[test]
fn test_older_client_time_falls_back_to_now() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let before = NfsTime::now();
    t.cluster.touch(file.vino().ino, NfsTime::new(1_000, 0));
    file.layoutcommit(&commit_args(None, Some(NfsTime::new(10, 0))))
        .unwrap();
    let mtime = file.getattr().unwrap().mtime;
    assert!(mtime >= before, "{:?} < {:?}", mtime, before);
}

/// Test 5: A file whose mtime is in the future keeps it.
#[test]
fn test_future_mtime_is_not_moved_back() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let future = NfsTime::new(NfsTime::now().seconds + 86_400, 0);
    t.cluster.touch(file.vino().ino, future);
    file.layoutcommit(&commit_args(Some(5), None)).unwrap();
    let attrs = file.getattr().unwrap();
    assert_eq!(attrs.mtime, future);
    assert_eq!(attrs.size, 6);
}

/// Test 6: Random commit sequences keep size and mtime monotonic.
#[test]
fn test_random_commits_are_monotonic() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let mut rng = rand::thread_rng();
    let mut last = file.getattr().unwrap();
    let base = NfsTime::now().seconds;

    for _ in 0..300 {
        let last_write = if rng.gen_bool(0.7) {
            Some(rng.gen_range(0..1u64 << 20))
        } else {
            None
        };
        let new_time = if rng.gen_bool(0.7) {
            Some(NfsTime::new(
                base + rng.gen_range(-100..100),
                rng.gen_range(0..1_000_000_000),
            ))
        } else {
            None
        };
        let res = file.layoutcommit(&commit_args(last_write, new_time)).unwrap();
        let now = file.getattr().unwrap();
        assert!(now.size >= last.size);
        assert!(now.mtime >= last.mtime);
        if let Some(lw) = last_write {
            assert!(now.size > lw);
            assert_eq!(res.size_supplied, lw + 1 > last.size);
        }
        last = now;
    }
}

/// Test 7: Backend failures are passed through unchanged.
#[test]
fn test_commit_propagates_backend_errors() {
    let t = TestExport::new();
    let file = t.file("/f", b"abc");

    t.cluster.inject(Fault::Getattr, BackendError::Stale);
    let err = file.layoutcommit(&commit_args(Some(10), None)).unwrap_err();
    assert_eq!(err.status(), NfsStatus::Stale);
    assert_eq!(t.cluster.stats().setattrs, 0);
    t.cluster.clear(Fault::Getattr);

    t.cluster.inject(Fault::Setattr, BackendError::NoSpace);
    let err = file.layoutcommit(&commit_args(Some(10), None)).unwrap_err();
    assert_eq!(err.status(), NfsStatus::Nospc);
    t.cluster.clear(Fault::Setattr);
    assert_eq!(file.getattr().unwrap().size, 3);
}

/// Test 8: Unknown layout types are refused.
#[test]
fn test_commit_checks_layout_type() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let mut args = commit_args(Some(1), None);
    args.layout_type = 2;
    let err = file.layoutcommit(&args).unwrap_err();
    assert_eq!(err.status(), NfsStatus::UnknownLayoutType);
    assert_eq!(file.getattr().unwrap().size, 0);
}

/// Test 9: Concurrent commits on one handle serialize and keep the maximum.
#[test]
fn test_concurrent_commits_keep_largest_size() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    std::thread::scope(|s| {
        for i in 0..8u64 {
            let file = &file;
            s.spawn(move || {
                for j in 0..50u64 {
                    file.layoutcommit(&commit_args(Some(i * 1000 + j), None))
                        .unwrap();
                }
            });
        }
    });
    assert_eq!(file.getattr().unwrap().size, 7 * 1000 + 49 + 1);
}

/// Test 10: A last write beyond what the backend can store is an error,
/// and the file is left as it was.
#[test]
fn test_commit_past_backend_limit_fails() {
    let t = TestExport::new();
    let file = t.file("/f", b"abc");
    for last_write in [u64::MAX - 1, u64::MAX, 1 << 40] {
        let err = file.layoutcommit(&commit_args(Some(last_write), None)).unwrap_err();
        assert_eq!(err.status(), NfsStatus::Nospc);
    }
    assert_eq!(file.getattr().unwrap().size, 3);
    assert_eq!(t.cluster.data(file.vino().ino).unwrap(), b"abc");

    let limit = t.cluster.config().max_file_size;
    let res = file.layoutcommit(&commit_args(Some(limit - 1), None)).unwrap();
    assert_eq!(res.new_size, limit);
}
