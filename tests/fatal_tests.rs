#![cfg(all(unix, not(feature = "restricted")))]

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use rusty_jitpool::pages::MmapPages;
use rusty_jitpool::{AdmissionController, Effort, ExecutableAllocator, MemoryPool, OwnerTag};

const CHILD_ENV: &str = "RUSTY_JITPOOL_FATAL_CHILD";

#[test]
fn must_succeed_exhaustion_aborts() {
    if std::env::var_os(CHILD_ENV).is_some() {
        let pool = MemoryPool::create(64 * 1024, MmapPages::native(), true).unwrap();
        let allocator = ExecutableAllocator::new(pool, AdmissionController::default());
        let _handle = allocator.allocate(128 * 1024, OwnerTag::new("optimizing"), Effort::MustSucceed);
        // Reaching this point is the failure the parent looks for.
        std::process::exit(0);
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args(["must_succeed_exhaustion_aborts", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("Couldn't spawn child test process.");

    assert!(!output.status.success(), "Child returned from a failed must-succeed allocation.");
    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("executable memory exhausted"), "stderr was: {stderr}");
}
