use std::process::Command;
use std::time::{Duration, Instant};

/// Three independent 200 ms targets under `-j 2` take two waves: the
/// elapsed time rules out both unlimited parallelism and serial execution.
#[test]
fn test() {
    let mut path = std::path::PathBuf::from(file!());
    let _ = path.pop();

    let start = Instant::now();
    let output = Command::new(env!("CARGO_BIN_EXE_rmake"))
        .args(["-j", "2", "--no-print-directory", "t1", "t2", "t3"])
        .current_dir(&path)
        .env_remove("MAKEFLAGS")
        .env_remove("MAKELEVEL")
        .output()
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(output.status.code(), Some(0));
    assert!(
        elapsed >= Duration::from_millis(330),
        "three sleeps with two job slots need at least two waves, took {elapsed:?}",
    );
    assert!(
        elapsed <= Duration::from_millis(580),
        "two job slots should overlap the first two sleeps, took {elapsed:?}",
    );
}
