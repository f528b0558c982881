//! Calls `execve()` from a thread other than the thread group leader, while a third
//! thread is still running.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread;
use std::time::Duration;

fn main() {
    thread::spawn(|| loop {
        thread::sleep(Duration::from_secs(60));
    });

    let exec = thread::spawn(|| {
        // Only returns on failure.
        let err = Command::new("/bin/true").exec();
        eprintln!("exec failed: {err}");
        std::process::exit(1);
    });

    let _ = exec.join();
}
