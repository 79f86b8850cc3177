//! Process liveness, used to verify executor children are gone.

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)`. A zombie still counts as alive until its
/// parent reaps it.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Send SIGKILL to every process in the group led by `pgid`.
///
/// An already empty group is not an error.
pub fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    if unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        // u32::MAX would become -1, which signals every process.
        assert!(!is_process_alive(999999999));
    }

    #[test]
    fn test_reaped_child_is_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_kill_process_group_takes_the_whole_group() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .process_group(0)
            .spawn()
            .unwrap();
        kill_process_group(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_kill_empty_group_is_ok() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        kill_process_group(pid).unwrap();
    }
}
