//! Per-process resource limits applied to spawned commands
//!
//! This is not a sandbox. On Unix the child gets CPU-time and address-space
//! rlimits and is placed in its own process group so the runner can kill
//! everything it started when a deadline passes.

use serde::{Deserialize, Serialize};
use tokio::process::Command as TokioCommand;
use tracing::debug;

/// Resource limits for a spawned command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum CPU time (seconds)
    pub max_cpu_time_secs: Option<u64>,

    /// Maximum address space (MB)
    pub max_memory_mb: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_time_secs: Some(5),
            max_memory_mb: Some(512),
        }
    }
}

impl ResourceLimits {
    /// No rlimits; the process still gets its own group
    pub fn unlimited() -> Self {
        Self {
            max_cpu_time_secs: None,
            max_memory_mb: None,
        }
    }

    /// Install the limits on a command before it is spawned
    #[cfg(unix)]
    pub fn apply(&self, cmd: &mut TokioCommand) {
        let max_cpu_time = self.max_cpu_time_secs;
        let max_memory = self.max_memory_mb;

        debug!(?max_cpu_time, ?max_memory, "Applying resource limits");

        // SAFETY: the closure runs between fork and exec and only calls
        // async-signal-safe libc functions.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                if let Some(cpu_secs) = max_cpu_time {
                    let rlimit = libc::rlimit {
                        rlim_cur: cpu_secs as libc::rlim_t,
                        rlim_max: cpu_secs as libc::rlim_t,
                    };

                    if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                if let Some(mem_mb) = max_memory {
                    let bytes = (mem_mb * 1024 * 1024) as libc::rlim_t;
                    let rlimit = libc::rlimit {
                        rlim_cur: bytes,
                        rlim_max: bytes,
                    };

                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn apply(&self, _cmd: &mut TokioCommand) {
        debug!("Resource limits are not enforced on this platform");
    }
}

/// Kill the whole process group led by `pid`
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_default() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_cpu_time_secs, Some(5));
        assert_eq!(limits.max_memory_mb, Some(512));
    }

    #[test]
    fn test_limits_unlimited() {
        let limits = ResourceLimits::unlimited();
        assert!(limits.max_cpu_time_secs.is_none());
        assert!(limits.max_memory_mb.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_limits_allow_normal_command() {
        let mut cmd = TokioCommand::new("/bin/sh");
        cmd.args(["-c", "echo limited"]);
        ResourceLimits::default().apply(&mut cmd);

        let output = cmd.output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "limited\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_missing_group_is_ok() {
        // pid far above any default pid_max
        assert!(kill_process_group(i32::MAX as u32).is_ok());
    }
}
