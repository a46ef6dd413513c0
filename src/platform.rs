//! Platform abstraction for OS-specific process launching
//!
//! Shell semantics and service managers differ structurally between the Unix
//! and Windows families, so each family gets its own [`LaunchStrategy`]
//! that turns a request into a concrete program plus argument vector. The
//! strategy is picked once at startup; call sites never branch on the OS.

use crate::policy::ValidatedCommand;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    MacOS,
    Windows,
    Unknown,
}

impl Platform {
    /// Get current platform
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Unknown
        }
    }

    /// Check if platform is Unix-like
    pub fn is_unix(&self) -> bool {
        matches!(self, Platform::Linux | Platform::MacOS)
    }

    /// Check if platform is Windows
    pub fn is_windows(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    /// Get platform name as string
    pub fn name(&self) -> &str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOS => "macos",
            Platform::Windows => "windows",
            Platform::Unknown => "unknown",
        }
    }

    /// Launch strategy for this platform family.
    ///
    /// Unknown platforms are treated as Unix-like.
    pub fn launcher(&self) -> Arc<dyn LaunchStrategy> {
        match self {
            Platform::Windows => Arc::new(WindowsLauncher),
            Platform::Linux | Platform::MacOS | Platform::Unknown => Arc::new(UnixLauncher),
        }
    }
}

/// A program and its argument vector, ready to spawn without a shell of our own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How commands and service operations are launched on one OS family
pub trait LaunchStrategy: Send + Sync {
    /// Family name, for logs
    fn name(&self) -> &'static str;

    /// Invocation for an ad-hoc command that already passed policy validation
    fn command(&self, command: &ValidatedCommand) -> Invocation;

    /// Ordered invocations that together restart a service
    fn restart_service(&self, service: &str) -> Vec<Invocation>;

    /// Invocation that prints the newest `lines` log lines of a service
    fn service_logs(&self, service: &str, lines: u32) -> Invocation;
}

/// `/bin/sh`, systemd and journald
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixLauncher;

impl LaunchStrategy for UnixLauncher {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn command(&self, command: &ValidatedCommand) -> Invocation {
        Invocation::new("/bin/sh", ["-c", command.as_str()])
    }

    fn restart_service(&self, service: &str) -> Vec<Invocation> {
        vec![Invocation::new("systemctl", ["restart", service])]
    }

    fn service_logs(&self, service: &str, lines: u32) -> Invocation {
        Invocation::new(
            "journalctl",
            [
                "-u".to_string(),
                service.to_string(),
                "-n".to_string(),
                lines.to_string(),
                "--no-pager".to_string(),
            ],
        )
    }
}

/// `cmd.exe`, the service control manager and the Application event log
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsLauncher;

/// Absolute path used for `ping` so it bypasses `cmd.exe` entirely
pub const WINDOWS_PING: &str = r"C:\Windows\System32\ping.exe";

impl LaunchStrategy for WindowsLauncher {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn command(&self, command: &ValidatedCommand) -> Invocation {
        if command.verb() == "ping" {
            return Invocation::new(WINDOWS_PING, command.args().iter().cloned());
        }
        Invocation::new("cmd.exe", ["/C", command.as_str()])
    }

    fn restart_service(&self, service: &str) -> Vec<Invocation> {
        vec![
            Invocation::new("net", ["stop", service]),
            Invocation::new("net", ["start", service]),
        ]
    }

    fn service_logs(&self, service: &str, lines: u32) -> Invocation {
        Invocation::new(
            "powershell",
            [
                "-NoProfile".to_string(),
                "-Command".to_string(),
                format!(
                    "Get-EventLog -LogName Application -Source {} -Newest {}",
                    powershell_quote(service),
                    lines
                ),
            ],
        )
    }
}

/// Single-quoted PowerShell literal; nothing inside is expanded or split
fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{validate_command, Allowlist};

    fn validated(raw: &str) -> ValidatedCommand {
        validate_command(raw, &Allowlist::default()).unwrap()
    }

    #[test]
    fn test_platform_detection() {
        let platform = Platform::current();
        assert_ne!(platform, Platform::Unknown);

        if cfg!(unix) {
            assert!(platform.is_unix());
            assert_eq!(platform.launcher().name(), "unix");
        }

        if cfg!(windows) {
            assert!(platform.is_windows());
            assert_eq!(platform.launcher().name(), "windows");
        }
    }

    #[test]
    fn test_unix_command_uses_sh() {
        let invocation = UnixLauncher.command(&validated("echo hello world"));
        assert_eq!(invocation.program, "/bin/sh");
        assert_eq!(invocation.args, vec!["-c", "echo hello world"]);
    }

    #[test]
    fn test_windows_command_uses_cmd() {
        let invocation = WindowsLauncher.command(&validated("dir C:"));
        assert_eq!(invocation.program, "cmd.exe");
        assert_eq!(invocation.args, vec!["/C", "dir C:"]);
    }

    #[test]
    fn test_windows_ping_is_direct() {
        let invocation = WindowsLauncher.command(&validated("ping -n 1 localhost"));
        assert_eq!(invocation.program, WINDOWS_PING);
        assert_eq!(invocation.args, vec!["-n", "1", "localhost"]);
    }

    #[test]
    fn test_unix_service_invocations() {
        let restart = UnixLauncher.restart_service("nginx");
        assert_eq!(restart, vec![Invocation::new("systemctl", ["restart", "nginx"])]);

        let logs = UnixLauncher.service_logs("nginx", 50);
        assert_eq!(logs.program, "journalctl");
        assert_eq!(logs.args, vec!["-u", "nginx", "-n", "50", "--no-pager"]);
    }

    #[test]
    fn test_windows_restart_is_paired_stop_start() {
        let restart = WindowsLauncher.restart_service("Spooler");
        assert_eq!(restart.len(), 2);
        assert_eq!(restart[0].args, vec!["stop", "Spooler"]);
        assert_eq!(restart[1].args, vec!["start", "Spooler"]);

        let logs = WindowsLauncher.service_logs("Spooler", 100);
        assert_eq!(logs.program, "powershell");
        assert!(logs.args[2].ends_with("-Source 'Spooler' -Newest 100"));
    }

    #[test]
    fn test_windows_log_source_is_one_literal() {
        let logs = WindowsLauncher.service_logs("Spool\nStop-Computer", 10);
        assert_eq!(
            logs.args[2],
            "Get-EventLog -LogName Application -Source 'Spool\nStop-Computer' -Newest 10"
        );

        let logs = WindowsLauncher.service_logs("it's", 10);
        assert!(logs.args[2].contains("-Source 'it''s' -Newest"));

        let logs = WindowsLauncher.service_logs("x' ; Stop-Computer ; '", 10);
        assert!(logs.args[2].contains("-Source 'x'' ; Stop-Computer ; ''' -Newest"));
    }

    #[test]
    fn test_invocation_display() {
        let invocation = Invocation::new("systemctl", ["restart", "nginx"]);
        assert_eq!(invocation.to_string(), "systemctl restart nginx");
    }
}
