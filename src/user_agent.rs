//! User-Agent construction from an explicit system description.
//!
//! The operating system details are captured once into a [`SysInfo`] value by
//! the caller and handed to [`crate::Config`]; nothing here caches global state.

use std::process::Command;

/// Operating system name, release and machine type reported in the User-Agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysInfo {
    /// OS name such as `Linux` or `Darwin`.
    pub name: String,
    /// Kernel release, `-` when unknown.
    pub release: String,
    /// CPU type such as `x86_64`.
    pub machine: String,
}

impl SysInfo {
    /// Describes the compilation target without spawning processes.
    #[must_use]
    pub fn from_target() -> Self {
        Self {
            name: std::env::consts::OS.to_string(),
            release: "-".to_string(),
            machine: std::env::consts::ARCH.to_string(),
        }
    }

    /// Queries `uname` for the running system, falling back to target info.
    ///
    /// Intended to run once at process startup.
    #[must_use]
    pub fn detect() -> Self {
        let fallback = Self::from_target();
        Self {
            name: uname("-s").unwrap_or(fallback.name),
            release: uname("-r").unwrap_or(fallback.release),
            machine: uname("-m").unwrap_or(fallback.machine),
        }
    }
}

fn uname(flag: &str) -> Option<String> {
    let output = Command::new("uname").arg(flag).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Default User-Agent: crate version plus system description.
#[must_use]
pub fn default_user_agent(sys: &SysInfo) -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!(
        "xhttp-client/{version} ({}/{}/{};rust)",
        sys.name, sys.release, sys.machine
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_contains_version_and_sys_info() {
        let sys = SysInfo {
            name: "Linux".to_string(),
            release: "6.1.0".to_string(),
            machine: "x86_64".to_string(),
        };
        let ua = default_user_agent(&sys);
        assert_eq!(
            ua,
            format!(
                "xhttp-client/{} (Linux/6.1.0/x86_64;rust)",
                env!("CARGO_PKG_VERSION")
            )
        );
    }

    #[test]
    fn test_from_target_uses_placeholder_release() {
        let sys = SysInfo::from_target();
        assert_eq!(sys.release, "-");
        assert_eq!(sys.name, std::env::consts::OS);
        assert_eq!(sys.machine, std::env::consts::ARCH);
    }

    #[test]
    fn test_detect_never_returns_empty_fields() {
        let sys = SysInfo::detect();
        assert!(!sys.name.is_empty());
        assert!(!sys.release.is_empty());
        assert!(!sys.machine.is_empty());
    }
}
