//! Device wake lock for the call duration.
//!
//! Keeps the machine from idling out mid-call by holding a platform
//! inhibitor process (`systemd-inhibit` on Linux, `caffeinate` on macOS)
//! alive for as long as the guard exists. The child is spawned with
//! kill-on-drop, so the lock is released unconditionally on teardown,
//! including abnormal termination.

use crate::error::{CallError, Result};

/// RAII wake-lock guard. Dropping it releases the lock.
pub struct WakeLock {
    child: tokio::process::Child,
    tool: String,
}

impl WakeLock {
    /// Acquire a wake lock via the first available platform inhibitor.
    ///
    /// Returns an error when no inhibitor tool exists on this host; the
    /// caller decides whether the call proceeds without one.
    pub fn acquire() -> Result<Self> {
        for (tool, args) in inhibitor_candidates() {
            let Ok(path) = which::which(tool) else {
                continue;
            };
            let mut command = tokio::process::Command::new(path);
            command
                .args(args)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true);
            match command.spawn() {
                Ok(child) => {
                    tracing::info!(tool, "wake lock acquired");
                    return Ok(Self {
                        child,
                        tool: tool.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(tool, error = %e, "inhibitor failed to start");
                }
            }
        }
        Err(CallError::Device("no wake-lock inhibitor available".into()))
    }

    /// Release the lock explicitly. Dropping the guard does the same.
    pub fn release(mut self) {
        let _ = self.child.start_kill();
        tracing::info!(tool = %self.tool, "wake lock released");
    }
}

impl Drop for WakeLock {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Inhibitor binaries in preference order, with their argument lists.
fn inhibitor_candidates() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        (
            "systemd-inhibit",
            vec![
                "--what=idle:sleep",
                "--who=voxwire",
                "--why=live voice call",
                "sleep",
                "infinity",
            ],
        ),
        ("caffeinate", vec!["-dims"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_cover_linux_and_macos() {
        let candidates = inhibitor_candidates();
        assert!(candidates.iter().any(|(t, _)| *t == "systemd-inhibit"));
        assert!(candidates.iter().any(|(t, _)| *t == "caffeinate"));
    }

    #[tokio::test]
    async fn acquire_either_succeeds_or_reports_device_error() {
        // Hosts without an inhibitor (CI containers) get a Device error,
        // never a panic.
        match WakeLock::acquire() {
            Ok(lock) => lock.release(),
            Err(e) => assert!(matches!(e, CallError::Device(_))),
        }
    }
}
