use std::process::Command;

use crate::{flog_debug, flog_trace, flog_warn, Error, Result};

pub struct Tmux;

impl Tmux {
    /// Capture only the last N lines of a tmux pane.
    /// Older scrollback is never read, which keeps stale prompts out of the
    /// snapshot.
    pub fn capture_pane_tail(target: &str, lines: u16) -> Result<String> {
        flog_trace!("Tmux::capture_pane_tail target={} lines={}", target, lines);
        // -S -N means "start N lines from the end"
        let start = format!("-{}", lines);
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", target, "-p", "-J", "-S", &start])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to capture pane tail '{}': {}",
                target,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let content = String::from_utf8_lossy(&output.stdout).to_string();
        flog_trace!("capture_pane_tail: {} bytes", content.len());
        Ok(content)
    }

    /// Send a sequence of tmux key names (`"2"`, `"Enter"`, `"C-c"`) in one call.
    pub fn send_keys(target: &str, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Err(Error::Validation("No keys to send".to_string()));
        }
        flog_debug!("Tmux::send_keys target={} keys={:?}", target, keys);
        let output = Command::new("tmux")
            .args(["send-keys", "-t", target])
            .args(keys)
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            flog_warn!("Failed to send keys to '{}': {}", target, stderr.trim());
            return Err(Error::Tmux(format!(
                "Failed to send keys to '{}': {}",
                target,
                stderr.trim()
            )));
        }
        Ok(())
    }

    pub fn session_exists(name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", name])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Window indexes of a session, in tmux order.
    pub fn list_windows(session: &str) -> Result<Vec<u32>> {
        let output = Command::new("tmux")
            .args(["list-windows", "-t", session, "-F", "#{window_index}"])
            .output()?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to list windows of '{}': {}",
                session,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect())
    }

    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    pub fn version() -> Result<String> {
        let output = Command::new("tmux").arg("-V").output()?;
        if !output.status.success() {
            return Err(Error::Tmux("Failed to get tmux version".to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Default target for the worker at `index`: window 0 belongs to the
    /// coordinator, workers start at window 1.
    pub fn worker_target(session: &str, index: usize) -> String {
        format!("{}:{}", session, index + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_target_skips_coordinator_window() {
        assert_eq!(Tmux::worker_target("foreman-demo", 0), "foreman-demo:1");
        assert_eq!(Tmux::worker_target("foreman-demo", 4), "foreman-demo:5");
    }

    #[test]
    fn test_send_keys_rejects_empty() {
        assert!(matches!(
            Tmux::send_keys("nowhere:1", &[]).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn test_session_exists_for_missing_session() {
        // Holds whether or not tmux is installed
        assert!(!Tmux::session_exists("foreman_no_such_session_98765"));
    }
}
