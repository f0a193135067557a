//! Shell discovery for agent terminals.

use std::path::Path;

pub mod pty;

/// Pick the shell for a new terminal.
///
/// An explicit configured shell wins, then `$SHELL`, then the first of
/// bash, zsh, fish and sh found on disk.
pub fn default_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured.filter(|s| !s.is_empty()) {
        return shell.to_string();
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() && Path::new(&shell).exists() {
            return shell;
        }
    }
    fallback_candidates()
        .into_iter()
        .next()
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn fallback_candidates() -> Vec<String> {
    [
        "/bin/bash",
        "/usr/bin/bash",
        "/bin/zsh",
        "/usr/bin/zsh",
        "/usr/bin/fish",
        "/bin/sh",
    ]
    .iter()
    .filter(|p| Path::new(p).exists())
    .map(|p| (*p).to_string())
    .collect()
}

/// Base name of a shell path (`/usr/bin/bash` → `bash`).
pub fn shell_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_shell_wins() {
        assert_eq!(default_shell(Some("/opt/custom/sh")), "/opt/custom/sh");
    }

    #[test]
    fn empty_configured_falls_through() {
        assert!(!default_shell(Some("")).is_empty());
    }

    #[test]
    fn shell_name_strips_dirs() {
        assert_eq!(shell_name("/usr/bin/bash"), "bash");
        assert_eq!(shell_name("zsh"), "zsh");
    }
}
