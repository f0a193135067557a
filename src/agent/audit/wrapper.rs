//! Shell hook that routes command lines through the audit relay.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::shell::shell_name;

const WRAPPER_SCRIPT: &str = include_str!("wrapper.sh");

/// Write the hook script into `dir` (mode 0700) and return its path.
pub fn install(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("fleetctl-audit-{}.sh", std::process::id()));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o700)
        .open(&path)?;
    file.write_all(WRAPPER_SCRIPT.as_bytes())?;
    Ok(path)
}

/// Arguments for launching `shell`. Only bash can load the hook; other
/// shells start as plain login shells.
pub fn shell_args(shell: &str, wrapper: Option<&Path>) -> Vec<String> {
    match wrapper {
        Some(rcfile) if shell_name(shell) == "bash" => vec![
            "--rcfile".to_string(),
            rcfile.to_string_lossy().into_owned(),
            "-i".to_string(),
        ],
        _ => vec!["-l".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn install_writes_private_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = install(dir.path()).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("/check-command"));
        assert!(body.contains("/record-command"));
    }

    #[test]
    fn bash_gets_rcfile() {
        let args = shell_args("/bin/bash", Some(Path::new("/tmp/hook.sh")));
        assert_eq!(args, vec!["--rcfile", "/tmp/hook.sh", "-i"]);
    }

    #[test]
    fn other_shells_and_unaudited_are_login_shells() {
        assert_eq!(shell_args("/bin/zsh", Some(Path::new("/tmp/hook.sh"))), vec!["-l"]);
        assert_eq!(shell_args("/bin/bash", None), vec!["-l"]);
    }
}
