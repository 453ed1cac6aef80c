//! Rendezvous paths and session identity.
//!
//! Priority for the socket directory:
//! 1. `TETHER_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/tether` (Linux standard)
//! 3. `~/.tether` (home directory fallback)
//! 4. System temp dir (last resort)
//!
//! Each session owns one socket file `{socket_dir}/{name}.sock` plus a PID
//! file beside it. `TETHER_SESSIONS` carries the colon-separated names of
//! ancestor sessions, so a shell running inside a session can be stopped
//! from attaching to its own ancestor.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Environment marker listing ancestor session names.
pub const SESSION_CHAIN_VAR: &str = "TETHER_SESSIONS";

/// Separator between names in the ancestry chain.
pub const CHAIN_SEPARATOR: char = ':';

/// Longest accepted session name.
pub const NAME_MAX: usize = 15;

/// Get the socket directory with priority fallback.
pub fn socket_dir() -> PathBuf {
    // 1. Explicit override (ignore empty)
    if let Ok(dir) = env::var("TETHER_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    // 2. XDG_RUNTIME_DIR (ignore empty)
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("tether");
        }
    }

    // 3. Home directory fallback
    if let Some(home) = dirs::home_dir() {
        return home.join(".tether");
    }

    // 4. Last resort: temp dir
    env::temp_dir().join("tether")
}

/// Reject anything that could not be a session name: names are ASCII
/// alphanumeric, one to [`NAME_MAX`] characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        bail!("session name must be 1-{NAME_MAX} characters");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        bail!("session name must be alphanumeric, got {name:?}");
    }
    Ok(())
}

/// Rendezvous socket path for a session.
pub fn socket_path(name: &str) -> PathBuf {
    socket_dir().join(format!("{name}.sock"))
}

/// PID file path for a session.
pub fn pid_path(name: &str) -> PathBuf {
    socket_dir().join(format!("{name}.pid"))
}

/// Create `dir` if needed, owner-only (0700).
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;

    Ok(())
}

/// True if `chain` (a [`CHAIN_SEPARATOR`]-joined list) names `name`.
pub fn chain_contains(chain: &str, name: &str) -> bool {
    chain.split(CHAIN_SEPARATOR).any(|ancestor| ancestor == name)
}

/// True if the inherited environment marker already names `name`.
pub fn ancestry_contains(name: &str) -> bool {
    env::var(SESSION_CHAIN_VAR)
        .map(|chain| chain_contains(&chain, name))
        .unwrap_or(false)
}

/// The chain a child of session `name` should see: the inherited chain
/// with `name` appended.
pub fn extend_chain(inherited: Option<&str>, name: &str) -> String {
    match inherited {
        Some(chain) if !chain.is_empty() => format!("{chain}{CHAIN_SEPARATOR}{name}"),
        _ => name.to_string(),
    }
}

/// [`extend_chain`] over the current process environment.
pub fn inherited_chain(name: &str) -> String {
    extend_chain(env::var(SESSION_CHAIN_VAR).ok().as_deref(), name)
}

// Env var manipulation is not thread safe; every test in this crate that
// touches the environment serializes on this lock.
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    // Saves and restores env vars for the duration of a test, holding the
    // lock so no other env test runs concurrently.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let lock = TEST_ENV_LOCK.lock().unwrap();
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect();
            Self { vars, _lock: lock }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => std::env::set_var(name, v),
                    None => std::env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn valid_names_pass() {
        assert!(validate_name("build").is_ok());
        assert!(validate_name("42").is_ok());
        assert!(validate_name("Session9").is_ok());
        assert!(validate_name(&"a".repeat(NAME_MAX)).is_ok());
    }

    #[test]
    fn invalid_names_fail() {
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(NAME_MAX + 1)).is_err());
        assert!(validate_name("my-session").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("-n").is_err());
    }

    #[test]
    fn chain_membership() {
        assert!(chain_contains("one", "one"));
        assert!(chain_contains("one:two:three", "two"));
        assert!(!chain_contains("one:two", "tw"));
        assert!(!chain_contains("one:two", "twofold"));
        assert!(!chain_contains("", "one"));
    }

    #[test]
    fn chain_extension() {
        assert_eq!(extend_chain(None, "root"), "root");
        assert_eq!(extend_chain(Some(""), "root"), "root");
        assert_eq!(extend_chain(Some("root"), "leaf"), "root:leaf");
        assert_eq!(extend_chain(Some("a:b"), "c"), "a:b:c");
    }

    #[test]
    fn socket_dir_explicit_override() {
        let _guard = EnvGuard::new(&["TETHER_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        std::env::set_var("TETHER_SOCKET_DIR", "/custom/socket/path");
        std::env::remove_var("XDG_RUNTIME_DIR");

        assert_eq!(socket_dir(), PathBuf::from("/custom/socket/path"));
        assert_eq!(
            socket_path("build"),
            PathBuf::from("/custom/socket/path/build.sock")
        );
        assert_eq!(
            pid_path("build"),
            PathBuf::from("/custom/socket/path/build.pid")
        );
    }

    #[test]
    fn socket_dir_ignores_empty_override() {
        let _guard = EnvGuard::new(&["TETHER_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        std::env::set_var("TETHER_SOCKET_DIR", "");
        std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");

        assert_eq!(socket_dir(), PathBuf::from("/run/user/1000/tether"));
    }

    #[test]
    fn socket_dir_home_fallback() {
        let _guard = EnvGuard::new(&["TETHER_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        std::env::remove_var("TETHER_SOCKET_DIR");
        std::env::remove_var("XDG_RUNTIME_DIR");

        let dir = socket_dir();
        assert!(dir.to_string_lossy().ends_with("tether") || dir.to_string_lossy().ends_with(".tether"));
    }

    #[test]
    fn ancestry_lookup_reads_environment() {
        let _guard = EnvGuard::new(&[SESSION_CHAIN_VAR]);
        std::env::set_var(SESSION_CHAIN_VAR, "outer:inner");

        assert!(ancestry_contains("outer"));
        assert!(ancestry_contains("inner"));
        assert!(!ancestry_contains("other"));
        assert_eq!(inherited_chain("leaf"), "outer:inner:leaf");

        std::env::remove_var(SESSION_CHAIN_VAR);
        assert!(!ancestry_contains("outer"));
        assert_eq!(inherited_chain("leaf"), "leaf");
    }
}
