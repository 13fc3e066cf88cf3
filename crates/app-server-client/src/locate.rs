use std::collections::HashSet;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Directories where agent CLIs commonly get installed but which are often
/// missing from the `PATH` of a desktop-launched process.
///
/// `home_var` names a backend home override (`CODEX_HOME`, `CLAUDE_HOME`, ...);
/// when set, its `bin` directory is searched first.
pub fn common_bin_dirs(home_var: Option<&str>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |path: PathBuf| {
        if seen.insert(path.clone()) {
            dirs.push(path);
        }
    };

    if let Some(var) = home_var
        && let Ok(home_override) = env::var(var)
    {
        let trimmed = home_override.trim();
        if !trimmed.is_empty() {
            let root = PathBuf::from(trimmed);
            push(root.join("bin"));
            push(root);
        }
    }

    if let Some(home) = dirs::home_dir() {
        push(home.join(".codex/bin"));
        push(home.join(".claude/local"));
        push(home.join(".npm-global/bin"));
        push(home.join(".local/bin"));
        push(home.join(".local/share/mise/shims"));
        push(home.join(".cargo/bin"));
        push(home.join(".bun/bin"));
        push(home.join("node_modules/.bin"));

        let nvm_root = home.join(".nvm/versions/node");
        if let Ok(entries) = std::fs::read_dir(nvm_root) {
            for entry in entries.flatten() {
                let bin_path = entry.path().join("bin");
                if bin_path.is_dir() {
                    push(bin_path);
                }
            }
        }
    }

    for path in [
        "/opt/homebrew/bin",
        "/usr/local/bin",
        "/usr/bin",
        "/bin",
        "/usr/sbin",
        "/sbin",
    ] {
        push(PathBuf::from(path));
    }

    dirs
}

pub fn find_in_common_bins(binary: &str, home_var: Option<&str>) -> Option<PathBuf> {
    common_bin_dirs(home_var)
        .into_iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Resolve a configured program name to an executable path.
///
/// Absolute or relative paths are taken as-is when they exist. Bare names go
/// through `PATH` first and then the common install directories.
pub fn resolve_binary(program: &str, home_var: Option<&str>) -> Option<PathBuf> {
    let trimmed = program.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(trimmed);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    if let Ok(path) = which::which(trimmed) {
        return Some(path);
    }
    find_in_common_bins(trimmed, home_var)
}

/// The inherited `PATH` extended with the program's own directory and the
/// common install directories, de-duplicated in that order.
pub fn augmented_path(program: &Path, home_var: Option<&str>) -> Option<OsString> {
    let mut paths: Vec<PathBuf> = env::var_os("PATH")
        .map(|value| env::split_paths(&value).collect())
        .unwrap_or_default();

    let mut extras = Vec::new();
    if let Some(parent) = program.parent()
        && !parent.as_os_str().is_empty()
    {
        extras.push(parent.to_path_buf());
    }
    extras.extend(common_bin_dirs(home_var));

    for extra in extras {
        if !paths.contains(&extra) {
            paths.push(extra);
        }
    }

    env::join_paths(paths).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn augmented_path_contains_program_dir() {
        let joined = augmented_path(Path::new("/opt/agents/bin/codex"), None);
        let Some(joined) = joined else {
            return;
        };
        let split: Vec<PathBuf> = env::split_paths(&joined).collect();
        assert!(split.contains(&PathBuf::from("/opt/agents/bin")));
        assert!(split.contains(&PathBuf::from("/usr/local/bin")));
    }

    #[test]
    fn resolve_binary_rejects_missing_explicit_path() {
        assert!(resolve_binary("/definitely/not/here/agent", None).is_none());
        assert!(resolve_binary("   ", None).is_none());
    }
}
