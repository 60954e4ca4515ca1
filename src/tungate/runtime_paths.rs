use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub workdir: PathBuf,
    pub profiles_path: PathBuf,
}

pub fn resolve_runtime_paths(workdir: Option<PathBuf>) -> anyhow::Result<RuntimePaths> {
    let workdir = resolve_workdir(workdir)?;
    let profiles_path = workdir.join("profiles.json");
    Ok(RuntimePaths {
        workdir,
        profiles_path,
    })
}

fn resolve_workdir(flag_or_env: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let mut wd = match flag_or_env {
        Some(p) => {
            if p.as_os_str().is_empty() {
                anyhow::bail!("workdir: empty path");
            }
            if p.is_relative() {
                std::env::current_dir()
                    .context("workdir: resolve cwd")?
                    .join(p)
            } else {
                p
            }
        }
        None => default_workdir()?,
    };

    wd = normalize_path(wd);
    if wd.as_os_str().is_empty() {
        anyhow::bail!("workdir: empty path");
    }
    Ok(wd)
}

fn default_workdir() -> anyhow::Result<PathBuf> {
    // Linux: system-wide state dir, matching how long-running network daemons on this
    // platform are usually deployed.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/var/lib/tungate"));
    }

    // Other OSes: per-user data dir.
    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "tungate", "tungate")
            .context("workdir: resolve user data dir")?;
        Ok(proj.data_local_dir().to_path_buf())
    }
}

fn normalize_path(p: PathBuf) -> PathBuf {
    // Pure component-level cleanup (no filesystem access): removes redundant `.` segments.
    // We intentionally do not resolve `..`.
    let mut out = PathBuf::new();
    for c in p.components() {
        if matches!(c, Component::CurDir) {
            continue;
        }
        out.push(c.as_os_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workdir_relative_is_under_cwd() {
        let rp = resolve_runtime_paths(Some(PathBuf::from("wd"))).expect("resolve");
        assert!(rp.workdir.is_absolute());
        assert_eq!(rp.profiles_path, rp.workdir.join("profiles.json"));
    }

    #[test]
    fn workdir_absolute_passthrough() {
        let rp = resolve_runtime_paths(Some(PathBuf::from("/tmp/tungate-test")))
            .expect("resolve");
        assert_eq!(rp.workdir, PathBuf::from("/tmp/tungate-test"));
    }
}
