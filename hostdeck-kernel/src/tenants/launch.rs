//! Worker command line
//!
//! `ProcessSpec` is the pure argv/env for one tenant, `ExecutableResolver`
//! turns it into the ordered list of programs to try.

use std::path::{Path, PathBuf};

use crate::config::WorkerConf;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub tenant_id: u32,
    pub port: u16,
    pub root: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Substitutes `{port}` `{root}` `{base_url}` `{address}` `{tenant_id}` in every argument
    pub fn build(worker: &WorkerConf, tenant_id: u32, port: u16, root: &Path) -> Self {
        let root_str = root.to_string_lossy();
        let args = worker
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{root}", &root_str)
                    .replace("{base_url}", &worker.base_url)
                    .replace("{address}", &worker.address)
                    .replace("{tenant_id}", &tenant_id.to_string())
            })
            .collect();

        let mut env: Vec<(String, String)> =
            worker.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.sort();

        Self {
            tenant_id,
            port,
            root: root.to_path_buf(),
            args,
            env,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCandidate {
    pub program: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    primary: PathBuf,
    runner: String,
    runner_args: Vec<String>,
}

impl ExecutableResolver {
    pub fn new(worker: &WorkerConf) -> Self {
        Self {
            primary: worker.executable.clone(),
            runner: worker.fallback_runner.clone(),
            runner_args: worker.fallback_args.clone(),
        }
    }

    /// Primary executable first (when present), then the package runner shim
    pub fn candidates(&self, spec: &ProcessSpec) -> Vec<LaunchCandidate> {
        let mut out = Vec::with_capacity(2);

        // bare names are looked up in PATH at spawn time
        let bare_name = self.primary.components().count() == 1;
        if !self.primary.as_os_str().is_empty() && (bare_name || self.primary.is_file()) {
            out.push(LaunchCandidate {
                program: self.primary.clone(),
                args: spec.args.clone(),
            });
        }

        if !self.runner.is_empty() {
            let mut args = self.runner_args.clone();
            args.extend(spec.args.iter().cloned());
            out.push(LaunchCandidate {
                program: PathBuf::from(&self.runner),
                args,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerConf {
        WorkerConf {
            executable: PathBuf::from("/nonexistent/filebrowser"),
            ..WorkerConf::default()
        }
    }

    #[test]
    fn test_build_substitutes_placeholders() {
        let mut w = worker();
        w.env.insert("FB_TENANT".into(), "t".into());
        let spec = ProcessSpec::build(&w, 7, 7007, Path::new("/srv/t/7"));
        assert_eq!(
            spec.args,
            vec![
                "--address", "127.0.0.1", "--port", "7007", "--root", "/srv/t/7", "--baseurl",
                "/files", "--noauth"
            ]
        );
        assert_eq!(spec.env, vec![("FB_TENANT".to_string(), "t".to_string())]);
    }

    #[test]
    fn test_tenant_id_placeholder() {
        let w = WorkerConf {
            args: vec!["--db=/var/lib/fb/{tenant_id}.db".into()],
            ..worker()
        };
        let spec = ProcessSpec::build(&w, 42, 7042, Path::new("/r"));
        assert_eq!(spec.args, vec!["--db=/var/lib/fb/42.db"]);
    }

    #[test]
    fn test_missing_primary_uses_runner_only() {
        let w = worker();
        let spec = ProcessSpec::build(&w, 1, 7001, Path::new("/r"));
        let candidates = ExecutableResolver::new(&w).candidates(&spec);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].program, PathBuf::from("npx"));
        assert_eq!(&candidates[0].args[..3], &["--yes", "filebrowser", "--address"]);
    }

    #[test]
    fn test_existing_primary_comes_first() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let w = WorkerConf {
            executable: file.path().to_path_buf(),
            ..worker()
        };
        let spec = ProcessSpec::build(&w, 1, 7001, Path::new("/r"));
        let candidates = ExecutableResolver::new(&w).candidates(&spec);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].program, file.path());
        assert_eq!(candidates[0].args, spec.args);
    }

    #[test]
    fn test_bare_name_and_no_runner() {
        let w = WorkerConf {
            executable: PathBuf::from("filebrowser"),
            fallback_runner: String::new(),
            ..worker()
        };
        let spec = ProcessSpec::build(&w, 1, 7001, Path::new("/r"));
        let candidates = ExecutableResolver::new(&w).candidates(&spec);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].program, PathBuf::from("filebrowser"));
    }
}
