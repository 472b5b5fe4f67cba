//! Launch description of a service or check command

use async_process::Command as AsyncCommand;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Program, arguments, environment overlay and working directory.
///
/// The environment is an overlay on top of the parent's; later values for
/// the same key replace earlier ones. A `Command` is plain data and can be
/// spawned any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    current_dir: Option<PathBuf>,
}

impl Command {
    /// A command running `program` with no arguments
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    /// Split an argv into program and arguments; `None` when it is empty
    pub fn from_argv<S: AsRef<OsStr>>(argv: &[S]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program).with_args(args))
    }

    /// Append arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Overlay one environment variable
    pub fn with_env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, val: V) -> Self {
        self.env
            .insert(key.as_ref().to_owned(), val.as_ref().to_owned());
        self
    }

    /// Overlay several environment variables
    pub fn with_envs<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        vars.into_iter()
            .fold(self, |cmd, (key, val)| cmd.with_env(key, val))
    }

    /// Run in `dir` instead of the parent's working directory
    pub fn in_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Program to run
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments after the program
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Value this command sets for `key`, if any
    pub fn env_value(&self, key: &str) -> Option<&OsStr> {
        self.env.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    /// Working directory override
    pub fn dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Shell-like rendering for logs; arguments with whitespace are quoted
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| {
                let part = part.to_string_lossy();
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{part}'")
                } else {
                    part.into_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// An `async_process::Command` for spawning. Stdio is left to the caller.
    pub(crate) fn to_async(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_argv() {
        let cmd = Command::from_argv(&["node", "server.js", "--port", "3000"]).unwrap();
        assert_eq!(cmd.program(), "node");
        assert_eq!(cmd.args().len(), 3);
        assert!(Command::from_argv::<&str>(&[]).is_none());
    }

    #[test]
    fn test_overlay_and_dir() {
        let cmd = Command::new("cargo")
            .with_args(["run", "--release"])
            .with_env("PORT", "1")
            .with_envs([("PORT", "2"), ("RUST_LOG", "info")])
            .in_dir("/srv/api");

        assert_eq!(cmd.env_value("PORT"), Some(OsStr::new("2")));
        assert_eq!(cmd.env_value("RUST_LOG"), Some(OsStr::new("info")));
        assert_eq!(cmd.env_value("HOME"), None);
        assert_eq!(cmd.dir(), Some(Path::new("/srv/api")));
    }

    #[test]
    fn test_display_quotes_spaced_args() {
        let cmd = Command::new("sh").with_args(["-c", "echo hi", ""]);
        assert_eq!(cmd.display(), "sh -c 'echo hi' ''");
        assert_eq!(Command::new("npm").with_args(["run", "dev"]).display(), "npm run dev");
    }
}
