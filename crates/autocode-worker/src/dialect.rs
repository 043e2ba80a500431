use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::protocol::WorkerMarkers;

/// Interpreter-specific pieces of the worker protocol.
///
/// A dialect knows how to launch its interpreter against a bootstrap file, what
/// that bootstrap loop looks like, and how to turn a base64 payload back into a
/// single evaluable line.
pub trait WorkerDialect: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn program(&self) -> &Path;

    fn launch_args(&self, bootstrap: &Path) -> Vec<OsString>;

    fn bootstrap_extension(&self) -> &'static str;

    fn bootstrap_source(&self, markers: &WorkerMarkers) -> String;

    /// One-line expression that decodes `encoded` and evaluates it as a script.
    fn wrap_encoded_script(&self, encoded: &str) -> String;
}

/// Julia worker launched as `julia --startup-file=no --quiet <bootstrap.jl>`.
#[derive(Debug, Clone)]
pub struct JuliaDialect {
    executable: PathBuf,
}

impl JuliaDialect {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Default for JuliaDialect {
    fn default() -> Self {
        Self::new("julia")
    }
}

impl WorkerDialect for JuliaDialect {
    fn name(&self) -> &'static str {
        "julia"
    }

    fn program(&self) -> &Path {
        &self.executable
    }

    fn launch_args(&self, bootstrap: &Path) -> Vec<OsString> {
        vec![
            OsString::from("--startup-file=no"),
            OsString::from("--quiet"),
            bootstrap.as_os_str().to_os_string(),
        ]
    }

    fn bootstrap_extension(&self) -> &'static str {
        ".jl"
    }

    fn bootstrap_source(&self, markers: &WorkerMarkers) -> String {
        format!(
            r#"using Base64
redirect_stderr(stdout)
while !eof(stdin)
    line = readline(stdin)
    try
        result = isempty(strip(line)) ? nothing : eval(Meta.parse(line))
        println("{result}" * Base64.base64encode(string(result)))
    catch e
        println("{error}" * Base64.base64encode(string(e)))
    end
    flush(stdout)
end
"#,
            result = markers.result(),
            error = markers.error(),
        )
    }

    fn wrap_encoded_script(&self, encoded: &str) -> String {
        format!(
            "let _b=Base64.base64decode(\"{encoded}\"); _s=String(_b); include_string(Main, _s); end"
        )
    }
}

/// POSIX shell worker; each line is `eval`ed and its combined output becomes the
/// reply payload. File descriptor 3 is the raw worker stdout, so `>&3` writes
/// show up as captured output.
#[derive(Debug, Clone)]
pub struct ShellDialect {
    shell: PathBuf,
}

impl ShellDialect {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellDialect {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

impl WorkerDialect for ShellDialect {
    fn name(&self) -> &'static str {
        "sh"
    }

    fn program(&self) -> &Path {
        &self.shell
    }

    fn launch_args(&self, bootstrap: &Path) -> Vec<OsString> {
        vec![bootstrap.as_os_str().to_os_string()]
    }

    fn bootstrap_extension(&self) -> &'static str {
        ".sh"
    }

    fn bootstrap_source(&self, markers: &WorkerMarkers) -> String {
        format!(
            r#"exec 3>&1
while IFS= read -r line || [ -n "$line" ]; do
  if output=$(eval "$line" 2>&1); then
    printf '%s%s\n' '{result}' "$(printf '%s' "$output" | base64 | tr -d '\n')"
  else
    printf '%s%s\n' '{error}' "$(printf '%s' "$output" | base64 | tr -d '\n')"
  fi
done
"#,
            result = markers.result(),
            error = markers.error(),
        )
    }

    fn wrap_encoded_script(&self, encoded: &str) -> String {
        format!("eval \"$(printf '%s' '{encoded}' | base64 -d)\"")
    }
}
