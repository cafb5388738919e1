//! R engine driven through `Rscript` subprocesses.
//!
//! Each [`RscriptSession`] owns a private scratch directory. Every fit runs
//! in a new `Rscript --vanilla` process, so R's global environment starts
//! empty on every call. Dropping the session kills a still-running process
//! and removes the scratch directory.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::TempDir;

use crate::engine::{CallLimits, EngineOutput, EngineSession, FittingEngine};
use crate::error::{BridgeError, Result};
use crate::marshal::Payload;

const WORKER_SCRIPT: &str = include_str!("../resources/fit_worker.R");
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// R packages the worker loads, and whether a fit cannot run without them.
pub const R_PACKAGES: &[(&str, bool)] = &[
    ("jsonlite", true),
    ("lme4", true),
    ("lmerTest", true),
    ("MASS", true),
    ("emmeans", false),
];

#[derive(Debug, Clone)]
pub struct RscriptEngine {
    rscript: PathBuf,
}

impl RscriptEngine {
    pub fn new(rscript: impl Into<PathBuf>) -> Self {
        Self {
            rscript: rscript.into(),
        }
    }

    pub fn rscript(&self) -> &Path {
        &self.rscript
    }

    /// Checks that R runs and reports the version of each package it needs.
    pub fn doctor(&self) -> EngineReport {
        let probe = R_PACKAGES
            .iter()
            .map(|(name, _)| {
                format!(
                    "cat('pkg', '{name}', if (requireNamespace('{name}', quietly = TRUE)) \
                     as.character(utils::packageVersion('{name}')) else 'NA', '\\n', sep = '\\t')"
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        let expr = format!(
            "cat('R', paste0(R.version$major, '.', R.version$minor), '\\n', sep = '\\t'); {probe}"
        );

        let output = Command::new(&self.rscript)
            .args(["--vanilla", "-e", &expr])
            .stdin(Stdio::null())
            .output();
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return EngineReport::unavailable(
                    &self.rscript,
                    format!("failed to run {}: {e}", self.rscript.display()),
                );
            }
        };
        if !output.status.success() {
            return EngineReport::unavailable(
                &self.rscript,
                format!(
                    "{} exited with {}: {}",
                    self.rscript.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            );
        }
        EngineReport::parse(&self.rscript, &String::from_utf8_lossy(&output.stdout))
    }
}

impl FittingEngine for RscriptEngine {
    type Session = RscriptSession;

    fn name(&self) -> &str {
        "R (Rscript)"
    }

    fn open_session(&self) -> Result<RscriptSession> {
        let scratch = tempfile::Builder::new()
            .prefix("longmix-r-")
            .tempdir()
            .map_err(|e| BridgeError::engine(format!("failed to create scratch directory: {e}")))?;
        let script = scratch.path().join("fit_worker.R");
        std::fs::write(&script, WORKER_SCRIPT)
            .map_err(|e| BridgeError::engine(format!("failed to write worker script: {e}")))?;
        tracing::trace!(scratch = %scratch.path().display(), "opened R session");
        Ok(RscriptSession {
            rscript: self.rscript.clone(),
            script,
            scratch,
            child: None,
            calls: 0,
        })
    }
}

pub struct RscriptSession {
    rscript: PathBuf,
    script: PathBuf,
    scratch: TempDir,
    child: Option<Child>,
    calls: u32,
}

impl RscriptSession {
    fn scratch_file(&self, name: &str) -> PathBuf {
        self.scratch.path().join(format!("call{}_{name}", self.calls))
    }

    fn wait(&mut self, limits: &CallLimits) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            let Some(child) = self.child.as_mut() else {
                return Err(BridgeError::engine("R process is not running"));
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.child = None;
                    return Ok(status);
                }
                Ok(None) => {}
                Err(e) => {
                    self.terminate();
                    return Err(BridgeError::engine(format!("failed to poll R process: {e}")));
                }
            }
            if limits.cancel.is_cancelled() {
                self.terminate();
                return Err(BridgeError::Cancelled);
            }
            let elapsed = started.elapsed();
            if elapsed >= limits.timeout {
                self.terminate();
                return Err(BridgeError::Timeout {
                    limit: limits.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL.min(limits.timeout - elapsed));
        }
    }

    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "R process already exited");
            }
            let _ = child.wait();
        }
    }
}

impl EngineSession for RscriptSession {
    fn execute(&mut self, payload: &Payload, limits: &CallLimits) -> Result<EngineOutput> {
        self.calls += 1;
        let request_path = self.scratch_file("request.json");
        let result_path = self.scratch_file("result.json");
        let stderr_path = self.scratch_file("stderr.log");

        std::fs::write(&request_path, &payload.bytes)
            .map_err(|e| BridgeError::engine(format!("failed to write request: {e}")))?;
        let stderr = File::create(&stderr_path)
            .map_err(|e| BridgeError::engine(format!("failed to create log file: {e}")))?;

        let child = Command::new(&self.rscript)
            .arg("--vanilla")
            .arg(&self.script)
            .arg(&request_path)
            .arg(&result_path)
            .current_dir(self.scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                BridgeError::engine(format!("failed to start {}: {e}", self.rscript.display()))
            })?;
        tracing::trace!(pid = child.id(), call = self.calls, "started R worker");
        self.child = Some(child);

        let status = self.wait(limits)?;
        if !status.success() {
            let log = std::fs::read_to_string(&stderr_path).unwrap_or_default();
            return Err(BridgeError::engine(format!(
                "R worker exited with {status}: {}",
                tail(&log, 20)
            )));
        }

        let raw = std::fs::read_to_string(&result_path)
            .map_err(|e| BridgeError::engine(format!("R worker wrote no result: {e}")))?;
        serde_json::from_str(&raw)
            .map_err(|e| BridgeError::engine(format!("malformed R worker output: {e}")))
    }
}

impl Drop for RscriptSession {
    fn drop(&mut self) {
        self.terminate();
        tracing::trace!(scratch = %self.scratch.path().display(), "closed R session");
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageStatus {
    pub name: String,
    pub required: bool,
    pub version: Option<String>,
}

/// Outcome of [`RscriptEngine::doctor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineReport {
    pub rscript: PathBuf,
    pub r_version: Option<String>,
    pub packages: Vec<PackageStatus>,
    pub error: Option<String>,
}

impl EngineReport {
    fn unavailable(rscript: &Path, error: String) -> Self {
        Self {
            rscript: rscript.to_path_buf(),
            r_version: None,
            packages: Vec::new(),
            error: Some(error),
        }
    }

    /// Parses the tab-separated probe output (`R\t4.3.2`, `pkg\tlme4\t1.1-35`).
    pub fn parse(rscript: &Path, stdout: &str) -> Self {
        let mut r_version = None;
        let mut found: Vec<(String, Option<String>)> = Vec::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
            match fields.as_slice() {
                ["R", version, ..] => r_version = Some((*version).to_string()),
                ["pkg", name, version, ..] => {
                    let version = (*version != "NA").then(|| (*version).to_string());
                    found.push(((*name).to_string(), version));
                }
                _ => {}
            }
        }
        let packages = R_PACKAGES
            .iter()
            .map(|(name, required)| PackageStatus {
                name: (*name).to_string(),
                required: *required,
                version: found
                    .iter()
                    .find(|(n, _)| n == name)
                    .and_then(|(_, v)| v.clone()),
            })
            .collect();
        Self {
            rscript: rscript.to_path_buf(),
            r_version,
            packages,
            error: None,
        }
    }

    /// True when R runs and every required package is installed.
    pub fn is_ready(&self) -> bool {
        self.error.is_none()
            && self.r_version.is_some()
            && self
                .packages
                .iter()
                .all(|p| !p.required || p.version.is_some())
    }

    pub fn missing_required(&self) -> impl Iterator<Item = &PackageStatus> {
        self.packages
            .iter()
            .filter(|p| p.required && p.version.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use longmix_model::{Family, LadderState, Link};

    use crate::cancel::CancellationToken;
    use crate::marshal::FitRequest;

    #[test]
    fn parses_probe_output() {
        let stdout = "R\t4.3.2\t\npkg\tjsonlite\t1.8.8\t\npkg\tlme4\t1.1-35.1\t\n\
                      pkg\tlmerTest\t3.1-3\t\npkg\tMASS\tNA\t\npkg\temmeans\tNA\t\n";
        let report = EngineReport::parse(Path::new("Rscript"), stdout);
        assert_eq!(report.r_version.as_deref(), Some("4.3.2"));
        assert!(!report.is_ready());
        let missing: Vec<&str> = report.missing_required().map(|p| p.name.as_str()).collect();
        assert_eq!(missing, vec!["MASS"]);
    }

    #[test]
    fn missing_rscript_is_reported_not_raised() {
        let engine = RscriptEngine::new("/nonexistent/longmix/Rscript");
        let report = engine.doctor();
        assert!(report.error.is_some());
        assert!(!report.is_ready());
    }

    #[test]
    fn session_scratch_dir_is_removed_on_drop() {
        let engine = RscriptEngine::new("Rscript");
        let session = engine.open_session().unwrap();
        let scratch = session.scratch.path().to_path_buf();
        assert!(scratch.join("fit_worker.R").exists());
        drop(session);
        assert!(!scratch.exists());
    }

    /// Writes an executable stand-in for `Rscript`. It is called as
    /// `Rscript --vanilla <worker> <request> <result>`.
    #[cfg(unix)]
    fn fake_rscript(dir: &Path, body: &str) -> RscriptEngine {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("Rscript");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        RscriptEngine::new(path)
    }

    fn payload() -> Payload {
        let request = FitRequest {
            formula: "crp ~ time".into(),
            response: "crp".into(),
            family: Family::Gaussian,
            link: Link::Identity,
            ladder_state: LadderState::FixedEffectsOnly,
            random: false,
            n_rows: 0,
            factors: BTreeMap::new(),
            numeric: BTreeMap::new(),
        };
        Payload {
            bytes: serde_json::to_vec(&request).unwrap(),
            request,
            digest: String::new(),
        }
    }

    fn limits(timeout: Duration) -> CallLimits {
        CallLimits {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Reads the pid the fake worker recorded before it started sleeping.
    #[cfg(target_os = "linux")]
    fn recorded_pid(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("pid")).unwrap().trim().to_string()
    }

    #[cfg(target_os = "linux")]
    fn process_exists(pid: &str) -> bool {
        Path::new("/proc").join(pid).exists()
    }

    #[cfg(unix)]
    fn sleeper(dir: &Path) -> RscriptEngine {
        let pid_file = dir.join("pid");
        fake_rscript(
            dir,
            &format!("echo $$ > '{}'\nexec sleep 5", pid_file.display()),
        )
    }

    #[cfg(unix)]
    #[test]
    fn worker_result_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{"engine_version":"fake 1.0","converged":true,"coefficients":[{"name":"(Intercept)","estimate":1.5,"std_error":0.1}],"vcov_names":["(Intercept)"],"vcov":[[0.01]]}"#;
        let engine = fake_rscript(
            dir.path(),
            &format!("test -f \"$3\" || exit 9\nprintf '%s' '{json}' > \"$4\""),
        );
        let mut session = engine.open_session().unwrap();
        let output = session.execute(&payload(), &limits(Duration::from_secs(10))).unwrap();
        assert_eq!(output.engine_version, "fake 1.0");
        assert!(output.converged);
        assert_eq!(output.vcov, vec![vec![Some(0.01)]]);
    }

    #[cfg(unix)]
    #[test]
    fn slow_worker_is_killed_at_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sleeper(dir.path());
        let mut session = engine.open_session().unwrap();
        let scratch = session.scratch.path().to_path_buf();

        let started = Instant::now();
        let err = session
            .execute(&payload(), &limits(Duration::from_millis(500)))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(session.child.is_none());

        #[cfg(target_os = "linux")]
        assert!(!process_exists(&recorded_pid(dir.path())));
        drop(session);
        assert!(!scratch.exists());
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_a_running_worker() {
        let dir = tempfile::tempdir().unwrap();
        let engine = sleeper(dir.path());
        let mut session = engine.open_session().unwrap();
        let limits = limits(Duration::from_secs(30));
        let cancel = limits.cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            cancel.cancel();
        });

        let started = Instant::now();
        let err = session.execute(&payload(), &limits).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, BridgeError::Cancelled), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(4));

        #[cfg(target_os = "linux")]
        assert!(!process_exists(&recorded_pid(dir.path())));
    }

    #[cfg(unix)]
    #[test]
    fn failing_worker_reports_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_rscript(
            dir.path(),
            "echo 'Loading required package: Matrix' >&2\n\
             echo 'Error in loadNamespace: there is no package called lme4' >&2\nexit 3",
        );
        let mut session = engine.open_session().unwrap();
        let err = session
            .execute(&payload(), &limits(Duration::from_secs(10)))
            .unwrap_err();
        let BridgeError::Engine { message } = err else {
            panic!("expected an engine error, got {err:?}");
        };
        assert!(message.contains("there is no package called lme4"), "{message}");
    }

    #[cfg(unix)]
    #[test]
    fn worker_without_result_file_is_an_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fake_rscript(dir.path(), "exit 0");
        let mut session = engine.open_session().unwrap();
        let err = session
            .execute(&payload(), &limits(Duration::from_secs(10)))
            .unwrap_err();
        let BridgeError::Engine { message } = err else {
            panic!("expected an engine error, got {err:?}");
        };
        assert!(message.contains("wrote no result"), "{message}");
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc", 2), "b\nc");
        assert_eq!(tail("", 2), "");
    }
}
