//! Runs the external differential-expression engine as a subprocess.
//!
//! The engine receives three positional paths (counts, design, output) and
//! must write a JSON array of result rows to the output path. It is pointed
//! at a `<output>.partial` staging file; the real output path only ever
//! receives a complete, parsed result via rename.
//!
//! On unix the engine leads its own process group. Anything it forks is
//! killed with it, on timeout and after a normal exit alike.

use crate::{
    config::{DE_ENGINE_ENV_BIN, DeEngineConfig},
    error::{DeError, ShapeError},
    matrix::{CountTable, DesignTable},
    results::load_results,
    validator::{validate_counts, validate_cross_reference, validate_design},
};
use exprlab_protocol::{DifferentialExpressionResult, EngineAvailability};
use std::{
    env, fs,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Extra time granted to read pipes after the engine exits right at its
/// deadline.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeRunState {
    Idle,
    InputsValidated,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct DeInvoker {
    program: String,
    leading_args: Vec<String>,
    timeout: Duration,
    state: DeRunState,
}

/// First runnable match for `program`: used as-is when it names a path,
/// otherwise looked up along `PATH`.
fn locate_program(program: &str) -> Option<PathBuf> {
    let program = program.trim();
    if program.is_empty() {
        return None;
    }
    if Path::new(program).components().count() > 1 {
        let candidate = PathBuf::from(program);
        return is_runnable(&candidate).then_some(candidate);
    }
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_runnable(candidate))
}

fn is_runnable(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "de_results".into());
    name.push(".partial");
    output.with_file_name(name)
}

/// Reads a child pipe to the end on its own thread. The receiver lets the
/// caller give up at a deadline while a stray process still holds the pipe.
fn drain<R: Read + Send + 'static>(source: Option<R>) -> Option<Receiver<String>> {
    source.map(|mut reader| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
        });
        rx
    })
}

/// `None` when the pipe is still open at `deadline`.
fn collect(rx: Option<Receiver<String>>, deadline: Instant) -> Option<String> {
    let Some(rx) = rx else {
        return Some(String::new());
    };
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(text) => Some(text),
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
        Err(RecvTimeoutError::Timeout) => None,
    }
}

/// The engine leads its own process group so that helpers it forks can be
/// signalled together with it.
#[cfg(unix)]
fn isolate(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command) {}

/// SIGKILL to every process still in the engine's group.
#[cfg(unix)]
fn kill_group(leader: u32) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };
    let Ok(pgid) = i32::try_from(leader) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "Killed engine process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Could not kill engine process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: u32) {}

fn terminate(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

fn validate_inputs(counts_file: &Path, design_file: &Path) -> Result<(), DeError> {
    for path in [counts_file, design_file] {
        if !path.is_file() {
            return Err(DeError::InputMissing {
                path: path.display().to_string(),
            });
        }
    }
    let invalid = |path: &Path, reason: String| DeError::InputInvalid {
        path: path.display().to_string(),
        reason,
    };
    let counts = CountTable::from_csv_path(counts_file)
        .and_then(|table| validate_counts(&table))
        .map_err(|e| invalid(counts_file, e.to_string()))?;
    let design = DesignTable::from_csv_path(design_file)
        .map_err(|e| invalid(design_file, e.to_string()))?;
    validate_design(&design).map_err(|e| invalid(design_file, e.to_string()))?;
    validate_cross_reference(&design, counts.matrix.samples())
        .map_err(|e| invalid(design_file, e.to_string()))?;
    Ok(())
}

impl DeInvoker {
    pub fn new(config: &DeEngineConfig) -> Self {
        Self::with_command(
            config.program(),
            config.leading_args().to_vec(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn with_command(
        program: impl Into<String>,
        leading_args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args,
            timeout,
            state: DeRunState::Idle,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// State reached by the most recent `run`.
    pub fn state(&self) -> DeRunState {
        self.state
    }

    /// Whether the engine program resolves, without starting it.
    pub fn availability(&self) -> EngineAvailability {
        match locate_program(&self.program) {
            Some(path) => {
                debug!(program = %self.program, resolved = %path.display(), "Engine resolved");
                EngineAvailability {
                    available: true,
                    reason: None,
                }
            }
            None => EngineAvailability {
                available: false,
                reason: Some(format!(
                    "could not find engine executable '{}'; install it or set {}",
                    self.program, DE_ENGINE_ENV_BIN
                )),
            },
        }
    }

    /// Validates inputs, runs the engine once and returns its parsed output.
    pub fn run(
        &mut self,
        counts_file: &Path,
        design_file: &Path,
        output_file: &Path,
    ) -> Result<Vec<DifferentialExpressionResult>, DeError> {
        self.state = DeRunState::Idle;
        if let Err(e) = validate_inputs(counts_file, design_file) {
            self.state = DeRunState::Failed;
            return Err(e);
        }
        self.state = DeRunState::InputsValidated;

        let staging = staging_path(output_file);
        let outcome = self.execute(counts_file, design_file, output_file, &staging);
        if outcome.is_err() && staging.exists() {
            if let Err(e) = fs::remove_file(&staging) {
                warn!(path = %staging.display(), error = %e, "Could not remove staging output");
            }
        }
        self.state = match &outcome {
            Ok(_) => DeRunState::Succeeded,
            Err(DeError::Timeout { .. }) => DeRunState::TimedOut,
            Err(_) => DeRunState::Failed,
        };
        outcome
    }

    fn spawn(&self, counts: &Path, design: &Path, staging: &Path) -> Result<Child, DeError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg(counts)
            .arg(design)
            .arg(staging)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate(&mut command);
        command.spawn().map_err(|e| DeError::EngineUnavailable {
            program: self.program.clone(),
            reason: e.to_string(),
        })
    }

    fn timed_out(&self) -> DeError {
        error!(
            seconds = self.timeout.as_secs(),
            "Engine timed out and was terminated"
        );
        DeError::Timeout {
            seconds: self.timeout.as_secs(),
        }
    }

    /// Polls the child until exit or timeout. Whatever is left of its
    /// process group is killed either way, and output collection is bounded
    /// by the same deadline.
    fn wait(&mut self, mut child: Child) -> Result<(ExitStatus, String, String), DeError> {
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    terminate(&mut child);
                    return Err(self.timed_out());
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    terminate(&mut child);
                    return Err(DeError::Io(format!("could not wait for engine: {e}")));
                }
            }
        };
        kill_group(child.id());

        let drain_deadline = deadline.max(Instant::now()) + DRAIN_GRACE;
        match (
            collect(stdout, drain_deadline),
            collect(stderr, drain_deadline),
        ) {
            (Some(out), Some(err)) => Ok((status, out, err)),
            _ => Err(self.timed_out()),
        }
    }

    fn execute(
        &mut self,
        counts: &Path,
        design: &Path,
        output: &Path,
        staging: &Path,
    ) -> Result<Vec<DifferentialExpressionResult>, DeError> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| DeError::Io(format!("could not create output directory: {e}")))?;
        }
        if staging.exists() {
            fs::remove_file(staging)
                .map_err(|e| DeError::Io(format!("could not clear stale staging file: {e}")))?;
        }

        info!(
            program = %self.program,
            args = ?self.leading_args,
            counts = %counts.display(),
            design = %design.display(),
            "Starting differential expression engine"
        );
        let started = Instant::now();
        let child = self.spawn(counts, design, staging)?;
        self.state = DeRunState::Running;
        let (status, stdout, stderr) = self.wait(child)?;
        if !stdout.trim().is_empty() {
            debug!(stdout = %stdout.trim(), "Engine stdout");
        }

        if !status.success() {
            error!(code = ?status.code(), stderr = %stderr.trim(), "Engine failed");
            return Err(DeError::EngineError {
                code: status.code(),
                stderr,
            });
        }
        if !staging.is_file() {
            return Err(DeError::OutputMissing {
                path: staging.display().to_string(),
            });
        }
        let results = load_results(staging).map_err(|e| match e {
            ShapeError::Io { path, reason } | ShapeError::Malformed { path, reason } => {
                DeError::OutputMalformed { path, reason }
            }
            other => DeError::OutputMalformed {
                path: staging.display().to_string(),
                reason: other.to_string(),
            },
        })?;
        fs::rename(staging, output)
            .map_err(|e| DeError::Io(format!("could not move engine output into place: {e}")))?;
        info!(
            rows = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            output = %output.display(),
            "Differential expression finished"
        );
        Ok(results)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    const COUNTS: &str = "gene,A,B,C,D\nG1,10,20,30,40\nG2,5,3,8,1\n";
    const DESIGN: &str = "sample,condition\nA,ctrl\nB,ctrl\nC,treat\nD,treat\n";

    struct Fixture {
        dir: TempDir,
        counts: PathBuf,
        design: PathBuf,
        output: PathBuf,
    }

    fn fixture(design: &str) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let counts = dir.path().join("raw_counts.csv");
        let design_path = dir.path().join("experiment_design.csv");
        fs::write(&counts, COUNTS).expect("write counts");
        fs::write(&design_path, design).expect("write design");
        let output = dir.path().join("deseq2_results.json");
        Fixture {
            dir,
            counts,
            design: design_path,
            output,
        }
    }

    fn engine(fx: &Fixture, script: &str, timeout: Duration) -> DeInvoker {
        let path = fx.dir.path().join("engine.sh");
        fs::write(&path, script).expect("write script");
        DeInvoker::with_command("sh", vec![path.display().to_string()], timeout)
    }

    fn run(invoker: &mut DeInvoker, fx: &Fixture) -> Result<Vec<DifferentialExpressionResult>, DeError> {
        invoker.run(&fx.counts, &fx.design, &fx.output)
    }

    #[test]
    fn successful_run_moves_output_into_place() {
        let fx = fixture(DESIGN);
        let mut invoker = engine(
            &fx,
            r#"printf '[{"gene":"G1","log2_fold_change":1.5,"p_value":0.01,"adjusted_p_value":0.02}]' > "$3""#,
            Duration::from_secs(10),
        );
        let results = run(&mut invoker, &fx).expect("engine run");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].gene, "G1");
        assert_eq!(invoker.state(), DeRunState::Succeeded);
        assert!(fx.output.is_file());
        assert!(!staging_path(&fx.output).exists());
    }

    #[test]
    fn non_zero_exit_reports_code_and_stderr() {
        let fx = fixture(DESIGN);
        let mut invoker = engine(&fx, "echo 'boom' >&2\nexit 3\n", Duration::from_secs(10));
        let err = run(&mut invoker, &fx).expect_err("engine failure");
        assert!(matches!(
            err,
            DeError::EngineError { code: Some(3), ref stderr } if stderr.contains("boom")
        ));
        assert_eq!(invoker.state(), DeRunState::Failed);
    }

    #[test]
    fn timeout_kills_engine_and_leaves_no_output() {
        let fx = fixture(DESIGN);
        let mut invoker = engine(&fx, "echo '[' > \"$3\"\nexec sleep 10\n", Duration::from_secs(1));
        let started = Instant::now();
        let err = run(&mut invoker, &fx).expect_err("timeout");
        assert_eq!(err, DeError::Timeout { seconds: 1 });
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(invoker.state(), DeRunState::TimedOut);
        assert!(!fx.output.exists());
        assert!(!staging_path(&fx.output).exists());
    }

    #[test]
    fn timeout_kills_helpers_forked_by_the_engine() {
        let fx = fixture(DESIGN);
        let marker = fx.dir.path().join("late-helper");
        let script = format!(
            "( sleep 2; printf '[]' > \"$3\"; touch '{}' ) &\nwait\n",
            marker.display()
        );
        let mut invoker = engine(&fx, &script, Duration::from_secs(1));
        let started = Instant::now();
        let err = run(&mut invoker, &fx).expect_err("timeout");
        assert_eq!(err, DeError::Timeout { seconds: 1 });
        assert!(started.elapsed() < Duration::from_secs(2));

        thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists());
        assert!(!staging_path(&fx.output).exists());
        assert!(!fx.output.exists());
    }

    #[test]
    fn helpers_holding_pipes_do_not_outlive_a_finished_engine() {
        let fx = fixture(DESIGN);
        let marker = fx.dir.path().join("late-helper");
        let script = format!(
            "( sleep 2; touch '{}' ) &\nprintf '[]' > \"$3\"\n",
            marker.display()
        );
        let mut invoker = engine(&fx, &script, Duration::from_secs(10));
        let started = Instant::now();
        let results = run(&mut invoker, &fx).expect("engine run");
        assert!(results.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(invoker.state(), DeRunState::Succeeded);

        thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists());
    }

    #[test]
    fn malformed_output_is_rejected_and_previous_result_kept() {
        let fx = fixture(DESIGN);
        fs::write(&fx.output, "[]").expect("seed previous result");
        let mut invoker = engine(&fx, "echo 'not json' > \"$3\"\n", Duration::from_secs(10));
        let err = run(&mut invoker, &fx).expect_err("malformed");
        assert!(matches!(err, DeError::OutputMalformed { .. }));
        assert_eq!(fs::read_to_string(&fx.output).expect("read previous"), "[]");
        assert!(!staging_path(&fx.output).exists());
    }

    #[test]
    fn silent_success_without_output_is_an_error() {
        let fx = fixture(DESIGN);
        let mut invoker = engine(&fx, "exit 0\n", Duration::from_secs(10));
        let err = run(&mut invoker, &fx).expect_err("no output");
        assert!(matches!(err, DeError::OutputMissing { .. }));
    }

    #[test]
    fn invalid_inputs_never_spawn_the_engine() {
        let fx = fixture("sample,condition\nA,ctrl\nZ,treat\n");
        let marker = fx.dir.path().join("spawned");
        let script = format!("touch '{}'\n", marker.display());
        let mut invoker = engine(&fx, &script, Duration::from_secs(10));
        let err = run(&mut invoker, &fx).expect_err("unknown sample");
        assert!(matches!(err, DeError::InputInvalid { .. }));
        assert!(!marker.exists());
        assert_eq!(invoker.state(), DeRunState::Failed);
    }

    #[test]
    fn missing_input_file_is_reported() {
        let fx = fixture(DESIGN);
        fs::remove_file(&fx.design).expect("remove design");
        let mut invoker = engine(&fx, "exit 0\n", Duration::from_secs(10));
        let err = run(&mut invoker, &fx).expect_err("missing design");
        assert!(matches!(err, DeError::InputMissing { ref path } if path.ends_with("experiment_design.csv")));
    }

    #[test]
    fn unknown_program_is_unavailable() {
        let fx = fixture(DESIGN);
        let mut invoker = DeInvoker::with_command(
            fx.dir.path().join("no-such-engine").display().to_string(),
            vec![],
            Duration::from_secs(1),
        );
        assert!(!invoker.availability().available);
        let err = run(&mut invoker, &fx).expect_err("spawn failure");
        assert!(matches!(err, DeError::EngineUnavailable { .. }));
    }

    #[test]
    fn only_executable_files_count_as_available() {
        use std::os::unix::fs::PermissionsExt;
        let td = tempdir().expect("tempdir");
        let script = td.path().join("engine.sh");
        fs::write(&script, "exit 0\n").expect("write script");
        let available = |program: &Path| {
            DeInvoker::with_command(program.display().to_string(), vec![], Duration::from_secs(1))
                .availability()
                .available
        };

        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).expect("chmod 644");
        assert!(!available(script.as_path()));
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod 755");
        assert!(available(script.as_path()));
        assert!(!available(td.path()));
    }

    #[test]
    fn shell_resolves_on_path() {
        let invoker = DeInvoker::with_command("sh", vec![], Duration::from_secs(1));
        let availability = invoker.availability();
        assert!(availability.available);
        assert!(availability.reason.is_none());
    }
}
