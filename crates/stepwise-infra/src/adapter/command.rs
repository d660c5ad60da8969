//! Adapter that runs a configured external command per step.
//!
//! The command is run from the steps directory with the step identifier as its
//! last argument. It learns everything else from the environment:
//!
//! | Variable               | Value                                        |
//! |------------------------|----------------------------------------------|
//! | `STEPWISE_STEP`        | step identifier                              |
//! | `STEPWISE_DEST`        | directory to write the output into           |
//! | `STEPWISE_FINGERPRINT` | fingerprint being built                      |
//! | `STEPWISE_INPUTS`      | JSON array of `{"step", "path"}` per input   |

use std::path::PathBuf;
use std::process::Stdio;

use serde::Serialize;
use stepwise_core::adapter::{AdapterOutput, StepAdapter, StepInvocation};
use stepwise_types::config::CommandSpec;
use stepwise_types::error::StepExecutionError;

/// Characters of stderr/stdout kept in failure reasons and details.
const TAIL_CHARS: usize = 2_000;

#[derive(Debug, Clone)]
pub struct CommandAdapter {
    name: String,
    spec: CommandSpec,
    steps_dir: PathBuf,
}

#[derive(Serialize)]
struct InputEntry<'a> {
    step: String,
    path: &'a std::path::Path,
}

impl CommandAdapter {
    pub fn new(name: impl Into<String>, spec: CommandSpec, steps_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            spec,
            steps_dir: steps_dir.into(),
        }
    }

    fn inputs_json(invocation: &StepInvocation) -> Result<String, StepExecutionError> {
        let entries: Vec<InputEntry<'_>> = invocation
            .inputs
            .iter()
            .map(|input| InputEntry {
                step: input.step.to_string(),
                path: &input.location,
            })
            .collect();
        serde_json::to_string(&entries)
            .map_err(|e| StepExecutionError::failed(format!("cannot encode inputs: {e}")))
    }
}

/// Last `TAIL_CHARS` characters of `bytes`, trimmed.
fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(TAIL_CHARS);
    text.chars().skip(skip).collect()
}

impl StepAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        invocation: &StepInvocation,
    ) -> Result<AdapterOutput, StepExecutionError> {
        let Some((program, args)) = self.spec.command.split_first() else {
            return Err(StepExecutionError::failed(format!(
                "adapter '{}' has an empty command",
                self.name
            )));
        };
        let step = invocation.step.to_string();

        let child = tokio::process::Command::new(program)
            .args(args)
            .arg(&step)
            .current_dir(&self.steps_dir)
            .envs(&self.spec.env)
            .env("STEPWISE_STEP", &step)
            .env("STEPWISE_DEST", &invocation.dest)
            .env("STEPWISE_FINGERPRINT", invocation.fingerprint.to_hex())
            .env("STEPWISE_INPUTS", Self::inputs_json(invocation)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepExecutionError::failed(format!("failed to spawn {program}: {e}")))?;

        tracing::debug!(step = %step, adapter = %self.name, pid = ?child.id(), "spawned step command");

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = invocation.cancel.cancelled() => return Err(StepExecutionError::Cancelled),
            output = child.wait_with_output() => output.map_err(|e| {
                StepExecutionError::failed(format!("failed to wait for {program}: {e}"))
            })?,
        };

        if !output.status.success() {
            let stderr = tail(&output.stderr);
            return Err(StepExecutionError::failed(if stderr.is_empty() {
                format!("command exited with {}", output.status)
            } else {
                format!("command exited with {}: {stderr}", output.status)
            }));
        }

        let stdout = tail(&output.stdout);
        Ok(AdapterOutput {
            detail: (!stdout.is_empty()).then_some(stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    use super::*;
    use stepwise_core::adapter::DependencyInput;
    use stepwise_types::fingerprint::Fingerprint;
    use stepwise_types::identifier::StepIdentifier;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn shell(script: &str) -> CommandSpec {
        CommandSpec {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: BTreeMap::from([("PIPELINE_MODE".to_string(), "test".to_string())]),
        }
    }

    fn invocation(tmp: &TempDir) -> StepInvocation {
        let dest = tmp.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        StepInvocation {
            step: StepIdentifier::parse("data://garden/demo/2020-01-01/population").unwrap(),
            fingerprint: Fingerprint::from_bytes([7; 32]),
            inputs: vec![DependencyInput {
                step: StepIdentifier::parse("data://meadow/demo/2020-01-01/population").unwrap(),
                fingerprint: Fingerprint::from_bytes([6; 32]),
                location: tmp.path().join("meadow"),
            }],
            dest,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn success_writes_output_and_reports_stdout() {
        let tmp = TempDir::new().unwrap();
        // With `sh -c`, the appended step identifier becomes $0.
        let adapter = CommandAdapter::new(
            "data",
            shell(r#"printf '%s|%s|%s' "$0" "$STEPWISE_FINGERPRINT" "$PIPELINE_MODE" > "$STEPWISE_DEST/out.txt"; echo "$STEPWISE_INPUTS"; echo done"#),
            tmp.path(),
        );
        let inv = invocation(&tmp);
        let output = adapter.execute(&inv).await.unwrap();

        let written = std::fs::read_to_string(inv.dest.join("out.txt")).unwrap();
        assert_eq!(
            written,
            format!("data://garden/demo/2020-01-01/population|{}|test", "07".repeat(32))
        );
        let detail = output.detail.unwrap();
        assert!(detail.ends_with("done"));
        assert!(detail.contains(r#""step":"data://meadow/demo/2020-01-01/population""#));
    }

    #[tokio::test]
    async fn non_zero_exit_reports_status_and_stderr() {
        let tmp = TempDir::new().unwrap();
        let adapter = CommandAdapter::new("data", shell("echo 'KeyError: country' >&2; exit 3"), tmp.path());
        let err = adapter.execute(&invocation(&tmp)).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit status: 3"), "{message}");
        assert!(message.contains("KeyError: country"), "{message}");
    }

    #[tokio::test]
    async fn runs_in_steps_dir() {
        let tmp = TempDir::new().unwrap();
        let steps = tmp.path().join("steps");
        std::fs::create_dir_all(&steps).unwrap();
        let adapter = CommandAdapter::new("data", shell(r#"pwd > "$STEPWISE_DEST/cwd""#), &steps);
        let inv = invocation(&tmp);
        adapter.execute(&inv).await.unwrap();
        let cwd = std::fs::read_to_string(inv.dest.join("cwd")).unwrap();
        assert_eq!(
            std::fs::canonicalize(cwd.trim()).unwrap(),
            std::fs::canonicalize(&steps).unwrap()
        );
    }

    #[tokio::test]
    async fn cancellation_kills_the_command() {
        let tmp = TempDir::new().unwrap();
        let adapter = CommandAdapter::new("data", shell("sleep 30"), tmp.path());
        let inv = invocation(&tmp);
        let cancel = inv.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = adapter.execute(&inv).await.unwrap_err();
        assert!(matches!(err, StepExecutionError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn empty_command_fails() {
        let tmp = TempDir::new().unwrap();
        let spec = CommandSpec {
            command: Vec::new(),
            env: BTreeMap::new(),
        };
        let err = CommandAdapter::new("grapher", spec, tmp.path())
            .execute(&invocation(&tmp))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let tmp = TempDir::new().unwrap();
        let spec = CommandSpec {
            command: vec!["stepwise-no-such-program".to_string()],
            env: BTreeMap::new(),
        };
        let err = CommandAdapter::new("data", spec, tmp.path())
            .execute(&invocation(&tmp))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(TAIL_CHARS) + "END";
        let kept = tail(long.as_bytes());
        assert_eq!(kept.chars().count(), TAIL_CHARS);
        assert!(kept.ends_with("END"));
    }
}
