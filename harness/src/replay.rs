//! Drive a [`Fixture`] against a live client.

use std::fmt;
use std::time::{Duration, Instant};

use lsprobe_lsp::protocol;
use lsprobe_types::{ClientError, SessionState};
use serde_json::Value;

use crate::error::HarnessError;
use crate::fixture::{Fixture, ResponseExpectation, Step};
use crate::harness::Harness;
use crate::matching::json_contains;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Passed,
    Failed(String),
    /// Not run because the session could not be initialized.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    /// 1-based; 0 is the implicit `initialize`.
    pub index: usize,
    pub description: String,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub fixture: String,
    pub steps: Vec<StepReport>,
}

impl ReplayReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.steps
            .iter()
            .all(|step| step.outcome == StepOutcome::Passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|step| step.outcome != StepOutcome::Passed)
    }
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "ok" } else { "FAILED" };
        writeln!(f, "fixture {}: {verdict}", self.fixture)?;
        for step in &self.steps {
            let status = match &step.outcome {
                StepOutcome::Passed => "ok".to_string(),
                StepOutcome::Failed(reason) => format!("FAILED: {reason}"),
                StepOutcome::Skipped => "skipped".to_string(),
            };
            writeln!(
                f,
                "  [{}] {} ({} ms) {status}",
                step.index,
                step.description,
                step.elapsed.as_millis()
            )?;
        }
        Ok(())
    }
}

pub struct Replayer<'a> {
    harness: &'a Harness,
    default_wait: Duration,
}

impl<'a> Replayer<'a> {
    #[must_use]
    pub fn new(harness: &'a Harness) -> Self {
        Self {
            harness,
            default_wait: Duration::from_secs(5),
        }
    }

    /// Timeout for notification expectations that do not set their own.
    #[must_use]
    pub fn default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Run every step and record each outcome. Initializes the session first
    /// when it is still uninitialized. Never shuts the server down.
    pub async fn run(&self, fixture: &Fixture) -> ReplayReport {
        tracing::info!(fixture = %fixture.name, steps = fixture.steps.len(), "replaying fixture");
        let mut report = ReplayReport {
            fixture: fixture.name.clone(),
            steps: Vec::with_capacity(fixture.steps.len() + 1),
        };

        let mut ready = true;
        if self.harness.client().state() == SessionState::Uninitialized {
            let started = Instant::now();
            let params = fixture
                .initialize
                .clone()
                .unwrap_or_else(|| protocol::initialize_params(Some(&fixture.workspace_uri)));
            let outcome = match self.harness.client().initialize(params).await {
                Ok(_) => StepOutcome::Passed,
                Err(e) => {
                    ready = false;
                    StepOutcome::Failed(e.to_string())
                }
            };
            report.steps.push(StepReport {
                index: 0,
                description: "initialize".into(),
                outcome,
                elapsed: started.elapsed(),
            });
        }

        for (i, step) in fixture.steps.iter().enumerate() {
            let started = Instant::now();
            let outcome = if ready {
                match self.run_step(step).await {
                    Ok(()) => StepOutcome::Passed,
                    Err(e) => StepOutcome::Failed(e.to_string()),
                }
            } else {
                StepOutcome::Skipped
            };
            if let StepOutcome::Failed(reason) = &outcome {
                tracing::warn!(step = i + 1, %reason, "fixture step failed");
            }
            report.steps.push(StepReport {
                index: i + 1,
                description: step.describe(),
                outcome,
                elapsed: started.elapsed(),
            });
        }
        report
    }

    async fn run_step(&self, step: &Step) -> Result<(), HarnessError> {
        let client = self.harness.client();
        match step {
            Step::Request {
                method,
                params,
                expect,
                timeout,
            } => {
                let result = client
                    .start_request(method, params.clone(), *timeout)
                    .await?
                    .await;
                check_response(result, expect)
            }
            Step::Notify { method, params } => Ok(client.notify(method, params.clone()).await?),
            Step::ExpectNotification {
                method,
                params,
                mode,
                timeout,
            } => {
                let expected = params.clone().unwrap_or(Value::Object(serde_json::Map::new()));
                self.harness
                    .expect_notification_params(
                        method,
                        &expected,
                        timeout.unwrap_or(self.default_wait),
                        *mode,
                    )
                    .await
                    .map(|_| ())
            }
        }
    }
}

fn check_response(
    result: Result<Value, ClientError>,
    expect: &ResponseExpectation,
) -> Result<(), HarnessError> {
    match (result, expect) {
        (Ok(_), ResponseExpectation::Success) => Ok(()),
        (Ok(actual), ResponseExpectation::Result(expected)) => {
            Ok(json_contains(&actual, expected)?)
        }
        (Err(ClientError::Protocol(error)), ResponseExpectation::Error(expected)) => {
            let actual = serde_json::to_value(&error)
                .map_err(|e| HarnessError::assertion(format!("unserializable error: {e}")))?;
            Ok(json_contains(&actual, expected)?)
        }
        (Ok(actual), ResponseExpectation::Error(expected)) => Err(HarnessError::assertion(format!(
            "expected error {expected}, got result {actual}"
        ))),
        (Err(e), _) => Err(e.into()),
    }
}
