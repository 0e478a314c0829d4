//! Outcome tracking for best-effort teardown

use std::fmt;

/// Result of one teardown action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Not attempted, with the reason
    Skipped(String),
    /// Target was already gone
    Absent,
    /// Attempted and failed; teardown went on
    Warning(String),
}

/// One entry in a [`TeardownReport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: String,
    /// Node, namespace, volume... the action applied to
    pub subject: Option<String>,
    pub outcome: Outcome,
}

/// Every action taken while removing a cluster or node, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub target: String,
    pub steps: Vec<StepOutcome>,
}

impl TeardownReport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: &str, subject: Option<&str>, outcome: Outcome) {
        match &outcome {
            Outcome::Warning(e) => tracing::warn!(
                target_name = %self.target,
                step = %step,
                subject = subject.unwrap_or("-"),
                error = %e,
                "Teardown step failed, continuing"
            ),
            other => tracing::debug!(
                target_name = %self.target,
                step = %step,
                subject = subject.unwrap_or("-"),
                outcome = ?other,
                "Teardown step"
            ),
        }
        self.steps.push(StepOutcome {
            step: step.to_string(),
            subject: subject.map(String::from),
            outcome,
        });
    }

    /// Record the result of a best-effort action; absence counts as done
    pub fn attempt(&mut self, step: &str, subject: Option<&str>, result: crate::Result<()>) -> bool {
        match result {
            Ok(()) => {
                self.record(step, subject, Outcome::Done);
                true
            }
            Err(e) if e.is_not_found() => {
                self.record(step, subject, Outcome::Absent);
                true
            }
            Err(e) => {
                self.record(step, subject, Outcome::Warning(e.to_string()));
                false
            }
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, Outcome::Warning(_)))
    }

    /// True if no action failed
    pub fn is_clean(&self) -> bool {
        self.warnings().next().is_none()
    }

    /// Outcomes recorded for one subject
    pub fn for_subject<'a>(&'a self, subject: &'a str) -> impl Iterator<Item = &'a StepOutcome> {
        self.steps
            .iter()
            .filter(move |s| s.subject.as_deref() == Some(subject))
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subject {
            Some(s) => write!(f, "{} [{}]: ", self.step, s)?,
            None => write!(f, "{}: ", self.step)?,
        }
        match &self.outcome {
            Outcome::Done => write!(f, "done"),
            Outcome::Skipped(why) => write!(f, "skipped ({})", why),
            Outcome::Absent => write!(f, "already absent"),
            Outcome::Warning(e) => write!(f, "failed: {}", e),
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "teardown of {}:", self.target)?;
        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }
        Ok(())
    }
}
