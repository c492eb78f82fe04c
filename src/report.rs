//! User-facing summary of a finished session. Pure formatting.

use crate::driver::{ExecutionSession, SessionFailure};
use crate::reconcile::ReconciledArtifact;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session: ExecutionSession,
    pub artifacts: Vec<ReconciledArtifact>,
}

impl SessionOutcome {
    pub fn new(session: ExecutionSession, artifacts: Vec<ReconciledArtifact>) -> Self {
        Self { session, artifacts }
    }

    pub fn succeeded(&self) -> bool {
        self.session.succeeded()
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        self.session.failure.as_ref()
    }

    pub fn copied_artifacts(&self) -> impl Iterator<Item = &ReconciledArtifact> {
        self.artifacts.iter().filter(|a| a.copied())
    }

    pub fn failed_artifacts(&self) -> impl Iterator<Item = &ReconciledArtifact> {
        self.artifacts.iter().filter(|a| !a.copied())
    }

    /// Session succeeded and every produced file landed
    pub fn is_complete_success(&self) -> bool {
        self.succeeded() && self.failed_artifacts().next().is_none()
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(output) = &self.session.final_output {
            writeln!(f, "{}", output.trim_end())?;
            writeln!(f)?;
        }

        let copied: Vec<_> = self.copied_artifacts().collect();
        if copied.is_empty() {
            writeln!(f, "No files written.")?;
        } else {
            writeln!(f, "{} file(s) written:", copied.len())?;
            for artifact in copied {
                if artifact.renamed() {
                    writeln!(
                        f,
                        "  {} (renamed from {}, name was taken)",
                        artifact.destination_name, artifact.source_name
                    )?;
                } else {
                    writeln!(f, "  {}", artifact.destination_name)?;
                }
            }
        }

        let failed: Vec<_> = self.failed_artifacts().collect();
        if !failed.is_empty() {
            writeln!(f, "{} file(s) could not be copied:", failed.len())?;
            for error in failed.iter().filter_map(|a| a.error()) {
                writeln!(f, "  {error}")?;
            }
        }

        if !self.session.denials.is_empty() {
            writeln!(f, "{} write(s) blocked by the sandbox.", self.session.denials.len())?;
        }

        match &self.session.failure {
            Some(failure) => write!(f, "Session failed: {failure}"),
            None => write!(f, "Session {}.", self.session.status),
        }
    }
}
