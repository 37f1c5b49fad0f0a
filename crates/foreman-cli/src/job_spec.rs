//! Parsing of `--job type:harness[:context]` arguments.

use foreman_db::models::{JobType, JobTypeParseError, NewJob};

#[derive(Debug, thiserror::Error)]
pub enum ParseJobSpecError {
    #[error("job spec {0:?} must look like type:harness[:context]")]
    Shape(String),
    #[error("job spec {spec:?} has an empty harness")]
    EmptyHarness { spec: String },
    #[error("job spec {spec:?}: {source}")]
    JobType {
        spec: String,
        #[source]
        source: JobTypeParseError,
    },
}

/// Parse one job spec. The context is everything after the second colon,
/// so it may itself contain colons.
pub fn parse_job_spec(spec: &str) -> Result<NewJob, ParseJobSpecError> {
    let mut parts = spec.splitn(3, ':');
    let (Some(kind), Some(harness)) = (parts.next(), parts.next()) else {
        return Err(ParseJobSpecError::Shape(spec.to_string()));
    };

    let job_type: JobType = kind
        .trim()
        .parse()
        .map_err(|source| ParseJobSpecError::JobType {
            spec: spec.to_string(),
            source,
        })?;

    let harness = harness.trim();
    if harness.is_empty() {
        return Err(ParseJobSpecError::EmptyHarness {
            spec: spec.to_string(),
        });
    }

    let job = NewJob::new(job_type, harness);
    Ok(match parts.next().map(str::trim).filter(|c| !c.is_empty()) {
        Some(context) => job.with_context(context),
        None => job,
    })
}

/// clap value parser adapter.
pub fn job_spec_arg(spec: &str) -> Result<NewJob, String> {
    parse_job_spec(spec).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_harness() {
        let job = parse_job_spec("implement:codex").unwrap();
        assert_eq!(job.job_type, JobType::Implement);
        assert_eq!(job.harness, "codex");
        assert!(job.context.is_none());
    }

    #[test]
    fn context_keeps_inner_colons() {
        let job = parse_job_spec("review:claude-code:check src/a.rs: the parser").unwrap();
        assert_eq!(job.job_type, JobType::Review);
        assert_eq!(job.context.as_deref(), Some("check src/a.rs: the parser"));
    }

    #[test]
    fn blank_context_is_dropped() {
        let job = parse_job_spec("pm:gemini:  ").unwrap();
        assert!(job.context.is_none());
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(matches!(
            parse_job_spec("implement"),
            Err(ParseJobSpecError::Shape(_))
        ));
        assert!(matches!(
            parse_job_spec("implement: "),
            Err(ParseJobSpecError::EmptyHarness { .. })
        ));
        let err = parse_job_spec("deploy:codex").unwrap_err();
        assert!(matches!(err, ParseJobSpecError::JobType { .. }));
        assert!(err.to_string().contains("deploy"));
    }
}
