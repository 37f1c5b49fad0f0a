//! Prompt rendering: the exact instructions handed to an agent process.
//!
//! Pure string assembly from a job and its assignment. The rendered text is
//! stored on the job when it starts, so what an agent was told stays
//! auditable.

use foreman_db::models::{Assignment, Job, JobType};

/// Longest tail of the artifact and decision logs carried into a prompt.
const LOG_TAIL_CHARS: usize = 8 * 1024;

const PLAN: &str = "\
Break the north star down into concrete, independently verifiable steps. \
Record the plan in your final answer. Do not implement anything yet.";

const IMPLEMENT: &str = "\
Implement the change described by the context below in the project's \
working tree. Keep the change focused, build it, and run the relevant tests \
before you finish. Summarise what you changed in your final answer.";

const REVIEW: &str = "\
Review the most recent work on this assignment for correctness, missing \
tests, and regressions. Report concrete findings with file and line \
references. Do not rewrite the code yourself.";

const UAT: &str = "\
Exercise the feature the way a user would and report whether it behaves as \
the north star requires. List every deviation you find.";

const VERIFY: &str = "\
Run the project's build, linters and test suite and report the results. \
Fix nothing; only report.";

const RESEARCH: &str = "\
Investigate the question in the context below. Read code and documentation \
as needed and answer with evidence. Do not modify the project.";

const RETROSPECT: &str = "\
A previous job on this assignment failed. Diagnose why from the failure \
details below, repair whatever can be repaired safely, and explain in your \
final answer what went wrong and what should happen next.";

const PM: &str = "\
You are the project manager for this assignment. Read the artifacts and \
decisions so far and decide what happens next. State your decision in your \
final answer.";

/// Follow-up mechanics appended to every pm prompt.
const PM_ACTIONS: &str = "\
## How to act on your decision

- **More work is needed**: link it to this assignment's chain by running,
  once per group of parallel jobs and in the order the groups should run,

  ```sh
  foreman group append --after-current --job <type>:<harness>[:<context>] ...
  ```

  Job types: plan, implement, review, uat, verify, research. Harnesses:
  claude-code, codex, gemini.
- **A human must step in**: put a line `BLOCKED: <reason>` in your final
  answer.
- **The north star is met**: say so and append nothing; the assignment will
  be closed once no work remains.
";

fn role_instructions(job_type: JobType) -> &'static str {
    match job_type {
        JobType::Plan => PLAN,
        JobType::Implement => IMPLEMENT,
        JobType::Review => REVIEW,
        JobType::Uat => UAT,
        JobType::Verify => VERIFY,
        JobType::Research => RESEARCH,
        JobType::Retrospect => RETROSPECT,
        JobType::Pm => PM,
    }
}

/// Keep at most the last `max` chars of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn push_section(prompt: &mut String, title: &str, body: &str) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    prompt.push_str("## ");
    prompt.push_str(title);
    prompt.push_str("\n\n");
    prompt.push_str(body);
    prompt.push_str("\n\n");
}

/// Render the instructions for `job`.
pub fn render(job: &Job, assignment: &Assignment) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str(&format!("# Foreman job: {}\n\n", job.job_type));
    prompt.push_str(role_instructions(job.job_type));
    prompt.push_str("\n\n");

    push_section(&mut prompt, "North star", &assignment.north_star);
    if let Some(context) = &job.context {
        push_section(&mut prompt, "Context", context);
    }
    push_section(
        &mut prompt,
        "Artifacts so far",
        tail(&assignment.artifacts, LOG_TAIL_CHARS),
    );
    push_section(
        &mut prompt,
        "Decisions so far",
        tail(&assignment.decisions, LOG_TAIL_CHARS),
    );

    if job.job_type == JobType::Pm {
        prompt.push_str(PM_ACTIONS);
    }

    prompt.truncate(prompt.trim_end().len());
    prompt.push('\n');
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_db::models::{AssignmentStatus, JobStatus};
    use uuid::Uuid;

    fn assignment(north_star: &str) -> Assignment {
        Assignment {
            id: Uuid::new_v4(),
            namespace_id: Uuid::new_v4(),
            north_star: north_star.into(),
            status: AssignmentStatus::Active,
            independent: false,
            priority: 0,
            artifacts: String::new(),
            decisions: String::new(),
            blocked_reason: None,
            head_group_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn job(job_type: JobType, context: Option<&str>) -> Job {
        Job {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            assignment_id: Uuid::new_v4(),
            namespace_id: Uuid::new_v4(),
            job_type,
            harness: "claude-code".into(),
            context: context.map(Into::into),
            status: JobStatus::Pending,
            result: None,
            prompt: None,
            resume_token: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn includes_north_star_and_context() {
        let p = render(
            &job(JobType::Implement, Some("add the --json flag")),
            &assignment("machine-readable output"),
        );
        assert!(p.starts_with("# Foreman job: implement\n"));
        assert!(p.contains("## North star\n\nmachine-readable output"));
        assert!(p.contains("## Context\n\nadd the --json flag"));
        assert!(!p.contains("Artifacts so far"));
        assert!(!p.contains("--after-current"));
    }

    #[test]
    fn pm_prompt_explains_follow_up_and_blocking() {
        let mut a = assignment("ship it");
        a.artifacts = "implement: done\n".into();
        a.decisions = "pm: add tests\n".into();
        let p = render(&job(JobType::Pm, None), &a);
        assert!(p.contains("foreman group append --after-current"));
        assert!(p.contains("BLOCKED: <reason>"));
        assert!(p.contains("## Artifacts so far\n\nimplement: done"));
        assert!(p.contains("## Decisions so far\n\npm: add tests"));
    }

    #[test]
    fn every_job_type_has_instructions() {
        for t in [
            JobType::Plan,
            JobType::Implement,
            JobType::Review,
            JobType::Uat,
            JobType::Verify,
            JobType::Research,
            JobType::Pm,
            JobType::Retrospect,
        ] {
            assert!(!role_instructions(t).is_empty());
            assert!(render(&job(t, None), &assignment("x")).ends_with('\n'));
        }
    }

    #[test]
    fn long_logs_keep_their_tail() {
        let mut a = assignment("x");
        a.artifacts = format!("{}END", "é".repeat(LOG_TAIL_CHARS));
        let p = render(&job(JobType::Review, None), &a);
        assert!(p.contains("END"));
        assert!(p.len() < a.artifacts.len() + 1024);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("héllo", 3), "llo");
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("short", 100), "short");
    }
}
