//! Built-in step handlers for the git ingestion pipeline.
//!
//! `git.list_commits` fans out one `git.commit_meta` step per commit, so a
//! crashed run resumes from whichever commits still have pending steps.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use stepledger_core::errors::{HandlerError, RegistryError};
use stepledger_core::{HandlerRegistry, StepContext, StepHandler};
use tokio::process::Command;

pub const LIST_COMMITS: &str = "git.list_commits";
pub const COMMIT_META: &str = "git.commit_meta";
pub const SHELL_EXEC: &str = "shell.exec";
pub const NOOP: &str = "noop";

const DEFAULT_COMMIT_LIMIT: u32 = 1_000;
const HEARTBEAT_EVERY: usize = 100;
const COMMIT_META_FORMAT: &str = "--format=%H%x00%an%x00%ae%x00%at%x00%s";

pub fn register_builtin(registry: &mut HandlerRegistry) -> Result<(), RegistryError> {
    registry.register(LIST_COMMITS, Arc::new(ListCommits))?;
    registry.register(COMMIT_META, Arc::new(CommitMeta))?;
    registry.register(SHELL_EXEC, Arc::new(ShellExec))?;
    registry.register_fn(NOOP, |input: Value, _ctx: StepContext| async move { Ok(input) })?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ListCommitsInput {
    repo: String,
    #[serde(default)]
    rev: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

struct ListCommits;

#[async_trait]
impl StepHandler for ListCommits {
    async fn run(&self, input: Value, ctx: StepContext) -> Result<Value, HandlerError> {
        let input: ListCommitsInput = serde_json::from_value(input)?;
        let rev = input.rev.as_deref().unwrap_or("HEAD");
        let limit = input.limit.unwrap_or(DEFAULT_COMMIT_LIMIT);

        let stdout = run_git(
            &input.repo,
            &["rev-list".to_string(), format!("--max-count={limit}"), rev.to_string()],
        )
        .await?;

        let commits: Vec<&str> =
            stdout.lines().map(str::trim).filter(|line| !line.is_empty()).collect();
        ctx.log(&format!("listing {} commits from {}", commits.len(), input.repo));

        for (n, commit) in commits.iter().enumerate() {
            ctx.spawn(COMMIT_META, json!({ "repo": input.repo, "commit": commit })).await?;
            if (n + 1) % HEARTBEAT_EVERY == 0 {
                ctx.heartbeat().await?;
            }
        }

        Ok(json!({ "commits": commits.len() }))
    }
}

#[derive(Debug, Deserialize)]
struct CommitMetaInput {
    repo: String,
    commit: String,
}

struct CommitMeta;

#[async_trait]
impl StepHandler for CommitMeta {
    async fn run(&self, input: Value, _ctx: StepContext) -> Result<Value, HandlerError> {
        let input: CommitMetaInput = serde_json::from_value(input)?;
        let stdout = run_git(
            &input.repo,
            &["show".to_string(), "-s".to_string(), COMMIT_META_FORMAT.to_string(), input.commit],
        )
        .await?;
        parse_commit_meta(&stdout)
    }
}

/// Parse one `%H%x00%an%x00%ae%x00%at%x00%s` line.
fn parse_commit_meta(line: &str) -> Result<Value, HandlerError> {
    let line = line.trim_end_matches('\n');
    let fields: Vec<&str> = line.split('\0').collect();
    let [commit, author_name, author_email, authored_at, subject] = fields.as_slice() else {
        return Err(HandlerError::new(format!(
            "unexpected git show output: {} field(s)",
            fields.len()
        )));
    };

    let seconds: i64 = authored_at
        .trim()
        .parse()
        .map_err(|_| HandlerError::new(format!("invalid author timestamp `{authored_at}`")))?;
    let authored_at = DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| HandlerError::new(format!("author timestamp out of range: {seconds}")))?;

    Ok(json!({
        "commit": commit,
        "author_name": author_name,
        "author_email": author_email,
        "authored_at": authored_at.to_rfc3339(),
        "subject": subject,
    }))
}

async fn run_git(repo: &str, args: &[String]) -> Result<String, HandlerError> {
    let output = Command::new("git").arg("-C").arg(repo).args(args).output().await?;
    if !output.status.success() {
        return Err(HandlerError::new(format!(
            "git {} failed ({}): {}",
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|error| HandlerError::new(format!("git output is not utf-8: {error}")))
}

#[derive(Debug, Deserialize)]
struct ShellExecInput {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

struct ShellExec;

#[async_trait]
impl StepHandler for ShellExec {
    async fn run(&self, input: Value, ctx: StepContext) -> Result<Value, HandlerError> {
        let input: ShellExecInput = serde_json::from_value(input)?;
        ctx.log(&format!("exec {} {:?}", input.program, input.args));

        let output = Command::new(&input.program).args(&input.args).output().await?;
        let status = output.status.code();
        if !output.status.success() {
            return Err(HandlerError::new(format!(
                "{} exited with {}: {}",
                input.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(json!({
            "status": status,
            "stdout": String::from_utf8_lossy(&output.stdout),
        }))
    }
}
