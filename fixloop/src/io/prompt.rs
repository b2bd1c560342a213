//! Fix prompt rendering.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::types::ExecutionResult;

const FIX_REQUEST_TEMPLATE: &str = include_str!("prompts/fix_request.md");

static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("fix_request", FIX_REQUEST_TEMPLATE)
        .expect("fix_request template should be valid");
    env
});

/// Everything the model needs to repair a failed attempt.
#[derive(Debug, Clone)]
pub struct FixContext<'a> {
    pub goal: &'a str,
    pub source: &'a str,
    pub result: &'a ExecutionResult,
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub next_timeout_secs: u64,
    pub history_path: Option<&'a str>,
}

pub fn render_fix_prompt(ctx: &FixContext<'_>) -> Result<String> {
    let template = ENV.get_template("fix_request")?;
    let result = ctx.result;
    let rendered = template.render(context! {
        goal => ctx.goal.trim(),
        language => result.language.as_str(),
        fence => result.language.as_str(),
        code => indent(ctx.source, "    "),
        stdout => result.stdout.trim_end(),
        stderr => result.stderr.trim_end(),
        exit_code => result.exit_code,
        duration_secs => format!("{:.2}", result.duration.as_secs_f64()),
        timed_out => result.timed_out,
        timeout_secs => ctx.timeout_secs,
        next_timeout_secs => ctx.next_timeout_secs,
        attempt => ctx.attempt,
        max_attempts => ctx.max_attempts,
        history_path => ctx.history_path,
    })?;
    Ok(rendered)
}

/// Prefix every line so the code never contains a bare fence.
fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
