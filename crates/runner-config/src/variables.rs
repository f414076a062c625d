//! Variable interpolation used for environment-variable substitution in
//! artifact glob paths and step/service/fingerprint-command environments.
//!
//! Supports variables like:
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Current branch name
//! - `${git.tag}` - Git tag (if applicable)
//! - `${git.ref}` - Git ref (branch or tag)
//! - `${git.message}` - Commit message (first line)
//! - `${git.author}` - Commit author name
//! - `${git.author_email}` - Commit author email
//! - `${git.committer}` - Commit committer name
//! - `${git.committer_email}` - Commit committer email
//! - `${build.id}` - Build ID
//! - `${build.ref}` - Build ref (branch or tag)
//! - `${job.id}` - Current job ID
//! - `${job.name}` - Current job name
//! - `${step.name}` - Current step name
//! - `${env.VAR_NAME}` - Environment variable
//! - `${secrets.SECRET_NAME}` - Secret value
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub build: BuildContext,
    pub job: JobContext,
    pub step: StepContext,
    pub env: HashMap<String, String>,
    /// Secrets; masking is the log scrubber's job, not this context's.
    pub secrets: HashMap<String, String>,
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
    pub ref_name: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub id: String,
    pub ref_name: String,
    pub repository: String,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub id: String,
    pub name: String,
    pub workflow: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub name: String,
}

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate git context by running git commands in a repo path.
    pub fn populate_git_from_repo(&mut self, repo_path: &str) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }
        if let Some(branch) = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
            if branch != "HEAD" {
                self.git.ref_name = branch.clone();
                self.git.branch = branch;
            }
        }
        if let Some(tag) = run_git(&["describe", "--tags", "--exact-match", "HEAD"]) {
            self.git.ref_name = tag.clone();
            self.git.tag = Some(tag);
        }
        if let Some(message) = run_git(&["log", "-1", "--format=%s"]) {
            self.git.message = message;
        }
        if let Some(author) = run_git(&["log", "-1", "--format=%an"]) {
            self.git.author = author;
        }
        if let Some(email) = run_git(&["log", "-1", "--format=%ae"]) {
            self.git.author_email = email;
        }
        if let Some(committer) = run_git(&["log", "-1", "--format=%cn"]) {
            self.git.committer = committer;
        }
        if let Some(email) = run_git(&["log", "-1", "--format=%ce"]) {
            self.git.committer_email = email;
        }
    }

    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),
            ["git", "message"] => Some(self.git.message.clone()),
            ["git", "author"] => Some(self.git.author.clone()),
            ["git", "author_email"] => Some(self.git.author_email.clone()),
            ["git", "committer"] => Some(self.git.committer.clone()),
            ["git", "committer_email"] => Some(self.git.committer_email.clone()),

            ["build", "id"] => Some(self.build.id.clone()),
            ["build", "ref"] => Some(self.build.ref_name.clone()),
            ["build", "repository"] => Some(self.build.repository.clone()),

            ["job", "id"] => Some(self.job.id.clone()),
            ["job", "name"] => Some(self.job.name.clone()),
            ["job", "workflow"] => Some(self.job.workflow.clone()),

            ["step", "name"] => Some(self.step.name.clone()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all `${...}` variables in a string; unknown names pass
    /// through unchanged rather than erroring.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}

/// Builder for creating a `VariableContext`.
#[derive(Default)]
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        if self.ctx.git.ref_name.is_empty() {
            self.ctx.git.ref_name = branch.clone();
        }
        self.ctx.git.branch = branch;
        self
    }

    pub fn with_build(mut self, id: impl Into<String>, ref_name: impl Into<String>) -> Self {
        self.ctx.build.id = id.into();
        self.ctx.build.ref_name = ref_name.into();
        self
    }

    pub fn with_job(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.ctx.job.id = id.into();
        self.ctx.job.name = name.into();
        self
    }

    pub fn with_step(mut self, name: impl Into<String>) -> Self {
        self.ctx.step.name = name.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890")
            .with_git_branch("main")
            .build();

        let result = ctx.interpolate("Commit ${git.sha} on ${git.branch}");
        assert_eq!(result, "Commit abc1234567890 on main");
    }

    #[test]
    fn short_sha() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890def")
            .build();
        assert_eq!(ctx.interpolate("${git.short_sha}"), "abc1234");
    }

    #[test]
    fn env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("MY_VAR", "hello")
            .with_env("ANOTHER", "world")
            .build();
        assert_eq!(ctx.interpolate("${env.MY_VAR} ${env.ANOTHER}!"), "hello world!");
    }

    #[test]
    fn secrets_resolve() {
        let ctx = VariableContextBuilder::new()
            .with_secret("API_KEY", "super-secret-key")
            .build();
        assert_eq!(ctx.interpolate("Key: ${secrets.API_KEY}"), "Key: super-secret-key");
    }

    #[test]
    fn unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("Unknown: ${unknown.var}"), "Unknown: ${unknown.var}");
    }

    #[test]
    fn job_and_step_context() {
        let ctx = VariableContextBuilder::new()
            .with_build("build-123", "refs/heads/main")
            .with_job("job-456", "test")
            .with_step("compile")
            .build();

        let result = ctx.interpolate("Build ${build.id} job ${job.name} step ${step.name}");
        assert_eq!(result, "Build build-123 job test step compile");
    }

    #[test]
    fn interpolate_vec() {
        let ctx = VariableContextBuilder::new().with_git_branch("develop").build();
        let inputs = vec!["echo ${git.branch}".to_string(), "deploy to ${git.branch}".to_string()];
        let results = ctx.interpolate_vec(&inputs);
        assert_eq!(results[0], "echo develop");
        assert_eq!(results[1], "deploy to develop");
    }

    #[test]
    fn custom_variables() {
        let mut ctx = VariableContext::new();
        ctx.set("version", "1.2.3");
        ctx.set("app_name", "myapp");
        assert_eq!(ctx.interpolate("${app_name} v${version}"), "myapp v1.2.3");
    }

    #[test]
    fn nested_braces_in_json() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();
        let result = ctx.interpolate(r#"{"sha": "${git.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
