//! `fetch` and `search`: network tools behind a domain allowlist.
//!
//! The runtime never opens sockets itself. Requests go to injected
//! [`Fetcher`]/[`WebSearch`] implementations; the command-backed ones hand the
//! request JSON to a configured helper program on stdin.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use super::{ToolContext, ToolOutcome, execution_error, invalid};
use crate::core::tool_args::{FetchArgs, SearchArgs};
use crate::core::types::{ErrorCode, ToolResult};
use crate::io::process::run_command_with_timeout;

const DEFAULT_SEARCH_RESULTS: usize = 5;

/// HTTP request handed to a [`Fetcher`]. Headers may carry resolved credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Web search handed to a [`WebSearch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Domains results must come from; empty means unrestricted.
    #[serde(default)]
    pub domains: Vec<String>,
    pub max_results: usize,
}

pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<String>;
}

pub trait WebSearch: Send + Sync {
    fn search(&self, request: &SearchRequest) -> Result<String>;
}

/// Exact or subdomain match of `host` against the allowlist.
pub fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    let host = normalize_domain(host);
    allowed.iter().any(|entry| {
        let entry = normalize_domain(entry.trim_start_matches("*."));
        !entry.is_empty() && (host == entry || host.ends_with(&format!(".{entry}")))
    })
}

fn normalize_domain(domain: &str) -> String {
    domain
        .trim()
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn domain_denied(domain: &str, allowed: &[String]) -> ToolResult {
    let listed = if allowed.is_empty() {
        "none".to_string()
    } else {
        allowed.join(", ")
    };
    ToolResult::error(
        ErrorCode::PermissionDenied,
        format!(
            "domain '{domain}' is not in this run's allowlist (allowed: {listed}). \
             Do not retry; ask the user via ask_user to grant access to this domain."
        ),
        false,
    )
}

pub(super) fn fetch(args: &FetchArgs, ctx: &ToolContext) -> ToolOutcome {
    let url = Url::parse(&args.url)
        .map_err(|err| invalid(format!("invalid url '{}': {err}", args.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!(
            "unsupported url scheme '{}'; only http and https are allowed",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| invalid(format!("url '{}' has no host", args.url)))?;
    if let Some(allowed) = &ctx.allowed_domains
        && !domain_allowed(host, allowed)
    {
        return Err(domain_denied(host, allowed));
    }
    let fetcher = ctx.fetcher.as_ref().ok_or_else(|| {
        ToolResult::error(
            ErrorCode::ToolNotAvailable,
            "fetch is not configured on this host",
            false,
        )
    })?;

    let request = FetchRequest {
        url: url.to_string(),
        method: args
            .method
            .clone()
            .unwrap_or_else(|| "GET".to_string())
            .to_ascii_uppercase(),
        headers: args.headers.clone(),
        body: args.body.clone(),
    };
    fetcher
        .fetch(&request)
        .map_err(|err| execution_error(format!("fetch {host} failed: {err:#}"), true))
}

pub(super) fn search(args: &SearchArgs, ctx: &ToolContext) -> ToolOutcome {
    let domains = match (&args.domain, &ctx.allowed_domains) {
        (Some(domain), Some(allowed)) if !domain_allowed(domain, allowed) => {
            return Err(domain_denied(domain, allowed));
        }
        (Some(domain), _) => vec![normalize_domain(domain)],
        (None, Some(allowed)) if allowed.is_empty() => {
            return Err(ToolResult::error(
                ErrorCode::PermissionDenied,
                "this run is not allowed to reach any domain. \
                 Do not retry; ask the user via ask_user to grant access to a domain.",
                false,
            ));
        }
        (None, Some(allowed)) => allowed.clone(),
        (None, None) => Vec::new(),
    };
    let searcher = ctx.searcher.as_ref().ok_or_else(|| {
        ToolResult::error(
            ErrorCode::ToolNotAvailable,
            "search is not configured on this host",
            false,
        )
    })?;

    let request = SearchRequest {
        query: args.query.clone(),
        domains,
        max_results: args.max_results.unwrap_or(DEFAULT_SEARCH_RESULTS),
    };
    searcher
        .search(&request)
        .map_err(|err| execution_error(format!("search failed: {err:#}"), true))
}

/// Runs a helper program per request: request JSON on stdin, result on stdout.
#[derive(Debug, Clone)]
struct HelperCommand {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl HelperCommand {
    #[instrument(skip_all, fields(program = %self.argv.first().map(String::as_str).unwrap_or("")))]
    fn call<T: Serialize>(&self, request: &T) -> Result<String> {
        let (program, rest) = self
            .argv
            .split_first()
            .context("helper command is empty")?;
        let payload = serde_json::to_vec(request).context("serialize helper request")?;
        let mut cmd = std::process::Command::new(program);
        cmd.args(rest);
        let out =
            run_command_with_timeout(cmd, Some(&payload), self.timeout, self.output_limit_bytes)
                .with_context(|| format!("run {program}"))?;
        if out.timed_out {
            bail!("{program} timed out after {}s", self.timeout.as_secs());
        }
        if !out.status.success() {
            bail!(
                "{program} exited with {:?}: {}",
                out.status.code(),
                out.stderr_text().trim()
            );
        }
        debug!(
            bytes = out.stdout.len(),
            truncated = out.stdout_truncated,
            "helper command finished"
        );
        Ok(out.stdout_with_notice())
    }
}

/// [`Fetcher`] backed by a helper program.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    helper: HelperCommand,
}

impl CommandFetcher {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            helper: HelperCommand {
                argv,
                timeout,
                output_limit_bytes,
            },
        }
    }
}

impl Fetcher for CommandFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<String> {
        self.helper.call(request)
    }
}

/// [`WebSearch`] backed by a helper program.
#[derive(Debug, Clone)]
pub struct CommandSearch {
    helper: HelperCommand,
}

impl CommandSearch {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            helper: HelperCommand {
                argv,
                timeout,
                output_limit_bytes,
            },
        }
    }
}

impl WebSearch for CommandSearch {
    fn search(&self, request: &SearchRequest) -> Result<String> {
        self.helper.call(request)
    }
}
