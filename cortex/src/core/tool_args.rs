//! Tool catalogue and typed tool arguments.
//!
//! The model sends loosely typed JSON arguments. They are validated against the
//! tool's JSON Schema and deserialized into one typed struct per tool at the
//! boundary, so execution code never handles untyped maps.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Every tool the runtime knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolName {
    Code,
    ReadFile,
    WriteFile,
    ListDir,
    Grep,
    Patch,
    Shell,
    Fetch,
    Search,
    AskUser,
    RequestApproval,
}

impl ToolName {
    pub const ALL: [ToolName; 11] = [
        ToolName::Code,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::ListDir,
        ToolName::Grep,
        ToolName::Patch,
        ToolName::Shell,
        ToolName::Fetch,
        ToolName::Search,
        ToolName::AskUser,
        ToolName::RequestApproval,
    ];

    pub const SYNTHETIC: [ToolName; 2] = [ToolName::AskUser, ToolName::RequestApproval];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::Code => "code",
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::ListDir => "list_dir",
            ToolName::Grep => "grep",
            ToolName::Patch => "patch",
            ToolName::Shell => "shell",
            ToolName::Fetch => "fetch",
            ToolName::Search => "search",
            ToolName::AskUser => "ask_user",
            ToolName::RequestApproval => "request_approval",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    /// Pause-inducing pseudo-tools handled by the loop, always available.
    pub fn is_synthetic(self) -> bool {
        Self::SYNTHETIC.contains(&self)
    }

    /// Tools whose output originates outside the host.
    pub fn uses_network(self) -> bool {
        matches!(self, ToolName::Fetch | ToolName::Search)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolName::Code => {
                "Execute a snippet of code (python, javascript or bash) inside the workspace and return its output."
            }
            ToolName::ReadFile => {
                "Read a text file from the workspace or skills directory. Optional 1-based line offset and line limit."
            }
            ToolName::WriteFile => {
                "Create or overwrite a file in the workspace. Parent directories are created."
            }
            ToolName::ListDir => {
                "List entries of a directory in the workspace or skills directory."
            }
            ToolName::Grep => "Search files for a regular expression and return matching lines.",
            ToolName::Patch => {
                "Replace text in a file. old_text must match exactly once; include surrounding lines to disambiguate."
            }
            ToolName::Shell => "Run a shell command in the workspace.",
            ToolName::Fetch => "Fetch a URL over HTTP(S). Only allowed domains are reachable.",
            ToolName::Search => "Search the web and return result titles, URLs and snippets.",
            ToolName::AskUser => {
                "Ask the human a question and pause until they answer. Use it for missing information, credentials or domain access."
            }
            ToolName::RequestApproval => {
                "Ask the human to approve a sensitive action before performing it, and pause until they decide."
            }
        }
    }

    /// JSON Schema for the tool's arguments.
    pub fn parameters(self) -> Value {
        match self {
            ToolName::Code => json!({
                "type": "object",
                "properties": {
                    "language": {"type": "string", "enum": ["python", "javascript", "bash"]},
                    "code": {"type": "string", "minLength": 1}
                },
                "required": ["language", "code"]
            }),
            ToolName::ReadFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "minLength": 1},
                    "offset": {"type": "integer", "minimum": 1},
                    "limit": {"type": "integer", "minimum": 1}
                },
                "required": ["path"]
            }),
            ToolName::WriteFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "minLength": 1},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
            ToolName::ListDir => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "recursive": {"type": "boolean"}
                }
            }),
            ToolName::Grep => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "minLength": 1},
                    "path": {"type": "string"},
                    "max_results": {"type": "integer", "minimum": 1}
                },
                "required": ["pattern"]
            }),
            ToolName::Patch => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "minLength": 1},
                    "old_text": {"type": "string", "minLength": 1},
                    "new_text": {"type": "string"}
                },
                "required": ["path", "old_text", "new_text"]
            }),
            ToolName::Shell => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "minLength": 1}
                },
                "required": ["command"]
            }),
            ToolName::Fetch => json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "minLength": 1},
                    "method": {
                        "type": "string",
                        "enum": ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"]
                    },
                    "headers": {"type": "object", "additionalProperties": {"type": "string"}},
                    "body": {"type": "string"}
                },
                "required": ["url"]
            }),
            ToolName::Search => json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "minLength": 1},
                    "domain": {"type": "string"},
                    "max_results": {"type": "integer", "minimum": 1}
                },
                "required": ["query"]
            }),
            ToolName::AskUser => json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string", "minLength": 1}
                },
                "required": ["question"]
            }),
            ToolName::RequestApproval => json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "minLength": 1},
                    "reason": {"type": "string"}
                },
                "required": ["action"]
            }),
        }
    }

    pub fn schema(self) -> ToolSchema {
        ToolSchema {
            name: self.as_str().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool description offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Schemas for the granted tools plus the synthetic tools, in catalogue order.
///
/// Unknown grant names are ignored here; the loop rejects calls to them.
pub fn schemas_for<'a>(granted: impl IntoIterator<Item = &'a str>) -> Vec<ToolSchema> {
    let granted: Vec<ToolName> = granted.into_iter().filter_map(ToolName::parse).collect();
    ToolName::ALL
        .into_iter()
        .filter(|tool| tool.is_synthetic() || granted.contains(tool))
        .map(ToolName::schema)
        .collect()
}

static VALIDATORS: LazyLock<HashMap<ToolName, Validator>> = LazyLock::new(|| {
    ToolName::ALL
        .into_iter()
        .map(|tool| {
            let validator = jsonschema::validator_for(&tool.parameters())
                .expect("built-in tool schema should compile");
            (tool, validator)
        })
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Python,
    Javascript,
    Bash,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodeArgs {
    pub language: CodeLanguage,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadFileArgs {
    pub path: String,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListDirArgs {
    pub path: Option<String>,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GrepArgs {
    pub pattern: String,
    pub path: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PatchArgs {
    pub path: String,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShellArgs {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FetchArgs {
    pub url: String,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchArgs {
    pub query: String,
    pub domain: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AskUserArgs {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestApprovalArgs {
    pub action: String,
    pub reason: Option<String>,
}

/// Validated arguments, tagged by tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolArgs {
    Code(CodeArgs),
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    ListDir(ListDirArgs),
    Grep(GrepArgs),
    Patch(PatchArgs),
    Shell(ShellArgs),
    Fetch(FetchArgs),
    Search(SearchArgs),
    AskUser(AskUserArgs),
    RequestApproval(RequestApprovalArgs),
}

/// Why arguments were rejected before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    UnknownTool(String),
    Invalid { tool: ToolName, errors: Vec<String> },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::UnknownTool(name) => write!(f, "unknown tool '{name}'"),
            ArgsError::Invalid { tool, errors } => {
                write!(f, "invalid arguments for {tool}: {}", errors.join("; "))
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl ToolArgs {
    /// Validate `args` against the schema of `name` and deserialize them.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ArgsError> {
        let tool = ToolName::parse(name).ok_or_else(|| ArgsError::UnknownTool(name.to_string()))?;
        Self::parse_for(tool, args)
    }

    pub fn parse_for(tool: ToolName, args: &Value) -> Result<Self, ArgsError> {
        let empty = Value::Object(Default::default());
        let args = if args.is_null() { &empty } else { args };

        if let Some(validator) = VALIDATORS.get(&tool) {
            let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
            if !errors.is_empty() {
                return Err(ArgsError::Invalid { tool, errors });
            }
        }

        Ok(match tool {
            ToolName::Code => ToolArgs::Code(decode(tool, args)?),
            ToolName::ReadFile => ToolArgs::ReadFile(decode(tool, args)?),
            ToolName::WriteFile => ToolArgs::WriteFile(decode(tool, args)?),
            ToolName::ListDir => ToolArgs::ListDir(decode(tool, args)?),
            ToolName::Grep => ToolArgs::Grep(decode(tool, args)?),
            ToolName::Patch => ToolArgs::Patch(decode(tool, args)?),
            ToolName::Shell => ToolArgs::Shell(decode(tool, args)?),
            ToolName::Fetch => ToolArgs::Fetch(decode(tool, args)?),
            ToolName::Search => ToolArgs::Search(decode(tool, args)?),
            ToolName::AskUser => ToolArgs::AskUser(decode(tool, args)?),
            ToolName::RequestApproval => ToolArgs::RequestApproval(decode(tool, args)?),
        })
    }

    pub fn tool(&self) -> ToolName {
        match self {
            ToolArgs::Code(_) => ToolName::Code,
            ToolArgs::ReadFile(_) => ToolName::ReadFile,
            ToolArgs::WriteFile(_) => ToolName::WriteFile,
            ToolArgs::ListDir(_) => ToolName::ListDir,
            ToolArgs::Grep(_) => ToolName::Grep,
            ToolArgs::Patch(_) => ToolName::Patch,
            ToolArgs::Shell(_) => ToolName::Shell,
            ToolArgs::Fetch(_) => ToolName::Fetch,
            ToolArgs::Search(_) => ToolName::Search,
            ToolArgs::AskUser(_) => ToolName::AskUser,
            ToolArgs::RequestApproval(_) => ToolName::RequestApproval,
        }
    }
}

fn decode<T: DeserializeOwned>(tool: ToolName, args: &Value) -> Result<T, ArgsError> {
    serde_json::from_value(args.clone()).map_err(|err| ArgsError::Invalid {
        tool,
        errors: vec![err.to_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::parse("rm_rf"), None);
    }

    #[test]
    fn schemas_include_synthetic_tools_and_grants_only() {
        let names: Vec<String> = schemas_for(["read_file", "bogus"])
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["read_file", "ask_user", "request_approval"]);
    }

    #[test]
    fn parses_typed_arguments() {
        let args = ToolArgs::parse(
            "patch",
            &json!({"path": "a.txt", "old_text": "x", "new_text": "y"}),
        )
        .expect("parse");
        assert_eq!(
            args,
            ToolArgs::Patch(PatchArgs {
                path: "a.txt".to_string(),
                old_text: "x".to_string(),
                new_text: "y".to_string(),
            })
        );
    }

    #[test]
    fn missing_required_argument_is_invalid() {
        let err = ToolArgs::parse("write_file", &json!({"path": "a.txt"})).unwrap_err();
        match err {
            ArgsError::Invalid { tool, errors } => {
                assert_eq!(tool, ToolName::WriteFile);
                assert!(errors.iter().any(|e| e.contains("content")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn null_arguments_are_treated_as_empty_object() {
        let args = ToolArgs::parse("list_dir", &Value::Null).expect("parse");
        assert_eq!(
            args,
            ToolArgs::ListDir(ListDirArgs {
                path: None,
                recursive: false
            })
        );
        assert!(ToolArgs::parse("ask_user", &Value::Null).is_err());
    }

    #[test]
    fn wrong_types_are_rejected() {
        assert!(ToolArgs::parse("code", &json!({"language": "cobol", "code": "x"})).is_err());
        assert!(ToolArgs::parse("read_file", &json!({"path": 3})).is_err());
    }

    #[test]
    fn unknown_tool_is_reported() {
        assert_eq!(
            ToolArgs::parse("teleport", &json!({})).unwrap_err(),
            ArgsError::UnknownTool("teleport".to_string())
        );
    }
}
