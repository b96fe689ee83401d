//! Filesystem tools. Every path goes through the session's workspace.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use codeagent_core::{Workspace, WorkspaceError};
use codeagent_core::config::ToolsConfig;

use crate::tools::registry::{ToolContext, ToolError, ToolHandler, ToolOutput, parse_args};

const DEFAULT_READ_LIMIT: usize = 2000;

fn resolve(workspace: &Workspace, path: &str) -> Result<PathBuf, ToolError> {
    workspace.resolve(path).map_err(|e| match e {
        WorkspaceError::PathEscapesWorkspace(_) => ToolError::PathEscapesWorkspace(e.to_string()),
        WorkspaceError::Io(_) => ToolError::Failed(e.to_string()),
    })
}

fn io_failure(path: &str, e: &std::io::Error) -> ToolError {
    ToolError::Failed(format!("{path}: {e}"))
}

/// Write a file via a temp file in the same directory and a rename.
async fn write_atomic(path: PathBuf, content: String) -> Result<(), ToolError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| ToolError::Failed(format!("write task failed: {e}")))?
    .map_err(|e| ToolError::Failed(e.to_string()))
}

// =============================================================================
// list_dir
// =============================================================================

#[derive(Deserialize)]
struct ListDirArgs {
    #[serde(default)]
    path: Option<String>,
}

/// List directory entries; directories carry a trailing `/`.
pub struct ListDir;

#[async_trait]
impl ToolHandler for ListDir {
    async fn call(
        &self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let args: ListDirArgs = parse_args(args)?;
        let rel = args.path.unwrap_or_else(|| ".".to_string());
        let dir = resolve(&ctx.workspace, &rel)?;

        let mut read = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_failure(&rel, &e))?;
        let mut entries = Vec::new();
        while let Some(entry) = read.next_entry().await.map_err(|e| io_failure(&rel, &e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        if entries.is_empty() {
            return Ok(ToolOutput::text(format!("{rel} is empty")));
        }
        Ok(ToolOutput::text(entries.join("\n")))
    }
}

// =============================================================================
// read_file
// =============================================================================

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
    /// Lines to skip from the start.
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

/// Read a text file with line numbers.
pub struct ReadFile {
    max_bytes: u64,
}

impl ReadFile {
    pub const fn new(config: &ToolsConfig) -> Self {
        Self {
            max_bytes: config.max_read_bytes,
        }
    }
}

#[async_trait]
impl ToolHandler for ReadFile {
    async fn call(
        &self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let args: ReadFileArgs = parse_args(args)?;
        if args.limit == Some(0) {
            return Err(ToolError::InvalidArguments("limit must be positive".into()));
        }
        let path = resolve(&ctx.workspace, &args.path)?;

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_failure(&args.path, &e))?;
        if meta.len() > self.max_bytes {
            return Err(ToolError::Failed(format!(
                "{} is {} bytes, larger than the {} byte read limit",
                args.path,
                meta.len(),
                self.max_bytes
            )));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure(&args.path, &e))?;

        let limit = args.limit.unwrap_or(DEFAULT_READ_LIMIT);
        let mut out = String::new();
        for (i, line) in content.lines().enumerate().skip(args.offset).take(limit) {
            let _ = writeln!(out, "{:>6}\t{line}", i + 1);
        }
        if out.is_empty() {
            out = format!("{} has no lines in the requested range", args.path);
        }
        Ok(ToolOutput::text(out))
    }
}

// =============================================================================
// grep
// =============================================================================

#[derive(Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

/// Regex search across workspace files. Hidden entries are skipped.
pub struct Grep {
    max_matches: usize,
}

impl Grep {
    pub const fn new(config: &ToolsConfig) -> Self {
        Self {
            max_matches: config.max_grep_matches,
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

#[async_trait]
impl ToolHandler for Grep {
    async fn call(
        &self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let args: GrepArgs = parse_args(args)?;
        let regex = Regex::new(&args.pattern)
            .map_err(|e| ToolError::InvalidArguments(format!("invalid pattern: {e}")))?;
        let rel = args.path.unwrap_or_else(|| ".".to_string());
        let start = resolve(&ctx.workspace, &rel)?;
        let workspace = ctx.workspace.clone();
        let max_matches = self.max_matches;

        tokio::task::spawn_blocking(move || -> Result<ToolOutput, ToolError> {
            let mut files = Vec::new();
            if start.is_file() {
                files.push(start);
            } else {
                collect_files(&start, &mut files).map_err(|e| io_failure(&rel, &e))?;
            }

            let mut matches = Vec::new();
            'files: for file in files {
                // Binary and non-UTF-8 files are skipped.
                let Ok(content) = std::fs::read_to_string(&file) else {
                    continue;
                };
                for (i, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        matches.push(format!("{}:{}:{line}", workspace.relative(&file), i + 1));
                        if matches.len() >= max_matches {
                            break 'files;
                        }
                    }
                }
            }

            if matches.is_empty() {
                return Ok(ToolOutput::text("No matches found"));
            }
            let truncated = matches.len() >= max_matches;
            let mut out = matches.join("\n");
            if truncated {
                let _ = write!(out, "\n(results truncated at {max_matches} matches)");
            }
            Ok(ToolOutput::text(out))
        })
        .await
        .map_err(|e| ToolError::Failed(format!("search task failed: {e}")))?
    }
}

// =============================================================================
// write_file
// =============================================================================

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

/// Create or replace a file atomically.
pub struct WriteFile;

#[async_trait]
impl ToolHandler for WriteFile {
    async fn call(
        &self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let args: WriteFileArgs = parse_args(args)?;
        let path = resolve(&ctx.workspace, &args.path)?;
        if path.is_dir() {
            return Err(ToolError::Failed(format!("{} is a directory", args.path)));
        }
        let bytes = args.content.len();
        write_atomic(path.clone(), args.content).await?;

        Ok(ToolOutput {
            output: format!("Wrote {bytes} bytes to {}", ctx.workspace.relative(&path)),
            files_touched: vec![path],
        })
    }
}

// =============================================================================
// edit_file
// =============================================================================

#[derive(Deserialize)]
struct EditFileArgs {
    path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

/// Replace text in a file. `old_string` must be unique unless `replace_all`.
pub struct EditFile;

#[async_trait]
impl ToolHandler for EditFile {
    async fn call(
        &self,
        ctx: &ToolContext,
        args: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let args: EditFileArgs = parse_args(args)?;
        if args.old_string.is_empty() {
            return Err(ToolError::InvalidArguments("old_string must not be empty".into()));
        }
        if args.old_string == args.new_string {
            return Err(ToolError::InvalidArguments(
                "old_string and new_string are identical".into(),
            ));
        }
        let path = resolve(&ctx.workspace, &args.path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure(&args.path, &e))?;

        let count = content.matches(&args.old_string).count();
        if count == 0 {
            return Err(ToolError::Failed(format!(
                "old_string not found in {}",
                args.path
            )));
        }
        if count > 1 && !args.replace_all {
            return Err(ToolError::Failed(format!(
                "old_string occurs {count} times in {}; pass replace_all or add context",
                args.path
            )));
        }

        let updated = if args.replace_all {
            content.replace(&args.old_string, &args.new_string)
        } else {
            content.replacen(&args.old_string, &args.new_string, 1)
        };
        write_atomic(path.clone(), updated).await?;

        Ok(ToolOutput {
            output: format!(
                "Replaced {count} occurrence(s) in {}",
                ctx.workspace.relative(&path)
            ),
            files_touched: vec![path],
        })
    }
}
