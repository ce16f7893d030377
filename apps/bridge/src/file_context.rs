//! File-context expansion: `[BRIDGE_FILES]` block parsing, path validation,
//! and `[FILE_CONTEXT]` section assembly.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use chatgpt_driver::{BridgeError, BridgeErrorKind};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::FileContextConfig;

pub const BLOCK_OPEN: &str = "[BRIDGE_FILES]";
pub const BLOCK_CLOSE: &str = "[/BRIDGE_FILES]";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRef {
    pub path: String,
    pub label: Option<String>,
}

/// Counters embedded verbatim in audit events.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileContextDiagnostics {
    pub blocks_detected: u32,
    pub last_block_terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<&'static str>,
    pub entries_parsed: u32,
    pub duplicates_removed: u32,
    pub files_attached: u32,
    pub total_chars: usize,
}

#[derive(Debug, Error)]
pub enum FileContextError {
    #[error("invalid bridge_files entry: {0}")]
    InvalidEntry(String),
    #[error("file path must be absolute: {0}")]
    RelativePath(String),
    #[error("too many files requested ({count} > {limit})")]
    TooManyFiles { count: usize, limit: usize },
    #[error("file is outside the allowed roots: {0}")]
    OutsideRoots(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file access denied: {0}")]
    AccessDenied(String),
    #[error("unsupported file content: {0}")]
    Unsupported(String),
    #[error("file exceeds per-file char cap ({chars} > {limit}): {path}")]
    FileTooLarge {
        path: String,
        chars: usize,
        limit: usize,
    },
    #[error("file context exceeds total char cap ({chars} > {limit})")]
    TotalTooLarge { chars: usize, limit: usize },
}

impl FileContextError {
    #[must_use]
    pub fn into_bridge_error(self) -> BridgeError {
        let kind = match &self {
            Self::InvalidEntry(_)
            | Self::RelativePath(_)
            | Self::TooManyFiles { .. }
            | Self::FileTooLarge { .. }
            | Self::TotalTooLarge { .. } => BridgeErrorKind::FileContextInvalid,
            Self::Unsupported(_) => BridgeErrorKind::FileContextUnsupported,
            Self::OutsideRoots(_) | Self::AccessDenied(_) => {
                BridgeErrorKind::FileContextAccessDenied
            }
            Self::NotFound(_) => BridgeErrorKind::FileContextNotFound,
        };
        BridgeError::new(kind, self.to_string())
    }
}

/// Splits a trailing `[BRIDGE_FILES]` block off the prompt.
///
/// Only a block followed by nothing but whitespace is consumed; earlier
/// blocks are left in place and only counted. Returns the remaining prompt
/// and the terminal block body, if any.
pub fn split_trailing_block(
    prompt: &str,
    diagnostics: &mut FileContextDiagnostics,
) -> (String, Option<String>) {
    let mut search_from = 0;
    let mut last: Option<(usize, usize)> = None;
    while let Some(open_rel) = prompt[search_from..].find(BLOCK_OPEN) {
        let open = search_from + open_rel;
        let Some(close_rel) = prompt[open..].find(BLOCK_CLOSE) else {
            break;
        };
        let close_end = open + close_rel + BLOCK_CLOSE.len();
        diagnostics.blocks_detected += 1;
        last = Some((open, close_end));
        search_from = close_end;
    }

    let Some((open, close_end)) = last else {
        return (prompt.to_string(), None);
    };
    if !prompt[close_end..].trim().is_empty() {
        return (prompt.to_string(), None);
    }

    diagnostics.last_block_terminal = true;
    let body = prompt[open + BLOCK_OPEN.len()..close_end - BLOCK_CLOSE.len()].to_string();
    let remaining = prompt[..open].trim_end().to_string();
    (remaining, Some(body))
}

/// Parses a block body: a JSON array of strings / `{path, label}` objects,
/// or `path|label` lines.
pub fn parse_block(
    body: &str,
    diagnostics: &mut FileContextDiagnostics,
) -> Result<Vec<FileRef>, FileContextError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        diagnostics.parse_mode = Some("lines");
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let parsed: Value = serde_json::from_str(trimmed)
            .map_err(|err| FileContextError::InvalidEntry(format!("bad JSON block: {err}")))?;
        let Value::Array(items) = parsed else {
            return Err(FileContextError::InvalidEntry(
                "JSON block must be an array".to_string(),
            ));
        };
        diagnostics.parse_mode = Some("json");
        let mut refs = Vec::with_capacity(items.len());
        for item in items {
            let file_ref = match item {
                Value::String(path) => FileRef { path, label: None },
                Value::Object(map) => {
                    let path = map
                        .get("path")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            FileContextError::InvalidEntry(
                                "entry object is missing \"path\"".to_string(),
                            )
                        })?
                        .to_string();
                    let label = map
                        .get("label")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    FileRef { path, label }
                }
                other => {
                    return Err(FileContextError::InvalidEntry(format!(
                        "unsupported entry: {other}"
                    )));
                }
            };
            refs.push(file_ref);
        }
        diagnostics.entries_parsed += refs.len() as u32;
        return Ok(refs);
    }

    diagnostics.parse_mode = Some("lines");
    let mut refs = Vec::new();
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (path, label) = match line.split_once('|') {
            Some((path, label)) => (path.trim(), Some(label.trim().to_string())),
            None => (line, None),
        };
        refs.push(FileRef {
            path: path.to_string(),
            label: label.filter(|l| !l.is_empty()),
        });
    }
    diagnostics.entries_parsed += refs.len() as u32;
    Ok(refs)
}

struct ResolvedFile {
    label: String,
    display_path: String,
    content: String,
}

/// Resolves, validates and reads the requested files, producing the
/// `[FILE_CONTEXT]` section to append to the prompt. Duplicate canonical
/// paths are dropped silently.
pub fn expand(
    config: &FileContextConfig,
    refs: &[FileRef],
    diagnostics: &mut FileContextDiagnostics,
) -> Result<Option<String>, FileContextError> {
    if refs.is_empty() {
        return Ok(None);
    }
    if refs.len() > config.max_files {
        return Err(FileContextError::TooManyFiles {
            count: refs.len(),
            limit: config.max_files,
        });
    }

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut resolved = Vec::new();
    let mut total_chars = 0usize;

    for file_ref in refs {
        let requested = Path::new(&file_ref.path);
        if !requested.is_absolute() {
            return Err(FileContextError::RelativePath(file_ref.path.clone()));
        }
        let canonical = std::fs::canonicalize(requested)
            .map_err(|err| io_error(&file_ref.path, &err))?;

        if !config.allowed_roots.is_empty()
            && !config
                .allowed_roots
                .iter()
                .any(|root| canonical.starts_with(root))
        {
            return Err(FileContextError::OutsideRoots(file_ref.path.clone()));
        }

        let metadata = std::fs::metadata(&canonical)
            .map_err(|err| io_error(&file_ref.path, &err))?;
        if !metadata.is_file() {
            return Err(FileContextError::Unsupported(format!(
                "not a regular file: {}",
                file_ref.path
            )));
        }

        if !seen.insert(canonical.clone()) {
            diagnostics.duplicates_removed += 1;
            continue;
        }

        let bytes =
            std::fs::read(&canonical).map_err(|err| io_error(&file_ref.path, &err))?;
        if bytes.contains(&0) {
            return Err(FileContextError::Unsupported(format!(
                "file contains NUL bytes: {}",
                file_ref.path
            )));
        }
        let content = String::from_utf8(bytes).map_err(|_| {
            FileContextError::Unsupported(format!("file is not UTF-8: {}", file_ref.path))
        })?;

        let chars = content.chars().count();
        if chars > config.max_file_chars {
            return Err(FileContextError::FileTooLarge {
                path: file_ref.path.clone(),
                chars,
                limit: config.max_file_chars,
            });
        }
        total_chars += chars;
        if total_chars > config.max_total_chars {
            return Err(FileContextError::TotalTooLarge {
                chars: total_chars,
                limit: config.max_total_chars,
            });
        }

        let label = file_ref
            .label
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| {
                canonical
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file_ref.path.clone())
            });
        resolved.push(ResolvedFile {
            label,
            display_path: canonical.to_string_lossy().into_owned(),
            content,
        });
    }

    if resolved.is_empty() {
        return Ok(None);
    }
    diagnostics.files_attached = resolved.len() as u32;
    diagnostics.total_chars = total_chars;

    let mut section = String::from("[FILE_CONTEXT]\n");
    for file in &resolved {
        section.push_str(&format!(
            "--- BEGIN FILE: {label} ---\npath: {path}\n{content}\n--- END FILE: {label} ---\n",
            label = file.label,
            path = file.display_path,
            content = file.content.trim_end_matches('\n'),
        ));
    }
    section.push_str("[/FILE_CONTEXT]");
    Ok(Some(section))
}

fn io_error(path: &str, err: &io::Error) -> FileContextError {
    match err.kind() {
        io::ErrorKind::NotFound => FileContextError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => FileContextError::AccessDenied(path.to_string()),
        _ => FileContextError::Unsupported(format!("{path}: {err}")),
    }
}
