//! Env file discovery and parsing

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

/// Conventional name of the env file looked up during discovery
pub const FILENAME: &str = ".env.mcp";

/// Variables read from an env file, keyed by name
pub type EnvMap = HashMap<String, String>;

/// Errors that can occur while resolving an env file
#[derive(Error, Debug)]
pub enum EnvFileError {
    #[error("No .env.mcp file found in {} or its parents, nor in the home directory", .searched_from.display())]
    NotFound { searched_from: PathBuf },
    #[error("Unable to read env file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to read env file from stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("Unknown working directory: {0}")]
    UnknownWorkingDirectory(#[source] std::io::Error),
}

/// Where the caller wants the env file to come from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SourceRequest {
    /// Walk up from the working directory, then try the home directory
    #[default]
    Discover,
    Path(PathBuf),
    Stdin,
}

/// Where the env file was actually read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    ExplicitPath(PathBuf),
    Discovered(PathBuf),
    Stdin,
    NotFound { searched_from: PathBuf },
}

impl ResolvedSource {
    /// Path backing this source, if it is file based.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResolvedSource::ExplicitPath(path) | ResolvedSource::Discovered(path) => Some(path),
            ResolvedSource::Stdin | ResolvedSource::NotFound { .. } => None,
        }
    }
}

impl fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSource::ExplicitPath(path) | ResolvedSource::Discovered(path) => {
                write!(f, "{}", path.display())
            }
            ResolvedSource::Stdin => f.write_str("stdin"),
            ResolvedSource::NotFound { searched_from } => {
                write!(f, "nothing found from {}", searched_from.display())
            }
        }
    }
}

/// Split a single line into a key/value assignment.
///
/// Returns `None` for blank lines, comments, lines without `=` and lines with an empty key.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, unquote(value.trim())))
}

/// Strip one outer pair of matching double or single quotes.
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Parse env file contents into a map.
///
/// Unparseable lines are skipped rather than rejected, and a later assignment to the same key
/// overwrites an earlier one.
#[must_use]
pub fn parse_env(content: &str) -> EnvMap {
    content
        .lines()
        .filter_map(parse_line)
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Search for an env file in `start` and its parents, falling back to `home`.
#[must_use]
pub fn find_env_file(start: &Path, home: Option<&Path>) -> Option<PathBuf> {
    debug!("Searching for {FILENAME} in {}", start.display());
    for dir in start.ancestors() {
        let candidate = dir.join(FILENAME);
        if candidate.exists() {
            info!("Found env file: {}", candidate.display());
            return Some(candidate);
        }
    }

    let candidate = home?.join(FILENAME);
    debug!("Checking home fallback {}", candidate.display());
    if candidate.exists() {
        info!("Found env file: {}", candidate.display());
        return Some(candidate);
    }
    None
}

/// Invalid UTF-8 is replaced rather than rejected, in line with skipping malformed lines.
fn parse_bytes(bytes: &[u8]) -> EnvMap {
    parse_env(&String::from_utf8_lossy(bytes))
}

fn read_file(path: &Path) -> Result<EnvMap, EnvFileError> {
    let bytes = std::fs::read(path).map_err(|source| EnvFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_bytes(&bytes))
}

/// Read env file contents from any reader, e.g. standard input.
///
/// # Errors
///
/// Returns `EnvFileError::Stdin` if reading fails.
pub fn read_env(mut reader: impl Read) -> Result<EnvMap, EnvFileError> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(EnvFileError::Stdin)?;
    Ok(parse_bytes(&bytes))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf())
}

/// Work out where the requested env file lives without reading it.
///
/// # Errors
///
/// Returns `EnvFileError::UnknownWorkingDirectory` if discovery cannot determine the cwd.
pub fn locate(request: &SourceRequest) -> Result<ResolvedSource, EnvFileError> {
    Ok(match request {
        SourceRequest::Path(path) => ResolvedSource::ExplicitPath(path.clone()),
        SourceRequest::Stdin => ResolvedSource::Stdin,
        SourceRequest::Discover => {
            let cwd = std::env::current_dir().map_err(EnvFileError::UnknownWorkingDirectory)?;
            match find_env_file(&cwd, home_dir().as_deref()) {
                Some(path) => ResolvedSource::Discovered(path),
                None => ResolvedSource::NotFound { searched_from: cwd },
            }
        }
    })
}

/// Read and parse a located source.
///
/// # Errors
///
/// Returns `EnvFileError::NotFound` for an unresolved source, or `EnvFileError::Read` /
/// `EnvFileError::Stdin` if the source cannot be read.
pub fn load(source: &ResolvedSource) -> Result<EnvMap, EnvFileError> {
    match source {
        ResolvedSource::ExplicitPath(path) | ResolvedSource::Discovered(path) => read_file(path),
        ResolvedSource::Stdin => read_env(std::io::stdin().lock()),
        ResolvedSource::NotFound { searched_from } => Err(EnvFileError::NotFound {
            searched_from: searched_from.clone(),
        }),
    }
}

/// Resolve the requested source and parse it.
///
/// Does not touch the process environment; merging is up to the caller.
///
/// # Errors
///
/// Returns `EnvFileError::NotFound` if discovery finds nothing, `EnvFileError::Read` or
/// `EnvFileError::Stdin` if the source cannot be read, and
/// `EnvFileError::UnknownWorkingDirectory` if the cwd cannot be determined.
pub fn resolve(request: &SourceRequest) -> Result<(ResolvedSource, EnvMap), EnvFileError> {
    let source = locate(request)?;
    if !matches!(source, ResolvedSource::NotFound { .. }) {
        info!("Loading environment variables from: {source}");
    }
    let env = load(&source)?;

    let mut keys: Vec<&str> = env.keys().map(String::as_str).collect();
    keys.sort_unstable();
    info!("Loaded variables: {}", keys.join(", "));

    Ok((source, env))
}
