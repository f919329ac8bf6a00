//! Core implementation of envmcp
//!
//! envmcp loads environment variables from the nearest `.env.mcp` file and runs a command with
//! them, relaying the command's exit code or terminating signal as its own.

use std::ffi::OsString;

use log::debug;

use crate::env_file::{EnvFileError, ResolvedSource, SourceRequest};
use crate::launch::merge_environment;

pub mod env_file;
pub mod launch;
pub mod logger;

/// Resolve the env file and build the environment a child should run with.
///
/// Returns where the variables came from along with the inherited process environment
/// overlaid with them.
///
/// # Errors
///
/// Returns `EnvFileError` if no env file can be found or read.
pub fn load_environment(
    request: &SourceRequest,
) -> Result<(ResolvedSource, Vec<(OsString, OsString)>), EnvFileError> {
    let (source, overrides) = env_file::resolve(request)?;
    let env = merge_environment(std::env::vars_os(), &overrides);
    debug!(
        "Merged {} variables from {source} into {} total",
        overrides.len(),
        env.len()
    );
    Ok((source, env))
}
