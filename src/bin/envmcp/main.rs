use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use log::debug;

use envmcp::env_file::SourceRequest;
use envmcp::launch::{LaunchSpec, launch, relay};
use envmcp::load_environment;

#[derive(Parser, Debug)]
#[command(
    name = "envmcp",
    version,
    about = "Run a command with environment variables loaded from a .env.mcp file"
)]
struct Cli {
    /// Path to env file (auto-detected if not specified)
    #[arg(short, long, value_name = "PATH", conflicts_with = "stdin")]
    env_file: Option<PathBuf>,

    /// Read the env file from standard input
    #[arg(long)]
    stdin: bool,

    /// Run the command line through the system shell
    #[arg(long)]
    shell: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log file path (enables file logging in addition to stderr)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Command to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    fn source_request(&self) -> SourceRequest {
        match (&self.env_file, self.stdin) {
            (Some(path), _) => SourceRequest::Path(path.clone()),
            (None, true) => SourceRequest::Stdin,
            (None, false) => SourceRequest::Discover,
        }
    }

    fn launch_spec(&self, env: Vec<(OsString, OsString)>) -> Option<LaunchSpec> {
        if self.shell {
            return Some(LaunchSpec::shell(&self.command, env));
        }
        let (program, args) = self.command.split_first()?;
        Some(LaunchSpec::new(program.clone(), args.to_vec(), env))
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let log_file = cli
        .log_file
        .as_ref()
        .map(std::fs::File::create)
        .transpose()?;
    envmcp::logger::init(cli.verbose, log_file)?;

    let (source, env) = load_environment(&cli.source_request())?;
    debug!("Using env file {source}");

    let spec = cli.launch_spec(env).ok_or("Command is required")?;
    let outcome = launch(spec)?;
    Ok(relay(outcome))
}
