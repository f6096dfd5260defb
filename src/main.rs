use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use passh::config::{DEFAULT_PROMPT, DEFAULT_YESNO};
use passh::error::{EXIT_GENERAL, EXIT_USAGE};
use passh::{Error, PromptMatcher, SessionConfig, parse_timeout, resolve_password, session};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "passh",
    about = "Run a command in a PTY and answer its password prompts",
    version,
    after_help = "Patterns are POSIX basic regular expressions. \
                  Option parsing stops at COMMAND."
)]
struct Args {
    /// Send at most N passwords (0 means no limit)
    #[arg(short = 'c', value_name = "N")]
    tries: Option<u32>,

    /// Exit if prompted for the (N+1)th password
    #[arg(short = 'C')]
    fatal_more_tries: bool,

    /// Case insensitive prompt matching
    #[arg(short = 'i')]
    ignore_case: bool,

    /// Save data written to the PTY
    #[arg(short = 'l', value_name = "FILE")]
    log_to_pty: Option<PathBuf>,

    /// Save data read from the PTY
    #[arg(short = 'L', value_name = "FILE")]
    log_from_pty: Option<PathBuf>,

    /// Nohup the child (e.g. for `ssh -f`)
    #[arg(short = 'n')]
    nohup: bool,

    /// The password, or env:VAR, or file:PATH [default: password]
    #[arg(short = 'p', value_name = "PASSWORD", allow_hyphen_values = true)]
    password: Option<String>,

    /// Regexp (BRE) for the password prompt
    #[arg(short = 'P', value_name = "PROMPT", allow_hyphen_values = true, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Regexp (BRE) for the yes/no prompt
    #[arg(short = 'Y', value_name = "PATTERN", allow_hyphen_values = true, default_value = DEFAULT_YESNO)]
    yesno_prompt: String,

    /// Timeout waiting for the next password prompt, e.g. 10, 500ms, 1.5s (0 means none)
    #[arg(short = 't', value_name = "TIMEOUT")]
    timeout: Option<String>,

    /// Exit if timed out waiting for a password prompt
    #[arg(short = 'T')]
    fatal_no_prompt: bool,

    /// Auto answer `(yes/no)?` questions
    #[arg(short = 'y')]
    auto_yesno: bool,

    /// The command to run, with its arguments
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<OsString>,
}

fn main() {
    init_logging();
    let code = match run() {
        Ok(code) => code,
        Err(err) => report(err),
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    if std::env::args_os().len() == 1 {
        Args::command().print_help()?;
        return Ok(0);
    }
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            e.print().context("failed to print usage")?;
            return Ok(code);
        }
    };

    let config = build_config(args)?;
    debug!(
        program = %config.program(),
        prompt = config.prompt.pattern(),
        max_tries = ?config.max_tries,
        timeout = ?config.timeout,
        "starting session"
    );
    Ok(session::run(&config)?)
}

fn build_config(args: Args) -> Result<SessionConfig> {
    let mut config = SessionConfig::new(args.command)?;

    if let Some(password) = &args.password {
        config.password = resolve_password(password)?;
    }
    if args.prompt.is_empty() {
        return Err(Error::Usage("Error: empty prompt".into()).into());
    }
    config.ignore_case = args.ignore_case;
    config.prompt = compile(&args.prompt, args.ignore_case, "password prompt")?;
    let yesno = compile(&args.yesno_prompt, args.ignore_case, "yes/no prompt")?;
    config.yesno = args.auto_yesno.then_some(yesno);

    if let Some(timeout) = &args.timeout {
        config.timeout = parse_timeout(timeout)?;
    }
    config.max_tries = args.tries.filter(|&n| n > 0);
    config.fatal_on_max_tries = args.fatal_more_tries;
    config.fatal_on_timeout = args.fatal_no_prompt;
    config.nohup_child = args.nohup;
    config.log_to_pty = args.log_to_pty;
    config.log_from_pty = args.log_from_pty;
    Ok(config)
}

fn compile(pattern: &str, ignore_case: bool, what: &str) -> Result<PromptMatcher> {
    PromptMatcher::compile(pattern, ignore_case).map_err(|e| {
        debug!("{e}");
        Error::Usage(format!("Error: invalid RE for {what}")).into()
    })
}

/// Print a fatal error the way a raw-mode terminal can show it and pick the
/// exit code that goes with it.
fn report(err: anyhow::Error) -> i32 {
    // stdout and stderr may be the same terminal.
    let _ = io::stdout().flush();
    let _ = write!(io::stderr(), "!! {err}\r\n");
    err.downcast_ref::<Error>()
        .map(Error::exit_code)
        .unwrap_or(EXIT_GENERAL)
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default_filter = if std::env::var_os("PASSH_DEBUG").is_some() {
        "passh=debug"
    } else {
        "passh=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(true))
        .with(filter)
        .init();
}
