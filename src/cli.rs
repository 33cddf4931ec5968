//! Command-line interface

use clap::error::ErrorKind;
use clap::Parser;

use crate::config::ExecConfig;
use crate::relay::DEFAULT_DRAIN_GRACE;
use crate::request::{ExecCommand, DEFAULT_COMMAND};

/// Usage line shown when the arguments are wrong
pub const USAGE: &str = "podexec [-c CONTAINER] [-n NAMESPACE] [-e CMD[,ARG...]] POD_NAME";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "podexec")]
#[command(version, about = "Execute a command in a container.", long_about = None)]
pub struct Cli {
    /// Container name; empty picks the pod's only container
    #[arg(long, short = 'c', default_value = "")]
    pub container: String,

    /// Namespace of the pod (default: the kubeconfig context's namespace)
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,

    /// Command and arguments, comma-separated or repeated
    #[arg(
        long = "command",
        short = 'e',
        value_delimiter = ',',
        default_value = DEFAULT_COMMAND
    )]
    pub command: Vec<String>,

    /// Path to a kubeconfig file (default: $KUBECONFIG or ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// Pod to exec into
    #[arg(value_name = "POD_NAME")]
    pub pod: String,
}

impl From<Cli> for ExecConfig {
    fn from(cli: Cli) -> Self {
        ExecConfig {
            pod: cli.pod,
            container: cli.container,
            namespace: cli.namespace,
            command: ExecCommand::new(cli.command),
            kubeconfig: cli.kubeconfig,
            context: cli.context,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Outcome of a failed parse: what to print, where, and the exit code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    /// Text to print
    pub message: String,
    /// Print to stderr rather than stdout
    pub to_stderr: bool,
    /// Process exit code
    pub exit_code: i32,
}

impl ParseFailure {
    /// Print the message to the right stream
    pub fn print(&self) {
        if self.to_stderr {
            eprint!("{}", self.message);
        } else {
            print!("{}", self.message);
        }
    }
}

/// Parse arguments, turning `--help`, `--version` and usage errors into a
/// [`ParseFailure`].
pub fn parse_from<I, T>(args: I) -> Result<Cli, ParseFailure>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args).map_err(|err| match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ParseFailure {
            message: err.to_string(),
            to_stderr: false,
            exit_code: 0,
        },
        _ => ParseFailure {
            message: usage_error(&err),
            to_stderr: true,
            exit_code: 1,
        },
    })
}

fn usage_error(err: &clap::Error) -> String {
    let mut message = format!("Expected '{}'\n", USAGE);
    if err.kind() == ErrorKind::MissingRequiredArgument {
        message.push_str("POD is a required argument for the exec command\n");
    }
    message.push_str(&err.render().to_string());
    message
}
