//! podexec - run a command in a Kubernetes container with an interactive TTY

use std::process::ExitCode;

use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use podexec::cli;
use podexec::config::{self, ExecConfig};
use podexec::relay::LocalIo;
use podexec::session::{phase, run_exec};
use podexec::terminal::CrosstermTerminal;
use podexec::transport::kubernetes::install_crypto_provider;
use podexec::transport::KubeTransport;
use podexec::{PhaseExt, Result};

fn main() -> ExitCode {
    // Logs share stderr with the remote session, so stay quiet unless asked
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config: ExecConfig = match cli::parse_from(std::env::args_os()) {
        Ok(cli) => cli.into(),
        Err(failure) => {
            failure.print();
            return exit_code(failure.exit_code);
        }
    };

    install_crypto_provider();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(&config));

    // A blocking stdin read cannot be cancelled; don't wait for it
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            debug!(error = ?err, "Session failed");
            eprintln!("error: {}", err);
            exit_code(err.exit_code())
        }
    }
}

async fn run(config: &ExecConfig) -> Result<()> {
    let connection = config::resolve(config.kubeconfig.as_deref(), config.context.as_deref())
        .await
        .phase(phase::CLIENT_CONFIG)?;

    run_exec(
        config,
        &connection,
        &KubeTransport,
        &CrosstermTerminal,
        LocalIo::process(),
    )
    .await
}

fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => {
            debug!(code, "Exit code out of range");
            ExitCode::FAILURE
        }
    }
}
