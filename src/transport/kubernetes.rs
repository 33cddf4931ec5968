//! Exec transport backed by kube-rs
//!
//! kube-rs performs the HTTP upgrade, negotiates the channel subprotocol and
//! demultiplexes frames into per-channel pipes. This module maps an
//! [`ExecRequest`] onto `Api::<Pod>::exec` and the resulting `AttachedProcess`
//! onto an [`ExecSession`].

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::Client;
use tracing::{debug, info};

use super::{ExecSession, ExecTransport};
use crate::config::ConnectionCredentials;
use crate::request::{ExecRequest, ExecTarget, SessionOptions};
use crate::status::ExitStatus;
use crate::{Error, Result};

/// Install the process-wide rustls crypto provider.
///
/// Safe to call more than once; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Transport that opens sessions through the API server with kube-rs
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeTransport;

#[async_trait]
impl ExecTransport for KubeTransport {
    async fn connect(
        &self,
        request: &ExecRequest,
        credentials: &ConnectionCredentials,
    ) -> Result<ExecSession> {
        let (target, command, options) = request.decode()?;

        let client = Client::try_from(credentials.config().clone())
            .map_err(|e| Error::connection(format!("failed to create client: {}", e)))?;
        let pods: Api<Pod> = Api::namespaced(client, target.namespace());

        debug!(
            server = %credentials.cluster_url(),
            path = %request.path(),
            "Upgrading connection"
        );

        let attached = pods
            .exec(
                target.pod_name(),
                command.args().to_vec(),
                &to_attach_params(&target, options),
            )
            .await
            .map_err(classify_exec_error)?;

        info!(
            namespace = %target.namespace(),
            pod = %target.pod_name(),
            "Exec session established"
        );

        Ok(session_from_attached(attached))
    }
}

/// Convert session options to kube AttachParams.
///
/// The API server cannot separate stderr from stdout on a TTY, and kube-rs
/// rejects the combination, so stderr is only requested without a TTY.
fn to_attach_params(target: &ExecTarget, options: SessionOptions) -> AttachParams {
    AttachParams {
        container: target.container().map(str::to_string),
        stdin: options.stdin,
        stdout: options.stdout,
        stderr: options.stderr && !options.tty,
        tty: options.tty,
        max_stdin_buf_size: None,
        max_stdout_buf_size: None,
        max_stderr_buf_size: None,
    }
}

/// Map a failed upgrade onto the client error kinds
fn classify_exec_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            Error::auth(format!("{} ({})", ae.message, ae.code))
        }
        kube::Error::Api(ae) => Error::upgrade(format!("{} ({})", ae.message, ae.code)),
        kube::Error::UpgradeConnection(kube::client::UpgradeConnectionError::ProtocolSwitch(
            status,
        )) if status.as_u16() == 401 || status.as_u16() == 403 => {
            Error::auth(format!("upgrade rejected with {}", status))
        }
        kube::Error::UpgradeConnection(e) => Error::upgrade(e.to_string()),
        kube::Error::Auth(e) => Error::auth(e.to_string()),
        e => Error::connection(e.to_string()),
    }
}

fn session_from_attached(mut attached: AttachedProcess) -> ExecSession {
    let stdin = attached.stdin();
    let stdout = attached.stdout();
    let stderr = attached.stderr();
    let resize = attached.terminal_size();
    let status = attached.take_status();

    // The status resolves as soon as channel 3 arrives. The connection task
    // only finishes once stdin is dropped, so it is joined in the background.
    let completion = async move {
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        tokio::spawn(async move {
            if let Err(e) = attached.join().await {
                debug!(error = %e, "Exec connection closed with error");
            }
        });
        Ok(ExitStatus::from_status(status.as_ref()))
    }
    .boxed();

    let mut session = ExecSession::new(completion);
    if let Some(stdin) = stdin {
        session = session.with_stdin(stdin);
    }
    if let Some(stdout) = stdout {
        session = session.with_stdout(stdout);
    }
    if let Some(stderr) = stderr {
        session = session.with_stderr(stderr);
    }
    if let Some(resize) = resize {
        session = session.with_resize(resize);
    }
    session
}
