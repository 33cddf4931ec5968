//! Exec request construction
//!
//! Builds the `POST /api/v1/namespaces/{ns}/pods/{pod}/exec` descriptor that
//! the API server upgrades into a multiplexed stream, and parses it back.
//! Parsing is used by the kube transport to drive `Api<Pod>::exec`, so the
//! descriptor is the single source of truth for what gets executed.

use url::form_urlencoded;

use crate::{Error, Result};

/// Default command when none is given
pub const DEFAULT_COMMAND: &str = "sh";

/// HTTP method used for the exec subresource
pub const EXEC_METHOD: &str = "POST";

/// Subresource name for exec
const EXEC_SUBRESOURCE: &str = "exec";

/// The pod (and optionally container) to exec into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    namespace: String,
    pod_name: String,
    container: Option<String>,
}

impl ExecTarget {
    /// Create a target. An empty container means "infer the sole container".
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        let container = container.into();
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container: (!container.is_empty()).then_some(container),
        }
    }

    /// Namespace the pod lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Pod name
    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    /// Explicit container, if any
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }
}

/// argv-style command to run in the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand(Vec<String>);

impl ExecCommand {
    /// Wrap an argv vector
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    /// The argv tokens
    pub fn args(&self) -> &[String] {
        &self.0
    }

    /// Whether there are no tokens
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ExecCommand {
    fn default() -> Self {
        Self::new([DEFAULT_COMMAND])
    }
}

/// Which streams to attach and whether to allocate a TTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Attach stdin
    pub stdin: bool,
    /// Attach stdout
    pub stdout: bool,
    /// Attach stderr
    pub stderr: bool,
    /// Allocate a TTY
    pub tty: bool,
}

impl SessionOptions {
    /// Fully interactive session: all streams plus a TTY
    pub fn interactive() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            tty: true,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Upgrade request descriptor for the exec subresource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    method: &'static str,
    path: String,
    query: String,
}

impl ExecRequest {
    /// HTTP method (always POST)
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// API path of the pod's exec subresource
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Encoded query string (without leading `?`)
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Path and query joined, as sent on the wire
    pub fn url(&self) -> String {
        format!("{}?{}", self.path, self.query)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(method: &'static str, path: &str, query: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: query.to_string(),
        }
    }

    /// Recover the target, command, and options this request was built from
    pub fn decode(&self) -> Result<(ExecTarget, ExecCommand, SessionOptions)> {
        let (namespace, pod_name, subresource) = parse_exec_path(&self.path)
            .ok_or_else(|| Error::invalid_argument(format!("invalid exec path: {}", self.path)))?;
        if subresource != EXEC_SUBRESOURCE {
            return Err(Error::invalid_argument(format!(
                "unsupported subresource: {}",
                subresource
            )));
        }

        let params = parse_exec_params(&self.query);
        let target = ExecTarget::new(namespace, pod_name, params.container.unwrap_or_default());
        let command = ExecCommand::new(parse_exec_command(&self.query));
        if command.is_empty() {
            return Err(Error::invalid_argument("exec request has no command"));
        }
        let options = SessionOptions {
            stdin: params.stdin,
            stdout: params.stdout,
            stderr: params.stderr,
            tty: params.tty,
        };
        Ok((target, command, options))
    }
}

/// Build the exec upgrade request for a target and command.
///
/// Fails with [`Error::InvalidArgument`] when the pod name, namespace, or
/// command is empty, or when a path segment contains `/`.
pub fn build(
    target: &ExecTarget,
    command: &ExecCommand,
    options: SessionOptions,
) -> Result<ExecRequest> {
    validate_segment("pod name", target.pod_name())?;
    validate_segment("namespace", target.namespace())?;
    if command.is_empty() {
        return Err(Error::invalid_argument("command must not be empty"));
    }

    let path = format!(
        "/api/v1/namespaces/{}/pods/{}/{}",
        target.namespace(),
        target.pod_name(),
        EXEC_SUBRESOURCE
    );

    let mut query = form_urlencoded::Serializer::new(String::new());
    if let Some(container) = target.container() {
        query.append_pair("container", container);
    }
    for arg in command.args() {
        query.append_pair("command", arg);
    }
    query.append_pair("stdin", bool_param(options.stdin));
    query.append_pair("stdout", bool_param(options.stdout));
    query.append_pair("stderr", bool_param(options.stderr));
    query.append_pair("tty", bool_param(options.tty));

    Ok(ExecRequest {
        method: EXEC_METHOD,
        path,
        query: query.finish(),
    })
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_argument(format!("{} must not be empty", what)));
    }
    if value.contains('/') {
        return Err(Error::invalid_argument(format!(
            "{} must not contain '/': {}",
            what, value
        )));
    }
    Ok(())
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Stream flags and container decoded from an exec query string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecParams {
    /// Explicit container, if any
    pub container: Option<String>,
    /// Attach stdin
    pub stdin: bool,
    /// Attach stdout
    pub stdout: bool,
    /// Attach stderr
    pub stderr: bool,
    /// Allocate a TTY
    pub tty: bool,
}

/// Split `/api/v1/namespaces/{ns}/pods/{pod}/{subresource}` into its parts
pub fn parse_exec_path(path: &str) -> Option<(&str, &str, &str)> {
    let rest = path.strip_prefix("/api/v1/namespaces/")?;
    let mut parts = rest.split('/');
    let namespace = parts.next().filter(|s| !s.is_empty())?;
    if parts.next()? != "pods" {
        return None;
    }
    let pod = parts.next().filter(|s| !s.is_empty())?;
    let subresource = parts.next().filter(|s| !s.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some((namespace, pod, subresource))
}

/// Decode container and stream flags from an exec query string.
///
/// Accepts `true`/`1` as truthy, matching the API server's parameter codec.
pub fn parse_exec_params(query: &str) -> ExecParams {
    let mut params = ExecParams::default();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let truthy = value == "true" || value == "1";
        match key.as_ref() {
            "container" if !value.is_empty() => params.container = Some(value.into_owned()),
            "stdin" => params.stdin = truthy,
            "stdout" => params.stdout = truthy,
            "stderr" => params.stderr = truthy,
            "tty" => params.tty = truthy,
            _ => {}
        }
    }
    params
}

/// Decode the ordered `command` tokens from an exec query string
pub fn parse_exec_command(query: &str) -> Vec<String> {
    form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "command")
        .map(|(_, value)| value.into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web0() -> ExecTarget {
        ExecTarget::new("default", "web-0", "")
    }

    #[test]
    fn builds_exec_subresource_path() {
        let req = build(
            &web0(),
            &ExecCommand::new(["echo", "hi"]),
            SessionOptions::interactive(),
        )
        .unwrap();

        assert_eq!(req.method(), "POST");
        assert_eq!(req.path(), "/api/v1/namespaces/default/pods/web-0/exec");
        assert_eq!(
            req.query(),
            "command=echo&command=hi&stdin=true&stdout=true&stderr=true&tty=true"
        );
        assert!(req.url().starts_with("/api/v1/namespaces/default/pods/web-0/exec?"));
    }

    #[test]
    fn container_is_encoded_first_when_set() {
        let target = ExecTarget::new("team-a", "api-7d9f", "sidecar");
        let req = build(&target, &ExecCommand::default(), SessionOptions::interactive()).unwrap();
        assert!(req.query().starts_with("container=sidecar&command=sh&"));
    }

    #[test]
    fn empty_container_is_omitted() {
        let req = build(&web0(), &ExecCommand::default(), SessionOptions::interactive()).unwrap();
        assert!(!req.query().contains("container="));
        assert_eq!(web0().container(), None);
    }

    #[test]
    fn decode_round_trips_tricky_tokens() {
        let cases = [
            ("default", "web-0", "", vec!["sh"]),
            ("kube-system", "coredns-abc", "coredns", vec!["cat", "/etc/resolv.conf"]),
            (
                "prod",
                "db-1",
                "postgres",
                vec!["psql", "-c", "select 1 & 2 = 3; -- ünïcode ✓"],
            ),
            ("ns", "p", "c", vec!["", "  spaced  ", "a+b", "100%"]),
        ];

        for (namespace, pod, container, argv) in cases {
            let target = ExecTarget::new(namespace, pod, container);
            let command = ExecCommand::new(argv.clone());
            let options = SessionOptions::interactive();
            let req = build(&target, &command, options).unwrap();

            let (t, c, o) = req.decode().unwrap();
            assert_eq!(t, target, "target for {:?}", argv);
            assert_eq!(c, command, "command for {:?}", argv);
            assert_eq!(o, options);
        }
    }

    #[test]
    fn decode_preserves_non_interactive_flags() {
        let options = SessionOptions {
            stdin: false,
            stdout: true,
            stderr: false,
            tty: false,
        };
        let req = build(&web0(), &ExecCommand::default(), options).unwrap();
        let (_, _, decoded) = req.decode().unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn empty_pod_name_is_invalid() {
        let target = ExecTarget::new("default", "", "");
        let err = build(&target, &ExecCommand::default(), SessionOptions::interactive())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("pod name"));
    }

    #[test]
    fn empty_command_is_invalid() {
        let empty: Vec<String> = vec![];
        let err = build(&web0(), &ExecCommand::new(empty), SessionOptions::interactive())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn empty_namespace_is_invalid() {
        let target = ExecTarget::new("", "web-0", "");
        let err = build(&target, &ExecCommand::default(), SessionOptions::interactive())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn slash_in_pod_name_is_invalid() {
        let target = ExecTarget::new("default", "web-0/../../secrets", "");
        let err = build(&target, &ExecCommand::default(), SessionOptions::interactive())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn parse_exec_path_accepts_exec_and_attach() {
        assert_eq!(
            parse_exec_path("/api/v1/namespaces/default/pods/nginx/exec"),
            Some(("default", "nginx", "exec"))
        );
        assert_eq!(
            parse_exec_path("/api/v1/namespaces/prod/pods/web/attach"),
            Some(("prod", "web", "attach"))
        );
    }

    #[test]
    fn parse_exec_path_rejects_malformed_paths() {
        assert_eq!(parse_exec_path("/api/v1/pods"), None);
        assert_eq!(parse_exec_path("/api/v1/namespaces/default/services/x/exec"), None);
        assert_eq!(parse_exec_path("/api/v1/namespaces//pods/x/exec"), None);
        assert_eq!(parse_exec_path("/api/v1/namespaces/default/pods/x"), None);
        assert_eq!(parse_exec_path("/api/v1/namespaces/default/pods/x/exec/extra"), None);
    }

    #[test]
    fn parse_exec_params_accepts_numeric_booleans() {
        let params = parse_exec_params("stdin=1&stdout=true&stderr=0&tty=false&container=app");
        assert_eq!(
            params,
            ExecParams {
                container: Some("app".to_string()),
                stdin: true,
                stdout: true,
                stderr: false,
                tty: false,
            }
        );
    }

    #[test]
    fn parse_exec_command_keeps_order() {
        let cmd = parse_exec_command("command=ls&stdin=true&command=-la&command=%2Ftmp");
        assert_eq!(cmd, vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn decode_rejects_other_subresources() {
        let req = ExecRequest {
            method: EXEC_METHOD,
            path: "/api/v1/namespaces/default/pods/web-0/attach".to_string(),
            query: "stdin=true".to_string(),
        };
        assert!(matches!(req.decode(), Err(Error::InvalidArgument(_))));
    }
}
