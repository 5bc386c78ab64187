//! vmctl HTTP endpoint
//!
//! `GET /?token=<jwt>` verifies the token, checks the requested operation
//! against the allow-list and runs it through virsh.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use vmctl_common::{AllowList, Claims, Error, VirshExecutor};

use crate::auth::{OperationPolicy, TokenVerifier};
use crate::config::Settings;

/// Immutable per-process state shared by every request
#[derive(Debug)]
pub struct AppState {
    verifier: TokenVerifier,
    policy: OperationPolicy,
    executor: VirshExecutor,
}

impl AppState {
    pub fn new(verifier: TokenVerifier, policy: OperationPolicy, executor: VirshExecutor) -> Self {
        Self {
            verifier,
            policy,
            executor,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            TokenVerifier::new(settings.key.as_bytes()),
            OperationPolicy::new(AllowList::default()),
            VirshExecutor::new(settings.executor.clone()),
        )
    }

    /// Verify, authorize, execute.
    pub async fn handle(&self, raw_token: &str) -> Result<Claims, Error> {
        let claims = self.verifier.verify(raw_token)?;
        self.policy.authorize(&claims)?;

        self.executor
            .execute(&claims.operation, &claims.vm_name)
            .await
            .into_result()?;

        Ok(claims)
    }
}

/// Maps the error taxonomy onto HTTP statuses with plain-text bodies.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ExecutionFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match self.0 {
            Error::ExecutionFailure(text) => text,
            _ => status.canonical_reason().unwrap_or_default().to_string(),
        };

        (status, body).into_response()
    }
}

/// Create router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(control_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and run until Ctrl-C or SIGTERM
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("VM control listens on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("VM control stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
}

// ============================================================================
// Handlers
// ============================================================================

/// Only the first `token` value counts; a missing one is the empty token.
fn first_token(params: &[(String, String)]) -> &str {
    params
        .iter()
        .find(|(name, _)| name == "token")
        .map(|(_, value)| value.as_str())
        .unwrap_or_default()
}

async fn control_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<StatusCode, ApiError> {
    match state.handle(first_token(&params)).await {
        Ok(claims) => {
            info!(vm = %claims.vm_name, operation = %claims.operation, "operation completed");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            match &e {
                Error::Unauthorized => warn!("rejected request with invalid token"),
                Error::BadRequest(msg) => warn!("rejected request: {}", msg),
                Error::Forbidden(_) => {}
                Error::ExecutionFailure(text) => error!("operation failed: {}", text),
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;
    use vmctl_common::{CommandOutput, CommandRunner, ExecutorSettings};

    const SECRET: &str = "vmctl-test-secret";

    /// Records virsh argument lists; answers with canned stderr per subcommand.
    #[derive(Default)]
    struct RecordingRunner {
        stderr: Vec<(&'static str, &'static str)>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingRunner {
        fn failing(subcommand: &'static str, stderr: &'static str) -> Self {
            Self {
                stderr: vec![(subcommand, stderr)],
                ..Default::default()
            }
        }

        /// (subcommand, vm) for each call, in order.
        fn invocations(&self) -> Vec<(String, String)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|args| (args[2].clone(), args[3].clone()))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, _program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            let stderr = self
                .stderr
                .iter()
                .find(|(sub, _)| *sub == args[2])
                .map(|(_, text)| text.to_string())
                .unwrap_or_default();
            Ok(CommandOutput {
                stdout: String::new(),
                stderr,
                exit_code: Some(0),
            })
        }
    }

    fn app(runner: Arc<RecordingRunner>) -> Router {
        let state = AppState::new(
            TokenVerifier::new(SECRET.as_bytes()),
            OperationPolicy::default(),
            VirshExecutor::with_runner(ExecutorSettings::default(), runner),
        );
        router(Arc::new(state))
    }

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    async fn send(app: Router, uri: String) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn call(runner: Arc<RecordingRunner>, claims: serde_json::Value) -> (StatusCode, String) {
        let token = sign(claims, SECRET);
        send(app(runner), format!("/?token={}", token)).await
    }

    #[tokio::test]
    async fn test_start_runs_once_and_returns_empty_ok() {
        let runner = Arc::new(RecordingRunner::default());
        let (status, body) = call(runner.clone(), json!({"vm": "vm1", "operation": "start"})).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(
            runner.invocations(),
            vec![("start".to_string(), "vm1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_restart_destroys_then_starts() {
        let runner = Arc::new(RecordingRunner::default());
        let (status, _) = call(runner.clone(), json!({"vm": "vm1", "operation": "restart"})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            runner.invocations(),
            vec![
                ("destroy".to_string(), "vm1".to_string()),
                ("start".to_string(), "vm1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_destroy_failure_is_500_even_if_start_succeeds() {
        let runner = Arc::new(RecordingRunner::failing(
            "destroy",
            "error: failed to destroy domain 'vm1'",
        ));
        let (status, body) = call(runner.clone(), json!({"vm": "vm1", "operation": "restart"})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "error: failed to destroy domain 'vm1'\r\n");
        assert_eq!(runner.invocations().len(), 2);
    }

    #[tokio::test]
    async fn test_start_failure_echoes_stderr() {
        let runner = Arc::new(RecordingRunner::failing(
            "start",
            "error: failed to get domain 'ghost'",
        ));
        let (status, body) = call(runner, json!({"vm": "ghost", "operation": "start"})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "error: failed to get domain 'ghost'");
    }

    #[tokio::test]
    async fn test_wrong_key_is_401_and_nothing_runs() {
        let runner = Arc::new(RecordingRunner::default());
        let token = sign(json!({"vm": "vm1", "operation": "start"}), "someone-else");
        let (status, body) = send(app(runner.clone()), format!("/?token={}", token)).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Unauthorized");
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let runner = Arc::new(RecordingRunner::default());
        let (status, _) = send(app(runner.clone()), "/".to_string()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(app(runner), "/?token=".to_string()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_markup_in_token_is_401() {
        let runner = Arc::new(RecordingRunner::default());
        let (status, body) = send(
            app(runner),
            "/?token=%3Cscript%3Ealert(1)%3C%2Fscript%3E".to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!body.contains("<script>"));
    }

    #[tokio::test]
    async fn test_forbidden_operations_are_403() {
        for op in ["destroy", "shutdown", "undefine", "reboot"] {
            let runner = Arc::new(RecordingRunner::default());
            let (status, body) = call(runner.clone(), json!({"vm": "vm1", "operation": op})).await;

            assert_eq!(status, StatusCode::FORBIDDEN, "operation {op}");
            assert_eq!(body, "Forbidden");
            assert!(runner.invocations().is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_claims_are_400() {
        for claims in [
            json!({"operation": "start"}),
            json!({"vm": "vm1"}),
            json!({"vm": "", "operation": "start"}),
            json!({}),
        ] {
            let runner = Arc::new(RecordingRunner::default());
            let (status, body) = call(runner.clone(), claims).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body, "Bad Request");
            assert!(runner.invocations().is_empty());
        }
    }

    #[tokio::test]
    async fn test_first_token_wins() {
        let runner = Arc::new(RecordingRunner::default());
        let good = sign(json!({"vm": "vm1", "operation": "start"}), SECRET);
        let (status, _) = send(
            app(runner.clone()),
            format!("/?token={}&token=garbage", good),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_passes_through_twice() {
        let runner = Arc::new(RecordingRunner::default());
        let claims = json!({"vm": "vm1", "operation": "start"});

        let (first, _) = call(runner.clone(), claims.clone()).await;
        let (second, _) = call(runner.clone(), claims).await;

        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(runner.invocations().len(), 2);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::Unauthorized, StatusCode::UNAUTHORIZED),
            (Error::bad_request("x"), StatusCode::BAD_REQUEST),
            (Error::Forbidden("destroy".into()), StatusCode::FORBIDDEN),
            (
                Error::ExecutionFailure("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
