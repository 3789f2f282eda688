//! Typed HTTP client for the service, as used by an editor front end.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::ErrorBody,
    languages::LanguageSummary,
    models::{RunWorkspaceRequest, SubmissionAccepted, SubmissionRecord, SubmitRequest},
    workspace::{AddFileRequest, CreateWorkspaceRequest, FilePatch, Workspace, WorkspaceFile},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
// server caps each long-poll at 30s
const POLL_SLICE: Duration = Duration::from_secs(25);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {status} ({kind}): {message}")]
    Api {
        status: u16,
        kind: String,
        message: String,
    },
    #[error("submission {0} did not finish in time")]
    Timeout(Uuid),
}

#[derive(Clone)]
pub struct CodepadClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl CodepadClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ClientError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub async fn languages(&self) -> Result<Vec<LanguageSummary>, ClientError> {
        self.send_json(self.request(Method::GET, &["languages"])?).await
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmissionAccepted, ClientError> {
        self.send_json(self.request(Method::POST, &["submissions"])?.json(request))
            .await
    }

    /// Fetches a submission, long-polling up to `wait` when given.
    pub async fn poll(&self, id: Uuid, wait: Option<Duration>) -> Result<SubmissionRecord, ClientError> {
        let mut url = self.url(&["submissions", &id.to_string()])?;
        if let Some(wait) = wait {
            url.query_pairs_mut()
                .append_pair("waitMs", &wait.as_millis().to_string());
        }
        let builder = self
            .http
            .request(Method::GET, url)
            .header("x-api-key", &self.api_key);
        self.send_json(builder).await
    }

    /// Long-polls until the submission is terminal or `deadline` passes.
    pub async fn wait_for_result(
        &self,
        id: Uuid,
        deadline: Duration,
    ) -> Result<SubmissionRecord, ClientError> {
        let started = tokio::time::Instant::now();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            let record = self.poll(id, Some(remaining.min(POLL_SLICE))).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if remaining.is_zero() {
                return Err(ClientError::Timeout(id));
            }
        }
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), ClientError> {
        self.send_empty(self.request(Method::DELETE, &["submissions", &id.to_string()])?)
            .await
    }

    pub async fn create_workspace(
        &self,
        id: Option<&str>,
        language: Option<&str>,
    ) -> Result<Workspace, ClientError> {
        let body = CreateWorkspaceRequest {
            id: id.map(str::to_string),
            language: language.map(str::to_string),
        };
        self.send_json(self.request(Method::POST, &["workspaces"])?.json(&body))
            .await
    }

    pub async fn workspace(&self, id: &str) -> Result<Workspace, ClientError> {
        self.send_json(self.request(Method::GET, &["workspaces", id])?)
            .await
    }

    pub async fn delete_workspace(&self, id: &str) -> Result<(), ClientError> {
        self.send_empty(self.request(Method::DELETE, &["workspaces", id])?)
            .await
    }

    pub async fn list_files(&self, id: &str) -> Result<Vec<WorkspaceFile>, ClientError> {
        self.send_json(self.request(Method::GET, &["workspaces", id, "files"])?)
            .await
    }

    pub async fn add_file(&self, id: &str, file: &AddFileRequest) -> Result<WorkspaceFile, ClientError> {
        self.send_json(
            self.request(Method::POST, &["workspaces", id, "files"])?
                .json(file),
        )
        .await
    }

    pub async fn update_file(
        &self,
        id: &str,
        name: &str,
        patch: &FilePatch,
    ) -> Result<WorkspaceFile, ClientError> {
        self.send_json(
            self.request(Method::PATCH, &["workspaces", id, "files", name])?
                .json(patch),
        )
        .await
    }

    pub async fn delete_file(&self, id: &str, name: &str) -> Result<(), ClientError> {
        self.send_empty(self.request(Method::DELETE, &["workspaces", id, "files", name])?)
            .await
    }

    pub async fn run_workspace(
        &self,
        id: &str,
        request: &RunWorkspaceRequest,
    ) -> Result<SubmissionAccepted, ClientError> {
        self.send_json(
            self.request(Method::POST, &["workspaces", id, "runs"])?
                .json(request),
        )
        .await
    }

    // Path segments are percent-encoded, so file names travel intact.
    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, ClientError> {
        Ok(self
            .http
            .request(method, self.url(segments)?)
            .header("x-api-key", &self.api_key))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let response = check(builder.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), ClientError> {
        check(builder.send().await?).await?;
        Ok(())
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let (kind, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.error, body.message),
        Err(_) => ("http_error".to_string(), text),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        kind,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{App, config::EngineConfig, models::SubmissionStatus};

    async fn serve() -> (String, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.sandbox.root = root.path().to_path_buf();
        config.sandbox.isolation = crate::sandbox::test_isolation();
        config.api_keys = crate::config::parse_api_keys("alpha:alpha-key");

        let app = App::build(&config, crate::languages::test_registry())
            .await
            .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.router).await.unwrap();
        });
        (format!("http://{addr}"), root)
    }

    #[tokio::test]
    async fn drives_a_workspace_from_creation_to_result() {
        let (base, _root) = serve().await;
        let client = CodepadClient::new(&base, "alpha-key").unwrap();

        let languages = client.languages().await.unwrap();
        assert!(languages.iter().any(|l| l.id == "python"));

        let ws = client.create_workspace(Some("editor"), Some("sh")).await.unwrap();
        assert_eq!(ws.files.len(), 1);
        client
            .update_file(
                "editor",
                "main.sh",
                &FilePatch {
                    content: Some(". \"./lib file.sh\"; greet".into()),
                    ..FilePatch::default()
                },
            )
            .await
            .unwrap();
        let added = client
            .add_file(
                "editor",
                &AddFileRequest {
                    name: Some("lib file.sh".into()),
                    content: "greet() { echo from-workspace; }".into(),
                    language: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(added.language, "sh");
        assert_eq!(client.list_files("editor").await.unwrap().len(), 2);

        let accepted = client
            .run_workspace(
                "editor",
                &RunWorkspaceRequest {
                    entry_file: "main.sh".into(),
                    stdin: None,
                    priority: None,
                    timeout_ms: None,
                },
            )
            .await
            .unwrap();
        let record = client
            .wait_for_result(accepted.submission_id, Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(record.status, SubmissionStatus::Succeeded);
        assert_eq!(&record.result.unwrap().stdout[..], b"from-workspace\n");

        client.delete_file("editor", "lib file.sh").await.unwrap();
        let err = client.delete_file("editor", "main.sh").await.unwrap_err();
        match err {
            ClientError::Api { status, kind, .. } => {
                assert_eq!(status, 409);
                assert_eq!(kind, "invariant_violation");
            }
            other => panic!("unexpected error: {other}"),
        }

        client.delete_workspace("editor").await.unwrap();
        match client.workspace("editor").await.unwrap_err() {
            ClientError::Api { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn submit_and_cancel_round_trip() {
        let (base, _root) = serve().await;
        let client = CodepadClient::new(&base, "alpha-key").unwrap();

        let accepted = client
            .submit(&SubmitRequest::new("sh", "sleep 30"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.cancel(accepted.submission_id).await.unwrap();
        let record = client.poll(accepted.submission_id, None).await.unwrap();
        assert_eq!(record.status, SubmissionStatus::Cancelled);

        let stranger = CodepadClient::new(&base, "wrong-key").unwrap();
        match stranger.languages().await.unwrap_err() {
            ClientError::Api { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected error: {other}"),
        }
    }
}
