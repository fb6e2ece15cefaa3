//! Workspace REST API over `reqwest`.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::error::AppError;
use crate::workspace::types::{Command, CreateWorkspaceConfig, WorkspaceDescriptor};

#[derive(Debug, Clone)]
pub struct HttpWorkspaceApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpWorkspaceApi {
    /// `base_url` is the server root, e.g. `http://localhost:8080`.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, AppError> {
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| AppError::Config(format!("invalid server URL '{base_url}'")))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// `/api/workspace/<segments...>`, each segment percent-encoded on its own.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejected cannot-be-a-base URLs.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "workspace"]).extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match &self.token {
            Some(token) => builder.query(&[("token", token)]),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, AppError> {
        let response = builder
            .send()
            .await
            .map_err(|e| AppError::Request(e.without_url().to_string()))?;
        check_status(response).await
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, AppError> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| AppError::Request(format!("invalid response body: {e}")))
    }

    pub async fn ping(&self) -> Result<bool, AppError> {
        let response = self
            .request(Method::GET, &[])
            .send()
            .await
            .map_err(|e| AppError::Request(e.without_url().to_string()))?;
        debug!(status = %response.status(), "ping");
        Ok(response.status().is_success())
    }

    pub async fn list(&self) -> Result<Vec<WorkspaceDescriptor>, AppError> {
        self.json(self.request(Method::GET, &[])).await
    }

    pub async fn get(&self, key: &str) -> Result<WorkspaceDescriptor, AppError> {
        self.json(self.request(Method::GET, &[key])).await
    }

    pub async fn create(&self, config: &CreateWorkspaceConfig) -> Result<WorkspaceDescriptor, AppError> {
        self.json(self.request(Method::POST, &[]).json(config)).await
    }

    pub async fn start(&self, id: &str, environment: &str) -> Result<(), AppError> {
        let builder = self
            .request(Method::POST, &[id, "runtime"])
            .query(&[("environment", environment)]);
        self.send(builder).await.map(drop)
    }

    pub async fn stop(&self, id: &str) -> Result<(), AppError> {
        self.send(self.request(Method::DELETE, &[id, "runtime"]))
            .await
            .map(drop)
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.send(self.request(Method::DELETE, &[id]))
            .await
            .map(drop)
    }

    pub async fn execute_command(
        &self,
        id: &str,
        machine_id: &str,
        command: &Command,
        output_channel: &str,
    ) -> Result<(), AppError> {
        let builder = self
            .request(Method::POST, &[id, "machine", machine_id, "command"])
            .query(&[("outputChannel", output_channel)])
            .json(command);
        self.send(builder).await.map(drop)
    }
}

/// Map a non-2xx answer to [`AppError::Rest`], keeping the body verbatim.
async fn check_status(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut url = response.url().clone();
    url.set_query(None);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    error!(%status, %url, "workspace API returned HTTP error");
    Err(AppError::Rest {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the request head.
    async fn one_shot(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..read]).to_string();
            head.lines().next().unwrap_or_default().to_string()
        });
        (base, handle)
    }

    #[tokio::test]
    async fn get_sends_token_and_parses_descriptor() {
        let (base, server) = one_shot("200 OK", r#"{"id":"w1","status":"RUNNING","config":{"name":"chedir"}}"#).await;
        let api = HttpWorkspaceApi::new(base, Some("secret".into()), Duration::from_secs(5)).unwrap();

        let ws = api.get(":chedir").await.unwrap();
        assert_eq!(ws.id, "w1");

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /api/workspace/:chedir?token=secret"));
    }

    #[tokio::test]
    async fn name_key_is_percent_encoded() {
        let (base, server) = one_shot("404 Not Found", "{}").await;
        let api = HttpWorkspaceApi::new(format!("{base}/che/"), None, Duration::from_secs(5)).unwrap();

        let _ = api.get(":my ws#1/a?b").await;
        let request_line = server.await.unwrap();
        assert!(
            request_line.starts_with("GET /che/api/workspace/:my%20ws%231%2Fa%3Fb HTTP/1.1"),
            "{request_line}"
        );
    }

    #[test]
    fn non_http_base_url_rejected() {
        assert!(matches!(
            HttpWorkspaceApi::new("not a url", None, Duration::from_secs(1)),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            HttpWorkspaceApi::new("mailto:ops@example.com", None, Duration::from_secs(1)),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn not_found_maps_to_rest_error() {
        let (base, server) = one_shot("404 Not Found", r#"{"message":"Workspace not found"}"#).await;
        let api = HttpWorkspaceApi::new(base, Some("secret".into()), Duration::from_secs(5)).unwrap();

        let err = api.get(":missing").await.unwrap_err();
        assert!(err.is_not_found());
        match err {
            AppError::Rest { body, url, .. } => {
                assert!(body.contains("Workspace not found"));
                assert!(!url.contains("secret"));
            }
            other => panic!("unexpected error: {other}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn start_passes_environment() {
        let (base, server) = one_shot("200 OK", "{}").await;
        let api = HttpWorkspaceApi::new(format!("{base}/"), None, Duration::from_secs(5)).unwrap();

        api.start("w1", "default").await.unwrap();
        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("POST /api/workspace/w1/runtime?environment=default"));
    }

    #[tokio::test]
    async fn unreachable_server_is_request_error() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let api = HttpWorkspaceApi::new(format!("http://127.0.0.1:{port}"), None, Duration::from_secs(2)).unwrap();
        assert!(matches!(api.ping().await, Err(AppError::Request(_))));
    }
}
