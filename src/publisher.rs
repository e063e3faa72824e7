//! Upload to the social-publishing gateway (Postiz).

use std::path::Path;

use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::metadata::Metadata;

#[derive(Debug, Clone)]
pub struct Publisher {
    client: reqwest::Client,
    url: Option<String>,
    api_key: Option<String>,
}

impl Publisher {
    pub fn new(config: &PipelineConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            url: config.publish_url.clone(),
            api_key: config.publish_key.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() && self.api_key.is_some()
    }

    /// Returns the gateway's JSON response verbatim. Fails with
    /// [`PipelineError::Config`] before touching the network or the file
    /// system when the endpoint or the key is missing.
    pub async fn publish(&self, video: &Path, metadata: &Metadata) -> Result<Value> {
        let (Some(url), Some(api_key)) = (self.url.as_deref(), self.api_key.as_deref()) else {
            return Err(PipelineError::Config(
                "POSTIZ_API_URL and POSTIZ_API_KEY must be set to publish".to_string(),
            ));
        };

        let bytes = tokio::fs::read(video).await?;
        let file_name = video
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "short.mp4".to_string());
        let part = Part::bytes(bytes).file_name(file_name).mime_str("video/mp4")?;
        let form = Form::new()
            .text("title", metadata.title.clone())
            .text("description", metadata.description.clone())
            .text("tags", metadata.tags.join(","))
            .part("file", part);

        info!("Publishing {} to {}", video.display(), url);
        let res = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::extract::{Multipart, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use tokio::sync::Mutex;

    use super::*;
    use crate::metadata::build_metadata;

    fn publisher(url: Option<String>, key: Option<&str>) -> Publisher {
        let config = PipelineConfig {
            publish_url: url,
            publish_key: key.map(str::to_string),
            ..PipelineConfig::default()
        };
        Publisher::new(&config, reqwest::Client::new())
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/upload", listener.local_addr().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("short.mp4");
        std::fs::write(&video, b"dummy").unwrap();

        let p = publisher(Some(url), None);
        assert!(!p.is_configured());
        let err = p.publish(&video, &build_metadata("t")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(accepted.is_err(), "no connection should have been made");
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error_even_without_video() {
        let p = publisher(None, Some("key"));
        let err = p
            .publish(Path::new("/nonexistent/short.mp4"), &build_metadata("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[derive(Default)]
    struct Seen {
        auth: Option<String>,
        fields: Vec<(String, String)>,
        file_len: usize,
    }

    async fn upload(
        State(seen): State<Arc<Mutex<Seen>>>,
        headers: HeaderMap,
        mut multipart: Multipart,
    ) -> axum::Json<Value> {
        let mut seen = seen.lock().await;
        seen.auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                seen.file_len = field.bytes().await.unwrap().len();
            } else {
                let value = field.text().await.unwrap();
                seen.fields.push((name, value));
            }
        }
        axum::Json(serde_json::json!({ "id": "post-1", "status": "queued" }))
    }

    #[tokio::test]
    async fn uploads_multipart_with_bearer_token() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let app = Router::new().route("/upload", post(upload)).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("short.mp4");
        std::fs::write(&video, vec![7u8; 1024]).unwrap();

        let p = publisher(Some(format!("http://{addr}/upload")), Some("secret"));
        let receipt = p.publish(&video, &build_metadata("Hello world. More.")).await.unwrap();
        assert_eq!(receipt["id"], "post-1");

        let seen = seen.lock().await;
        assert_eq!(seen.auth.as_deref(), Some("Bearer secret"));
        assert_eq!(seen.file_len, 1024);
        assert!(seen.fields.contains(&("title".to_string(), "Hello world.".to_string())));
        assert!(seen.fields.contains(&("tags".to_string(), "brainrot,shorts,absurd".to_string())));
    }
}
