use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{DraftReceipt, DraftSubmission, PublishClient, Volume};
use crate::errors::PublishError;
use crate::quill_config::PublishConfig;

/// Query string every backend route expects.
const COMMON_QUERY: [(&str, &str); 2] = [("aid", "2503"), ("app_name", "muye_novel")];

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

/// Form-post client for the author backend, authenticated by session cookie.
pub struct HttpPublishClient {
    client: reqwest::Client,
    base_url: String,
    cookie: Option<String>,
    config: PublishConfig,
}

impl HttpPublishClient {
    /// The session cookie is read from `config.cookie_env`.
    pub fn new(config: &PublishConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            cookie: std::env::var(&config.cookie_env).ok(),
            config: config.clone(),
        }
    }

    pub fn has_cookie(&self) -> bool {
        self.cookie.is_some()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .query(&COMMON_QUERY);
        match &self.cookie {
            Some(cookie) => request.header(reqwest::header::COOKIE, cookie),
            None => request,
        }
    }

    async fn call(&self, request: reqwest::RequestBuilder, path: &str) -> Result<Value, PublishError> {
        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Http(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PublishError::Http(e.to_string()))?;
        debug!(path, status = status.as_u16(), body = %body.chars().take(200).collect::<String>(), "Publish backend replied");

        if body.trim().is_empty() {
            return Err(PublishError::Http(format!("{path} returned an empty body (HTTP {status})")));
        }
        unwrap_envelope(&body)
    }

    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value, PublishError> {
        let request = self.request(reqwest::Method::POST, path).form(form);
        self.call(request, path).await
    }

    fn draft_form<'a>(&self, draft: &'a DraftSubmission) -> Vec<(&'static str, &'a str)> {
        vec![
            ("book_id", draft.book_id.as_str()),
            ("title", draft.title.as_str()),
            ("content", draft.html.as_str()),
            ("volume_id", draft.volume.id.as_str()),
            ("volume_name", draft.volume.name.as_str()),
        ]
    }
}

/// Check the `{code, message, data}` envelope and return `data`.
fn unwrap_envelope(body: &str) -> Result<Value, PublishError> {
    let envelope: Envelope = serde_json::from_str(body).map_err(|e| {
        PublishError::Http(format!(
            "non-JSON reply ({e}): {}",
            body.chars().take(300).collect::<String>()
        ))
    })?;
    if envelope.code != 0 {
        return Err(PublishError::Api {
            code: envelope.code,
            message: envelope.message,
        });
    }
    Ok(envelope.data)
}

/// Ids come back as numbers or strings depending on the route.
fn id_field(data: &Value, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_volumes(data: &Value) -> Vec<Volume> {
    let list = match data {
        Value::Array(items) => items.as_slice(),
        _ => data
            .get("volume_list")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
    };
    list.iter()
        .filter_map(|v| {
            Some(Volume {
                id: id_field(v, "volume_id")?,
                name: v
                    .get("volume_name")
                    .and_then(Value::as_str)
                    .unwrap_or("第一卷：默认")
                    .to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl PublishClient for HttpPublishClient {
    async fn volumes(&self, book_id: &str) -> Result<Vec<Volume>, PublishError> {
        let path = &self.config.paths.volumes;
        let request = self
            .request(reqwest::Method::GET, path)
            .query(&[("book_id", book_id)]);
        let data = self.call(request, path).await?;
        Ok(parse_volumes(&data))
    }

    async fn submit_draft(&self, draft: &DraftSubmission) -> Result<DraftReceipt, PublishError> {
        // A new chapter needs a slot before its content can be saved
        let item_id = match &draft.item_id {
            Some(id) => id.clone(),
            None => {
                let data = self
                    .post_form(&self.config.paths.new_draft, &self.draft_form(draft))
                    .await?;
                id_field(&data, "item_id").ok_or(PublishError::MissingItemId)?
            }
        };

        let mut form = self.draft_form(draft);
        form.push(("item_id", item_id.as_str()));
        let data = self.post_form(&self.config.paths.save_draft, &form).await?;

        Ok(DraftReceipt {
            item_id: id_field(&data, "item_id").unwrap_or_else(|| item_id.clone()),
            version: id_field(&data, "version")
                .or_else(|| id_field(&data, "item_version"))
                .unwrap_or_else(|| chrono::Utc::now().timestamp().to_string()),
        })
    }

    async fn publish(&self, _book_id: &str, draft: &DraftSubmission, item_id: &str) -> Result<(), PublishError> {
        let mut form = self.draft_form(draft);
        form.push(("item_id", item_id));
        self.post_form(&self.config.paths.publish, &form).await?;
        Ok(())
    }

    async fn record_history(&self, book_id: &str, item_id: &str, version: &str) -> Result<(), PublishError> {
        let form = [("book_id", book_id), ("item_id", item_id), ("version", version)];
        self.post_form(&self.config.paths.history, &form).await?;
        Ok(())
    }
}
