use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::{Config, Tables};
use crate::model::{AttachedFile, FormType};

pub mod cloudinary;
pub mod model;

pub use cloudinary::CloudinaryUploader;

/// Remote side of a submission: the hosted REST database plus the image CDN.
#[async_trait]
pub trait FormBackend: Send + Sync {
    /// Succeeds when the REST endpoint answers at all.
    async fn ping(&self) -> Result<()>;

    /// Upload `files`, store the form row and return the remote row id.
    async fn submit(
        &self,
        form_type: FormType,
        payload: &Value,
        files: &[AttachedFile],
    ) -> Result<String>;

    /// Raw JSON body of `GET /rest/v1/{table}?{query}`.
    async fn select(&self, table: &str, query: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: Url,
    anon_key: String,
    tables: Tables,
    uploader: CloudinaryUploader,
}

impl fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("casitas-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        let mut base = cfg.supabase.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).with_context(|| format!("invalid supabase url {}", base))?;
        let uploader = CloudinaryUploader::new(http.clone(), &cfg.cloudinary)?;
        Ok(Self {
            http,
            base_url,
            anon_key: cfg.supabase.anon_key.clone(),
            tables: cfg.supabase.tables.clone(),
            uploader,
        })
    }

    fn table_for(&self, form_type: FormType) -> &str {
        match form_type {
            FormType::Revision => &self.tables.revision,
            FormType::Note => &self.tables.note,
        }
    }

    fn table_url(&self, table: &str, query: Option<&str>) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("rest/v1/{}", table))
            .context("invalid REST table url")?;
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            url.set_query(Some(q));
        }
        Ok(url)
    }

    /// Request carrying the project key headers every REST call needs.
    pub fn build_request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key));
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", "application/json")
                .header("Prefer", "return=representation")
                .json(body);
        }
        builder.build().context("failed to build REST request")
    }

    pub fn build_insert_request(&self, form_type: FormType, payload: &Value) -> Result<reqwest::Request> {
        let url = self.table_url(self.table_for(form_type), None)?;
        self.build_request(Method::POST, url, Some(payload))
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String> {
        debug!(method = %request.method(), url = %request.url(), "REST request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach REST endpoint")?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("rate limited by REST endpoint: {}", body);
            return Err(anyhow!("received 429 from REST endpoint: {}", body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "REST endpoint error: {}", body);
            return Err(anyhow!("REST error {}: {}", status, body));
        }
        res.text().await.context("failed to read REST response")
    }
}

/// Write each uploaded URL into the payload under its field name.
pub fn attach_urls(payload: &Value, urls: &[(String, String)]) -> Result<Value> {
    let mut merged = payload.clone();
    if urls.is_empty() {
        return Ok(merged);
    }
    let Some(obj) = merged.as_object_mut() else {
        return Err(anyhow!("form payload must be a JSON object to carry attachments"));
    };
    for (field, url) in urls {
        obj.insert(field.clone(), Value::String(url.clone()));
    }
    Ok(merged)
}

#[async_trait]
impl FormBackend for SupabaseClient {
    async fn ping(&self) -> Result<()> {
        let url = self.base_url.join("rest/v1/").context("invalid REST url")?;
        let request = self.build_request(Method::GET, url, None)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("REST endpoint unreachable")?;
        if res.status().is_server_error() {
            return Err(anyhow!("REST endpoint unhealthy: {}", res.status()));
        }
        Ok(())
    }

    async fn submit(
        &self,
        form_type: FormType,
        payload: &Value,
        files: &[AttachedFile],
    ) -> Result<String> {
        let mut urls = Vec::with_capacity(files.len());
        for file in files {
            let url = self
                .uploader
                .upload(file)
                .await
                .with_context(|| format!("failed to upload attachment {}", file.field))?;
            urls.push((file.field.clone(), url));
        }
        let body = attach_urls(payload, &urls)?;

        let request = self.build_insert_request(form_type, &body)?;
        let text = self.execute(request).await?;
        let rows: Value = serde_json::from_str(&text).context("invalid REST response JSON")?;
        let id = model::remote_id(&rows);
        info!(%form_type, remote_id = %id, files = files.len(), "form stored remotely");
        Ok(id)
    }

    async fn select(&self, table: &str, query: &str) -> Result<String> {
        let query = if query.is_empty() { "select=*" } else { query };
        let url = self.table_url(table, Some(query))?;
        let request = self.build_request(Method::GET, url, None)?;
        self.execute(request).await
    }
}
