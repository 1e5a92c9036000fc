use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Url};
use tracing::{info, warn};

use super::model::UploadResponse;
use crate::config::Cloudinary;
use crate::model::AttachedFile;

/// Unsigned uploads to the image CDN.
#[derive(Clone, Debug)]
pub struct CloudinaryUploader {
    http: Client,
    base_url: Url,
    cloud_name: String,
    upload_preset: String,
}

impl CloudinaryUploader {
    pub fn new(http: Client, cfg: &Cloudinary) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("invalid cloudinary base url {}", cfg.base_url))?;
        Ok(Self {
            http,
            base_url,
            cloud_name: cfg.cloud_name.clone(),
            upload_preset: cfg.upload_preset.clone(),
        })
    }

    pub fn upload_url(&self) -> Result<Url> {
        self.base_url
            .join(&format!("v1_1/{}/image/upload", self.cloud_name))
            .context("invalid cloudinary upload url")
    }

    /// Upload one attachment and return its public HTTPS URL.
    pub async fn upload(&self, file: &AttachedFile) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type)
            .with_context(|| format!("invalid content type {}", file.content_type))?;
        let form = reqwest::multipart::Form::new()
            .text("upload_preset", self.upload_preset.clone())
            .part("file", part);

        let res = self
            .http
            .post(self.upload_url()?)
            .multipart(form)
            .send()
            .await
            .context("failed to reach image CDN")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, field = %file.field, "image upload rejected");
            return Err(anyhow!("image upload failed {}: {}", status, body));
        }

        let uploaded: UploadResponse = res
            .json()
            .await
            .context("invalid image CDN response")?;
        info!(
            field = %file.field,
            public_id = uploaded.public_id.as_deref().unwrap_or(""),
            "uploaded attachment"
        );
        Ok(uploaded.secure_url)
    }
}
