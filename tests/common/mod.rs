#![allow(dead_code)]

use anyhow::{anyhow, Result};
use casitas_sync::backend::FormBackend;
use casitas_sync::model::{AttachedFile, FormType};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone)]
pub struct SubmitCall {
    pub form_type: FormType,
    pub payload: Value,
    pub fields: Vec<String>,
}

/// Scripted backend: each `submit` pops the next response, defaulting to
/// success once the script runs out.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    responses: Arc<Mutex<VecDeque<Result<String>>>>,
    submit_calls: Arc<Mutex<Vec<SubmitCall>>>,
    select_calls: Arc<Mutex<Vec<(String, String)>>>,
    hang: Option<Duration>,
    reachable: bool,
}

impl RecordingBackend {
    pub fn with_responses(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            reachable: true,
            ..Default::default()
        }
    }

    pub fn hanging(delay: Duration) -> Self {
        Self {
            hang: Some(delay),
            reachable: true,
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub async fn submit_calls(&self) -> Vec<SubmitCall> {
        self.submit_calls.lock().await.clone()
    }

    pub async fn select_calls(&self) -> Vec<(String, String)> {
        self.select_calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl FormBackend for RecordingBackend {
    async fn ping(&self) -> Result<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(anyhow!("network unreachable"))
        }
    }

    async fn submit(
        &self,
        form_type: FormType,
        payload: &Value,
        files: &[AttachedFile],
    ) -> Result<String> {
        self.submit_calls.lock().await.push(SubmitCall {
            form_type,
            payload: payload.clone(),
            fields: files.iter().map(|f| f.field.clone()).collect(),
        });
        if let Some(delay) = self.hang {
            tokio::time::sleep(delay).await;
        }
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok("remote-id".into()))
    }

    async fn select(&self, table: &str, query: &str) -> Result<String> {
        self.select_calls
            .lock()
            .await
            .push((table.to_string(), query.to_string()));
        Ok(format!(r#"[{{"table":"{}"}}]"#, table))
    }
}
