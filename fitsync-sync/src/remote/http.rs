/// PostgREST-style HTTP remote
///
/// Tables are exposed under `/rest/v1/<table>`. Inserts ask for the stored
/// representation back so remote-assigned ids are available to the caller.

use async_trait::async_trait;
use fitsync_core::{Division, Split};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

use super::{
    NewDivision, NewSplit, RemoteQuery, RemoteStore, RemoteWorkoutLog, REMOTE_DIVISIONS,
    REMOTE_SPLITS, REMOTE_WORKOUT_LOGS,
};
use crate::error::RemoteError;

pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Unreachable(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    /// Authenticate as a signed-in user instead of the anonymous key
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, table))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn insert_returning<T, R>(&self, table: &str, rows: &T) -> Result<Vec<R>, RemoteError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(rows);
        let response = self.send(request).await?;
        response
            .json::<Vec<R>>()
            .await
            .map_err(|e| RemoteError::Decode(format!("{} insert: {}", table, e)))
    }
}

/// PostgREST filter operand for an equality match
fn filter_operand(value: &Value) -> String {
    match value {
        Value::String(s) => format!("eq.{}", s),
        other => format!("eq.{}", other),
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn insert_workout_logs(&self, rows: &[RemoteWorkoutLog]) -> Result<(), RemoteError> {
        let request = self
            .request(Method::POST, REMOTE_WORKOUT_LOGS)
            .header("Prefer", "return=minimal")
            .json(rows);
        self.send(request).await?;
        Ok(())
    }

    async fn insert_division(&self, division: &NewDivision) -> Result<Division, RemoteError> {
        let mut created: Vec<Division> = self
            .insert_returning(REMOTE_DIVISIONS, std::slice::from_ref(division))
            .await?;
        created
            .pop()
            .ok_or_else(|| RemoteError::Decode("division insert returned no row".to_string()))
    }

    async fn insert_splits(&self, splits: &[NewSplit]) -> Result<Vec<Split>, RemoteError> {
        if splits.is_empty() {
            return Ok(Vec::new());
        }
        let created: Vec<Split> = self.insert_returning(REMOTE_SPLITS, splits).await?;
        if created.len() != splits.len() {
            return Err(RemoteError::Decode(format!(
                "split insert returned {} rows for {}",
                created.len(),
                splits.len()
            )));
        }
        Ok(created)
    }

    async fn select(&self, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        let mut params: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
        for (field, value) in &query.filters {
            params.push((field.clone(), filter_operand(value)));
        }
        if let Some(field) = &query.order_by {
            params.push(("order".to_string(), format!("{}.asc", field)));
        }

        let request = self.request(Method::GET, &query.table).query(&params);
        let response = self.send(request).await?;
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RemoteError::Decode(format!("{} select: {}", query.table, e)))
    }

    async fn delete_division(&self, id: &str) -> Result<(), RemoteError> {
        let request = self
            .request(Method::DELETE, REMOTE_DIVISIONS)
            .query(&[("id", format!("eq.{}", id))]);
        self.send(request).await?;
        Ok(())
    }
}
