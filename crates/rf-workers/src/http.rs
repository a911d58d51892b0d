//! reqwest-backed clients for the classifier, the summarizer and the
//! notification webhook. Every request carries its own timeout; a timeout or
//! a non-2xx status is an error so the job is retried.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rf_core::traits::{Classifier, ClassifierVerdict, Summarizer, WebhookClient};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

const USER_AGENT: &str = concat!("rusty-forum/", env!("CARGO_PKG_VERSION"));

pub fn client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("building http client")
}

fn authorized(request: reqwest::RequestBuilder, api_key: Option<&SecretString>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key.expose_secret()),
        None => request,
    }
}

async fn send_json(request: reqwest::RequestBuilder, what: &str) -> anyhow::Result<Value> {
    let response = request.send().await.with_context(|| format!("{what} request failed"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{what} returned {status}: {}", body.chars().take(200).collect::<String>());
    }
    response
        .json::<Value>()
        .await
        .with_context(|| format!("{what} returned invalid json"))
}

/// Moderation-style classifier: `{"model", "input"}` in,
/// `{"results": [{"flagged", "categories"}]}` out.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

impl HttpClassifier {
    pub fn new(client: reqwest::Client, endpoint: &str, api_key: Option<SecretString>, model: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            model: model.to_string(),
        }
    }
}

pub fn parse_verdict(response: &Value) -> anyhow::Result<ClassifierVerdict> {
    let result = response
        .get("results")
        .and_then(|r| r.get(0))
        .unwrap_or(response);
    let flagged = result
        .get("flagged")
        .and_then(Value::as_bool)
        .context("classifier response has no 'flagged' field")?;
    Ok(ClassifierVerdict {
        flagged,
        categories: result.get("categories").cloned().unwrap_or(Value::Null),
    })
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str, timeout: Duration) -> anyhow::Result<ClassifierVerdict> {
        let request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&json!({ "model": self.model, "input": text }));
        let response = send_json(authorized(request, self.api_key.as_ref()), "classifier").await?;
        parse_verdict(&response)
    }
}

pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

impl HttpSummarizer {
    pub fn new(client: reqwest::Client, endpoint: &str, api_key: Option<SecretString>, model: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, prompt: &str, timeout: Duration) -> anyhow::Result<Value> {
        let request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&json!({ "model": self.model, "input": prompt }));
        send_json(authorized(request, self.api_key.as_ref()), "summarizer").await
    }
}

pub struct HttpWebhook {
    client: reqwest::Client,
}

impl HttpWebhook {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookClient for HttpWebhook {
    async fn post_json(&self, url: &str, body: &Value, timeout: Duration) -> anyhow::Result<()> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .context("webhook request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_from_results_array() {
        let v = json!({
            "id": "modr-1",
            "results": [{ "flagged": true, "categories": { "harassment": true, "spam": false } }]
        });
        let verdict = parse_verdict(&v).unwrap();
        assert!(verdict.flagged);
        assert_eq!(verdict.categories["harassment"], true);
    }

    #[test]
    fn test_verdict_from_flat_object() {
        let verdict = parse_verdict(&json!({ "flagged": false })).unwrap();
        assert!(!verdict.flagged);
        assert!(verdict.categories.is_null());
    }

    #[test]
    fn test_verdict_requires_flag() {
        assert!(parse_verdict(&json!({ "results": [{}] })).is_err());
    }

    #[test]
    fn test_client_builds() {
        assert!(client().is_ok());
    }
}
