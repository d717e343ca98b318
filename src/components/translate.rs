//! Text translation
//!
//! [`Translator`] asks a translation web service for a translation without blocking its
//! context: the request runs on a tokio executor and `GotTranslation` is raised back on the
//! context's own thread. Failures are reported through `ErrorOccurred`.

use crate::runtime::component::{Component, ComponentContainer, HandlesEventDispatching};
use crate::runtime::errors::ErrorCode;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

pub const TRANSLATE_SERVICE_URL: &str = "https://translate.yandex.net/api/v1.5/tr.json/translate";

/// Fetches the raw JSON body of a translation response.
#[async_trait]
pub trait TranslationService: Send + Sync {
    async fn request(&self, api_key: &str, language: &str, text: &str) -> Result<String>;
}

pub struct HttpTranslationService {
    client: reqwest::Client,
    url: String,
}

impl HttpTranslationService {
    pub fn new() -> Self {
        Self::with_url(TRANSLATE_SERVICE_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl Default for HttpTranslationService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranslationService for HttpTranslationService {
    async fn request(&self, api_key: &str, language: &str, text: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("key", api_key), ("lang", language), ("text", text)])
            .send()
            .await
            .context("Failed to reach translation service")?;
        // Non-200 codes come back in the JSON body, so the status is not checked here.
        response
            .text()
            .await
            .context("Failed to read translation response")
    }
}

#[derive(Debug, Deserialize)]
struct TranslationResponse {
    code: serde_json::Value,
    text: Vec<String>,
}

/// Extracts `(response code, translation)` from a service response.
pub fn parse_translation(body: &str) -> Result<(String, String)> {
    let response: TranslationResponse =
        serde_json::from_str(body).context("Failed to parse translation response")?;
    let translation = response
        .text
        .into_iter()
        .next()
        .context("Translation response has no text")?;
    let code = match response.code {
        serde_json::Value::String(code) => code,
        other => other.to_string(),
    };
    Ok((code, translation))
}

/// Translation component. Usable in forms and tasks.
pub struct Translator {
    name: String,
    container: Weak<dyn ComponentContainer>,
    api_key: String,
    service: Arc<dyn TranslationService>,
    executor: Handle,
    self_ref: Weak<Translator>,
}

impl Translator {
    /// Creates the translator and adds it to `container`. Requests run on `executor`.
    pub fn new(
        container: &Arc<dyn ComponentContainer>,
        name: impl Into<String>,
        api_key: impl Into<String>,
        service: Arc<dyn TranslationService>,
        executor: Handle,
    ) -> Arc<Self> {
        let translator = Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            container: Arc::downgrade(container),
            api_key: api_key.into(),
            service,
            executor,
            self_ref: self_ref.clone(),
        });
        container.add(translator.clone());
        translator
    }

    /// `RequestTranslation`: translates `text` into `language` (`"es"` or `"en-es"`).
    pub fn request_translation(&self, language: &str, text: &str) {
        if self.api_key.is_empty() {
            self.report(ErrorCode::TranslateNoKeyFound);
            return;
        }
        let Some(translator) = self.self_ref.upgrade() else {
            return;
        };
        info!("{} requesting translation to {}", self.name, language);
        let language = language.to_string();
        let text = text.to_string();
        self.executor
            .spawn(async move { translator.perform_request(language, text).await });
    }

    async fn perform_request(self: Arc<Self>, language: String, text: String) {
        let body = match self.service.request(&self.api_key, &language, &text).await {
            Ok(body) => body,
            Err(err) => {
                warn!("{}: {:#}", self.name, err);
                self.report(ErrorCode::TranslateServiceNotAvailable);
                return;
            }
        };
        let (code, translation) = match parse_translation(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("{}: {:#}", self.name, err);
                self.report(ErrorCode::TranslateJsonResponse);
                return;
            }
        };

        let Some(container) = self.container.upgrade() else {
            debug!("{} outlived its container; dropping translation", self.name);
            return;
        };
        let translator = self.clone();
        let posted = container.run_on_context_thread(Box::new(move || {
            translator.got_translation(&code, &translation)
        }));
        if let Err(err) = posted {
            warn!("{} could not deliver translation: {}", self.name, err);
        }
    }

    /// `GotTranslation(responseCode, translation)`
    pub fn got_translation(&self, response_code: &str, translation: &str) {
        let Some(container) = self.container.upgrade() else {
            return;
        };
        container.runtime().dispatcher().dispatch_event(
            self,
            "GotTranslation",
            &[json!(response_code), json!(translation)],
        );
    }

    fn report(&self, code: ErrorCode) {
        match self.container.upgrade() {
            Some(container) => {
                container.dispatch_error_occurred_event(&self.name, "RequestTranslation", code, &[])
            }
            None => warn!("{} dropped error {}", self.name, code.number()),
        }
    }
}

impl Component for Translator {
    fn component_name(&self) -> &str {
        &self.name
    }

    fn dispatch_delegate(&self) -> Option<Arc<dyn HandlesEventDispatching>> {
        self.container.upgrade()?.delegate()
    }
}
