use async_trait::async_trait;
use foreman_core::ForemanResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Turns a prompt into text.
///
/// Implementations report retryable failures as
/// [`ForemanError::TransientService`](foreman_core::ForemanError::TransientService)
/// and permanent ones as [`ForemanError::Service`](foreman_core::ForemanError::Service).
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn submit(&self, prompt: &str, params: &serde_json::Value) -> ForemanResult<String>;
}

/// One hit from a [`SearchService`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Gathers facts for research-first roles. Same failure contract as
/// [`ReasoningService`].
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn query(&self, query: &str, params: &serde_json::Value) -> ForemanResult<Vec<SearchResult>>;
}

/// External collaborators injected into the coordinator.
#[derive(Clone)]
pub struct Services {
    pub reasoning: Arc<dyn ReasoningService>,
    /// Without a search service, research-first roles go straight to reasoning.
    pub search: Option<Arc<dyn SearchService>>,
}

impl Services {
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        Self {
            reasoning,
            search: None,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchService>) -> Self {
        self.search = Some(search);
        self
    }
}
