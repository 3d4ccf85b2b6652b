use async_trait::async_trait;
use foreman_core::ForemanResult;
use foreman_orchestrator::{ReasoningService, SearchResult, SearchService};

/// Deterministic stand-in for a reasoning model: echoes the task header and
/// how much upstream context it was given.
pub struct EchoReasoning;

#[async_trait]
impl ReasoningService for EchoReasoning {
    async fn submit(&self, prompt: &str, params: &serde_json::Value) -> ForemanResult<String> {
        let header = prompt
            .lines()
            .find(|line| line.starts_with("TASK ["))
            .unwrap_or("TASK")
            .trim_end_matches(':');
        let upstream = prompt.matches("RESULT OF [").count();
        let role = params
            .get("role")
            .and_then(|r| r.as_str())
            .unwrap_or("agent");
        Ok(format!(
            "[offline {role}] {header}: processed with {upstream} upstream result(s)"
        ))
    }
}

/// Returns one canned reference per query.
pub struct EchoSearch;

#[async_trait]
impl SearchService for EchoSearch {
    async fn query(&self, query: &str, _params: &serde_json::Value) -> ForemanResult<Vec<SearchResult>> {
        Ok(vec![SearchResult {
            title: format!("Offline reference for: {query}"),
            url: "offline://reference".to_string(),
            snippet: String::new(),
        }])
    }
}
