use crate::services::SearchResult;
use crate::types::{AgentRole, Task};
use serde::{Deserialize, Serialize};

/// Rate-limit key for reasoning calls.
pub const REASONING_KEY: &str = "reasoning";
/// Rate-limit key for search calls.
pub const SEARCH_KEY: &str = "search";

/// How tasks for one role are executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub role: AgentRole,
    pub instructions: String,
    /// Run a search before reasoning and feed the results into the prompt.
    pub research_first: bool,
    /// Rate-limit key of the reasoning service this role calls.
    pub reasoning_key: String,
    /// Rate-limit key of the search service this role calls.
    pub search_key: String,
    /// Extra parameters forwarded to the reasoning service.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One profile per role.
pub fn default_profiles() -> Vec<AgentProfile> {
    AgentRole::ALL.iter().map(|role| profile_for(*role)).collect()
}

fn profile_for(role: AgentRole) -> AgentProfile {
    let (instructions, research_first, temperature) = match role {
        AgentRole::Document => (DOCUMENT_INSTRUCTIONS, false, 0.4),
        AgentRole::Technical => (TECHNICAL_INSTRUCTIONS, true, 0.2),
        AgentRole::Compliance => (COMPLIANCE_INSTRUCTIONS, true, 0.1),
        AgentRole::Cost => (COST_INSTRUCTIONS, true, 0.2),
        AgentRole::Resource => (RESOURCE_INSTRUCTIONS, false, 0.2),
        AgentRole::Orchestration => (ORCHESTRATION_INSTRUCTIONS, false, 0.2),
    };
    AgentProfile {
        role,
        instructions: instructions.to_string(),
        research_first,
        reasoning_key: REASONING_KEY.to_string(),
        search_key: SEARCH_KEY.to_string(),
        params: serde_json::json!({ "temperature": temperature, "max_tokens": 4000 }),
    }
}

/// Assemble the reasoning prompt for `task`.
///
/// `upstream` holds `(key, output)` pairs of completed dependencies.
pub fn render_prompt(
    profile: &AgentProfile,
    task: &Task,
    upstream: &[(String, String)],
    research: &[SearchResult],
) -> String {
    let mut prompt = format!(
        "{}\n\nTASK [{}] (priority {}):\n{}\n",
        profile.instructions, task.key, task.priority, task.description
    );
    if !task.metadata.is_null() {
        prompt.push_str(&format!("\nDETAILS:\n{}\n", task.metadata));
    }
    for (key, output) in upstream {
        prompt.push_str(&format!("\nRESULT OF [{key}]:\n{output}\n"));
    }
    if !research.is_empty() {
        prompt.push_str("\nRESEARCH:\n");
        for hit in research {
            prompt.push_str(&format!("- {} ({}): {}\n", hit.title, hit.url, hit.snippet));
        }
    }
    prompt
}

const DOCUMENT_INSTRUCTIONS: &str = "\
You are the document specialist. Produce the requested construction document \
(contract, specification or plan) from the task details and upstream results. \
Follow the project's stated requirements and flag anything missing.";

const TECHNICAL_INSTRUCTIONS: &str = "\
You are the technical validation specialist. Check the specifications, materials, \
methods and timelines against current industry standards and best practice. \
List issues with severity and the correction you recommend.";

const COMPLIANCE_INSTRUCTIONS: &str = "\
You are the compliance specialist. Determine the building codes, safety rules and \
permits that apply, state whether the project meets each one, and list the \
actions needed to close every gap.";

const COST_INSTRUCTIONS: &str = "\
You are the cost analysis specialist. Estimate materials, labour and overhead, \
state your assumptions and current market prices used, and suggest where cost \
can be reduced without affecting quality.";

const RESOURCE_INSTRUCTIONS: &str = "\
You are the resource management specialist. Plan crew, equipment and material \
allocation for the task window, identify contention with other work, and \
propose a schedule. Do not reassign resources already granted.";

const ORCHESTRATION_INSTRUCTIONS: &str = "\
You are the project coordinator. Summarise the upstream results, identify \
decision points and open risks, and state which follow-up work is required.";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Priority, TaskStatus};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn task() -> Task {
        Task {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            key: "estimate".into(),
            description: "Estimate foundation cost".into(),
            assigned_agent: AgentRole::Cost,
            priority: Priority::HIGH,
            status: TaskStatus::InProgress,
            dependencies: BTreeSet::new(),
            unmet: BTreeSet::new(),
            resources: vec![],
            metadata: serde_json::json!({"site": "lot 7"}),
            output: None,
            failure_reason: None,
            seq: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_one_profile_per_role() {
        let profiles = default_profiles();
        assert_eq!(profiles.len(), AgentRole::ALL.len());
        let research: Vec<AgentRole> = profiles
            .iter()
            .filter(|p| p.research_first)
            .map(|p| p.role)
            .collect();
        assert_eq!(
            research,
            vec![AgentRole::Technical, AgentRole::Compliance, AgentRole::Cost]
        );
    }

    #[test]
    fn test_prompt_carries_context() {
        let profile = profile_for(AgentRole::Cost);
        let prompt = render_prompt(
            &profile,
            &task(),
            &[("specs".into(), "Concrete C30, 40m3".into())],
            &[SearchResult {
                title: "Concrete prices".into(),
                url: "https://prices.example/concrete".into(),
                snippet: "C30 at 120/m3".into(),
            }],
        );
        assert!(prompt.starts_with("You are the cost analysis specialist"));
        assert!(prompt.contains("TASK [estimate] (priority 5)"));
        assert!(prompt.contains("lot 7"));
        assert!(prompt.contains("RESULT OF [specs]:\nConcrete C30, 40m3"));
        assert!(prompt.contains("C30 at 120/m3"));
    }
}
