use std::collections::{HashSet, VecDeque};

use crate::consensus::machine::{ConsensusContext, SubtaskSpec};
use crate::error::DuhError;
use crate::manager::ProviderManager;
use crate::provider::{PromptMessage, ResponseFormat, SendOptions};

pub const DEFAULT_MAX_SUBTASKS: usize = 7;

/// Extracts a JSON object from free-form model output, trying three
/// strategies in order: a direct parse of the whole body, a fenced
/// ```` ```json ... ``` ```` block, then the outermost balanced `{...}`
/// found anywhere in the text.
pub fn extract_json(text: &str) -> Result<serde_json::Value, DuhError> {
    let stripped = text.trim();
    if stripped.is_empty() {
        return Err(DuhError::Consensus("empty text: no JSON object found".into()));
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stripped) {
        if value.is_object() {
            return Ok(value);
        }
    }

    if let Some(block) = extract_fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&block) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    if let Some(block) = extract_balanced_braces(text) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&block) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    Err(DuhError::Consensus("no valid JSON object found in text".into()))
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let fence_start = text.find("```")?;
    let after_fence = &text[fence_start + 3..];
    let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
    let fence_end = after_fence.find("```")?;
    Some(after_fence[..fence_end].trim().to_string())
}

fn extract_balanced_braces(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_subtasks(value: &serde_json::Value) -> Result<Vec<SubtaskSpec>, DuhError> {
    let raw = value
        .get("subtasks")
        .and_then(|v| v.as_array())
        .ok_or_else(|| DuhError::Consensus("expected 'subtasks' array in JSON response".into()))?;

    let mut result = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        let label = item
            .get("label")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DuhError::Consensus(format!("subtask {i} missing or invalid 'label'")))?;

        let description = item
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DuhError::Consensus(format!("subtask {i} missing or invalid 'description'")))?;

        let dependencies = match item.get("dependencies") {
            None => HashSet::new(),
            Some(serde_json::Value::Array(deps)) => {
                let mut set = HashSet::new();
                for dep in deps {
                    let dep = dep
                        .as_str()
                        .ok_or_else(|| DuhError::Consensus(format!("subtask {i} has non-string dependency")))?;
                    set.insert(dep.to_string());
                }
                set
            }
            Some(_) => {
                return Err(DuhError::Consensus(format!("subtask {i} 'dependencies' must be an array")));
            }
        };

        result.push(SubtaskSpec {
            label: label.to_string(),
            description: description.to_string(),
            dependencies,
        });
    }
    Ok(result)
}

/// Validates subtask count, label uniqueness, dependency referential
/// integrity, absence of self-dependencies, and acyclicity (Kahn's
/// algorithm — indegree array + adjacency list + FIFO ready queue).
pub fn validate_subtask_dag(subtasks: &[SubtaskSpec], max_subtasks: usize) -> Result<(), DuhError> {
    let count = subtasks.len();
    if count < 2 {
        return Err(DuhError::Consensus(format!("too few subtasks: {count} (minimum 2)")));
    }
    if count > max_subtasks {
        return Err(DuhError::Consensus(format!("too many subtasks: {count} (maximum {max_subtasks})")));
    }

    let labels: HashSet<&str> = subtasks.iter().map(|s| s.label.as_str()).collect();
    if labels.len() != count {
        return Err(DuhError::Consensus("duplicate subtask labels".into()));
    }

    for subtask in subtasks {
        for dep in &subtask.dependencies {
            if !labels.contains(dep.as_str()) {
                return Err(DuhError::Consensus(format!(
                    "subtask '{}' depends on unknown label '{dep}'",
                    subtask.label
                )));
            }
            if dep == &subtask.label {
                return Err(DuhError::Consensus(format!("subtask '{}' has self-dependency", subtask.label)));
            }
        }
    }

    let mut indegree: std::collections::HashMap<&str, usize> =
        subtasks.iter().map(|s| (s.label.as_str(), 0)).collect();
    let mut adjacency: std::collections::HashMap<&str, Vec<&str>> =
        subtasks.iter().map(|s| (s.label.as_str(), Vec::new())).collect();
    for subtask in subtasks {
        for dep in &subtask.dependencies {
            adjacency.get_mut(dep.as_str()).unwrap().push(&subtask.label);
            *indegree.get_mut(subtask.label.as_str()).unwrap() += 1;
        }
    }

    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&label, _)| label)
        .collect();
    if ready.is_empty() {
        return Err(DuhError::Consensus("cycle detected: no root subtasks (all have dependencies)".into()));
    }

    let mut visited = 0;
    while let Some(node) = ready.pop_front() {
        visited += 1;
        for &neighbor in &adjacency[node] {
            let degree = indegree.get_mut(neighbor).unwrap();
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(neighbor);
            }
        }
    }

    if visited != count {
        return Err(DuhError::Consensus("cycle detected in subtask dependency graph".into()));
    }
    Ok(())
}

fn build_decompose_prompt(question: &str, max_subtasks: usize) -> Vec<PromptMessage> {
    let system = format!(
        "You are an expert at breaking complex questions into smaller, manageable \
         subtasks. Decompose the given question into a directed acyclic graph (DAG) \
         of subtasks.\n\n\
         Return ONLY a JSON object with a single key \"subtasks\" containing an array \
         of subtask objects. Each subtask object must have:\n\
         - \"label\": a short unique identifier\n\
         - \"description\": a clear description of what this subtask should answer\n\
         - \"dependencies\": an array of labels this subtask depends on (empty if none)\n\n\
         Rules:\n\
         - Produce between 2 and {max_subtasks} subtasks\n\
         - Dependencies must reference labels of other subtasks in the list\n\
         - The DAG must be acyclic\n\
         - At least one subtask must have no dependencies\n\
         - Labels must be unique"
    );
    vec![
        PromptMessage::system(system),
        PromptMessage::user(format!("Decompose this question into subtasks:\n\n{question}")),
    ]
}

/// Calls the cheapest eligible model with JSON response format, extracts
/// and validates the subtask DAG, and populates `ctx.subtasks`. The
/// context must already be in the DECOMPOSE state.
pub async fn handle_decompose(
    ctx: &mut ConsensusContext,
    pm: &ProviderManager,
    max_subtasks: usize,
) -> Result<Vec<SubtaskSpec>, DuhError> {
    use crate::consensus::machine::ConsensusState;
    if ctx.state != ConsensusState::Decompose {
        return Err(DuhError::Consensus(format!(
            "handle_decompose requires DECOMPOSE state, got {:?}",
            ctx.state
        )));
    }

    let models = pm.list_all_models();
    let cheapest = models
        .into_iter()
        .min_by(|a, b| a.input_cost_per_mtok.partial_cmp(&b.input_cost_per_mtok).unwrap())
        .ok_or_else(|| DuhError::Consensus("no models available for decomposition".into()))?;
    let (provider, model_id) = pm.get_provider(&cheapest.model_ref())?;

    let messages = build_decompose_prompt(&ctx.question, max_subtasks);
    let mut opts = SendOptions::new();
    opts.response_format = Some(ResponseFormat::Json);
    opts.temperature = Some(0.3);
    opts.max_tokens = Some(2048);

    let response = provider
        .send(&messages, &model_id, &opts)
        .await
        .map_err(|e| DuhError::Consensus(format!("decomposition model call failed: {e}")))?;
    pm.record_usage(&cheapest, &response.usage)?;

    let value = extract_json(&response.content)
        .map_err(|e| DuhError::Consensus(format!("failed to extract JSON from decomposition response: {e}")))?;
    let subtasks = parse_subtasks(&value)?;
    validate_subtask_dag(&subtasks, max_subtasks)?;

    ctx.subtasks = subtasks.clone();
    Ok(subtasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(label: &str, deps: &[&str]) -> SubtaskSpec {
        SubtaskSpec {
            label: label.to_string(),
            description: format!("describe {label}"),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn direct_json_parse_succeeds() {
        let value = extract_json(r#"{"subtasks": []}"#).unwrap();
        assert!(value.get("subtasks").is_some());
    }

    #[test]
    fn fenced_json_block_is_extracted() {
        let text = "Here you go:\n```json\n{\"subtasks\": [1, 2]}\n```\nHope that helps.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["subtasks"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn bare_balanced_braces_are_extracted_from_surrounding_prose() {
        let text = "Sure, the decomposition is {\"subtasks\": [{\"a\": 1}]} as requested.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["subtasks"][0]["a"], 1);
    }

    #[test]
    fn empty_text_fails_extraction() {
        assert!(extract_json("   ").is_err());
    }

    #[test]
    fn valid_two_node_dag_passes() {
        let subtasks = vec![spec("a", &[]), spec("b", &["a"])];
        assert!(validate_subtask_dag(&subtasks, 7).is_ok());
    }

    #[test]
    fn too_few_subtasks_rejected() {
        let subtasks = vec![spec("a", &[])];
        assert!(validate_subtask_dag(&subtasks, 7).is_err());
    }

    #[test]
    fn cycle_is_rejected() {
        let subtasks = vec![spec("a", &["c"]), spec("b", &["a"]), spec("c", &["b"])];
        let err = validate_subtask_dag(&subtasks, 7).unwrap_err();
        assert!(matches!(err, DuhError::Consensus(_)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let subtasks = vec![spec("a", &[]), spec("b", &["nope"])];
        assert!(validate_subtask_dag(&subtasks, 7).is_err());
    }

    #[test]
    fn self_dependency_is_rejected() {
        let subtasks = vec![spec("a", &["a"]), spec("b", &[])];
        assert!(validate_subtask_dag(&subtasks, 7).is_err());
    }

    #[test]
    fn duplicate_labels_rejected() {
        let subtasks = vec![spec("a", &[]), spec("a", &[])];
        assert!(validate_subtask_dag(&subtasks, 7).is_err());
    }
}
