//! Historical context from the memory worker.
//!
//! Builds a short query from the current call (recent failure, file, command,
//! strategy) and keeps the closest knowledge entry when it is near enough.
//! The match is left in state where the hindsight gate picks it up.

use crate::hook::{basename, truncate_chars, ToolCall};
use crate::memory_client::MemoryClient;
use crate::state::SessionState;
use serde_json::{json, Value};

pub const COLLECTION: &str = "knowledge";
pub const N_RESULTS: u32 = 3;

/// Cosine distance; lower is closer
pub const RELEVANCE_THRESHOLD: f64 = 0.5;

const MAX_QUERY_PARTS: usize = 3;
const MAX_COMMAND_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMatch {
    pub id: String,
    pub document: String,
    pub distance: f64,
    pub context: String,
}

pub fn query_text(call: &ToolCall, state: &SessionState) -> String {
    let mut parts = Vec::new();
    if let Some(failure) = &state.recent_test_failure {
        if !failure.pattern.is_empty() {
            parts.push(format!("error: {}", failure.pattern));
        }
    }
    let path = call.target_path();
    if !path.is_empty() {
        parts.push(basename(path).to_string());
    }
    if call.tool_name == "Bash" && !call.command().is_empty() {
        parts.push(truncate_chars(call.command(), MAX_COMMAND_CHARS).to_string());
    }
    if !state.current_strategy_id.is_empty() {
        parts.push(format!("strategy: {}", state.current_strategy_id));
    }
    parts.truncate(MAX_QUERY_PARTS);
    parts.join(" ")
}

/// First row of a column-major query result (`{"ids": [[...]], ...}`)
fn first_row<'a>(result: &'a Value, key: &str) -> &'a [Value] {
    result
        .get(key)
        .and_then(|v| v.get(0))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Closest entry within `RELEVANCE_THRESHOLD`
pub fn best_match(result: &Value) -> Option<(String, String, f64)> {
    let ids = first_row(result, "ids");
    let documents = first_row(result, "documents");
    let distances = first_row(result, "distances");
    if documents.is_empty() || distances.is_empty() {
        return None;
    }
    let (idx, distance) = distances
        .iter()
        .enumerate()
        .filter_map(|(i, d)| d.as_f64().map(|d| (i, d)))
        .min_by(|a, b| a.1.total_cmp(&b.1))?;
    if distance > RELEVANCE_THRESHOLD {
        return None;
    }
    let document = documents.get(idx).and_then(Value::as_str).unwrap_or("");
    let id = ids.get(idx).and_then(Value::as_str).unwrap_or("");
    Some((id.to_string(), document.to_string(), distance))
}

/// Query memory for the call and record a close match in state.
/// Worker failures mean no match.
pub fn evaluate(
    call: &ToolCall,
    state: &mut SessionState,
    memory: &MemoryClient,
) -> Option<MemoryMatch> {
    let query = query_text(call, state);
    if query.is_empty() {
        return None;
    }
    let result = match memory.query(COLLECTION, &[query.as_str()], N_RESULTS, None) {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(error = %e, "mentor memory query failed");
            return None;
        }
    };
    let (id, document, distance) = best_match(&result)?;

    let context = format!(
        "Historical match (distance={:.3}): {}",
        distance,
        truncate_chars(&document, 200)
    );
    state.mentor_memory_match = Some(json!({
        "id": id,
        "document": truncate_chars(&document, 500),
        "distance": distance,
        "query": truncate_chars(&query, 200),
    }));
    state.mentor_historical_context = truncate_chars(&context, 500).to_string();
    tracing::debug!(distance, "mentor memory match");

    Some(MemoryMatch {
        id,
        document,
        distance,
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TestFailure;

    #[test]
    fn test_query_text_parts() {
        let mut state = SessionState::new_at(0.0);
        state.recent_test_failure = Some(TestFailure {
            pattern: "KeyError:".into(),
            timestamp: 0.0,
            command: "pytest".into(),
        });
        state.current_strategy_id = "retry-with-cache".into();
        let edit = ToolCall::post("Edit", json!({"file_path": "/p/src/app.py"}));
        assert_eq!(query_text(&edit, &state), "error: KeyError: app.py strategy: retry-with-cache");

        let state = SessionState::new_at(0.0);
        let bash = ToolCall::post("Bash", json!({"command": "cargo test -p core"}));
        assert_eq!(query_text(&bash, &state), "cargo test -p core");
        assert_eq!(query_text(&ToolCall::post("Glob", json!({})), &state), "");
    }

    #[test]
    fn test_best_match_threshold() {
        let result = json!({
            "ids": [["m1", "m2"]],
            "documents": [["far", "near"]],
            "distances": [[0.9, 0.42]],
        });
        assert_eq!(
            best_match(&result),
            Some(("m2".to_string(), "near".to_string(), 0.42))
        );

        let far = json!({"ids": [["m1"]], "documents": [["far"]], "distances": [[0.51]]});
        assert_eq!(best_match(&far), None);
        assert_eq!(best_match(&json!({"ids": [[]]})), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_evaluate_records_match() {
        use crate::config::{MemoryConfig, Paths};
        use crate::memory_client::test_support::serve;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        let server = serve(
            &paths,
            vec![
                "{\"ok\":true,\"result\":{\"ids\":[[\"m7\"]],\"documents\":[[\"Fixed KeyError in app.py by guarding the lookup\"]],\"distances\":[[0.25]]}}\n",
            ],
        );
        let memory = MemoryClient::new(&paths, &MemoryConfig::default());
        let mut state = SessionState::new_at(0.0);
        let edit = ToolCall::post("Edit", json!({"file_path": "/p/app.py"}));

        let found = evaluate(&edit, &mut state, &memory).unwrap();
        assert_eq!(found.id, "m7");
        assert_eq!(
            found.context,
            "Historical match (distance=0.250): Fixed KeyError in app.py by guarding the lookup"
        );
        assert_eq!(state.mentor_memory_match.as_ref().unwrap()["id"], "m7");
        assert_eq!(state.mentor_historical_context, found.context);

        let seen = server.join().unwrap();
        assert_eq!(seen[0]["method"], "query");
        assert_eq!(seen[0]["collection"], "knowledge");
        assert_eq!(seen[0]["params"]["query_texts"], json!(["app.py"]));
        assert_eq!(seen[0]["params"]["n_results"], 3);
    }
}
