use crate::db;
use crate::executor;
use crate::models::{Channel, ChannelSyncResult};
use crate::probes;
use serde_json::Value;
use sqlx::{Pool, Postgres};
use std::time::Duration;

// ============================================================
// Model catalog sync: reconcile upstream /v1/models into the store
// ============================================================

const SYNC_TIMEOUT: Duration = Duration::from_secs(15);

/// Pull the channel's model list and add missing entries. Never removes
/// models: stale names keep their probe history. Errors land in the
/// result rather than propagating.
pub async fn sync_channel(pool: &Pool<Postgres>, channel: &Channel) -> ChannelSyncResult {
    let mut result = ChannelSyncResult {
        channel_id: channel.id.clone(),
        channel_name: channel.name.clone(),
        added: 0,
        total: 0,
        error: None,
    };

    let names = match fetch_model_names(channel).await {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!("Catalog sync for {} failed: {}", channel.name, e);
            result.error = Some(e);
            return result;
        }
    };

    match db::replace_or_add_models(pool, &channel.id, &names).await {
        Ok(added) => {
            result.added = added;
            result.total = match db::list_models_for_sync(pool, &channel.id).await {
                Ok(all) => all.len(),
                Err(_) => names.len(),
            };
            if added > 0 {
                tracing::info!("Catalog sync added {} models to {}", added, channel.name);
            }
        }
        Err(e) => {
            result.total = names.len();
            result.error = Some(format!("store update failed: {}", e));
        }
    }
    result
}

async fn fetch_model_names(channel: &Channel) -> Result<Vec<String>, String> {
    let client = executor::build_proxied_client(channel.proxy_url.as_deref())?;
    let url = format!("{}/v1/models", probes::normalize_base_url(&channel.base_url));

    let response = client
        .get(&url)
        .timeout(SYNC_TIMEOUT)
        .header("Authorization", format!("Bearer {}", channel.api_key))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status().as_u16()));
    }

    let body: Value = response.json().await.map_err(|e| e.to_string())?;
    let names = parse_model_list(&body);
    if names.is_empty() {
        return Err("empty model list".to_string());
    }
    Ok(names)
}

/// Accepts both common list shapes: `{data:[{id}]}` and `{models:[{name}]}`.
pub fn parse_model_list(body: &Value) -> Vec<String> {
    if let Some(data) = body["data"].as_array() {
        return data
            .iter()
            .filter_map(|m| m["id"].as_str())
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(models) = body["models"].as_array() {
        return models
            .iter()
            .filter_map(|m| m["name"].as_str())
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();
    }
    Vec::new()
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod parse_model_list_tests {
        use super::*;

        #[test]
        fn parses_openai_style_data_array() {
            let body = json!({"object": "list", "data": [{"id": "gpt-4"}, {"id": "gpt-4o"}]});
            assert_eq!(parse_model_list(&body), vec!["gpt-4", "gpt-4o"]);
        }

        #[test]
        fn parses_models_name_array() {
            let body = json!({"models": [{"name": "gemini-pro"}, {"name": "gemini-ultra"}]});
            assert_eq!(parse_model_list(&body), vec!["gemini-pro", "gemini-ultra"]);
        }

        #[test]
        fn data_shape_wins_when_both_present() {
            let body = json!({"data": [{"id": "a"}], "models": [{"name": "b"}]});
            assert_eq!(parse_model_list(&body), vec!["a"]);
        }

        #[test]
        fn entries_without_the_expected_field_are_skipped() {
            let body = json!({"data": [{"id": "good"}, {"name": "wrong-field"}, {"id": ""}]});
            assert_eq!(parse_model_list(&body), vec!["good"]);
        }

        #[test]
        fn unknown_shapes_yield_nothing() {
            assert!(parse_model_list(&json!({"items": []})).is_empty());
            assert!(parse_model_list(&json!("nope")).is_empty());
        }
    }
}
