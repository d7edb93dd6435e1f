use std::fmt::Display;
use std::future::Future;
use std::time::Instant;
use uuid::Uuid;

/// Action logger: every control-plane mutation is an action event with its own log id.
pub fn log_event(action_type: &str, status: &str, target: &str, error_message: Option<&str>) -> Uuid {
    log_event_with_metadata(action_type, status, target, error_message, None)
}

/// Log event with metadata (context info)
pub fn log_event_with_metadata(
    action_type: &str,
    status: &str,
    target: &str,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) -> Uuid {
    let log_id = Uuid::new_v4();
    let metadata = metadata.unwrap_or(serde_json::Value::Null);
    match error_message {
        Some(err) => tracing::warn!(
            %log_id, action_type, status, resource = target, %metadata, error = err,
            "📝 [action] {} - {} ({})", action_type, status, target
        ),
        None => tracing::info!(
            %log_id, action_type, status, resource = target, %metadata,
            "📝 [action] {} - {} ({})", action_type, status, target
        ),
    }
    log_id
}

/// Log event completion with duration
pub fn log_event_complete(
    log_id: Uuid,
    action_type: &str,
    status: &str,
    duration_ms: u64,
    error_message: Option<&str>,
) {
    match error_message {
        Some(err) => tracing::error!(
            %log_id, action_type, status, duration_ms, error = err,
            "❌ [action] {} failed after {}ms: {}", action_type, duration_ms, err
        ),
        None => tracing::info!(
            %log_id, action_type, status, duration_ms,
            "✅ [action] {} {} in {}ms", action_type, status, duration_ms
        ),
    }
}

/// Run `fut` as one action: `in_progress` before, `success`/`failed` with duration after.
pub async fn tracked<T, E, Fut>(
    action_type: &str,
    target: &str,
    metadata: Option<serde_json::Value>,
    fut: Fut,
) -> Result<T, E>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    let log_id = log_event_with_metadata(action_type, "in_progress", target, None, metadata);
    let started = Instant::now();
    let res = fut.await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match &res {
        Ok(_) => log_event_complete(log_id, action_type, "success", duration_ms, None),
        Err(e) => {
            let msg = e.to_string();
            log_event_complete(log_id, action_type, "failed", duration_ms, Some(&msg));
        }
    }
    res
}

/// Quick log for one-off events
pub fn log_quick(action_type: &str, target: &str, details: Option<&str>) {
    let log_id = log_event(action_type, "success", target, None);
    if let Some(details) = details {
        tracing::debug!(%log_id, details, "📝 [action] {} details", action_type);
    }
}
