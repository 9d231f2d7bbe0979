use serde_json::{Map, Value};
use uuid::Uuid;

use skipper_core::config::{AppConfig, LoadOptions};
use skipper_core::domain::autopilot::TriggerType;
use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};
use skipper_db::connect_with_settings;
use skipper_db::repositories::{OutboxRepository, SqlOutboxRepository};

use crate::commands::CommandResult;

pub fn run(
    user_id: &str,
    key: &str,
    event_type: &str,
    payload: Option<&str>,
) -> CommandResult {
    let Some(trigger) = TriggerType::from_event_type(event_type) else {
        return CommandResult::failure(
            "enqueue",
            "invalid_event_type",
            format!("unsupported event type `{event_type}` (expected manual|submission.evaluated)"),
            2,
        );
    };

    if user_id.trim().is_empty() || key.trim().is_empty() {
        return CommandResult::failure(
            "enqueue",
            "invalid_arguments",
            "both --user-id and --key must be non-empty",
            2,
        );
    }

    let payload_json = match build_payload(user_id, key, payload) {
        Ok(payload_json) => payload_json,
        Err(error) => {
            return CommandResult::failure(
                "enqueue",
                "invalid_payload",
                format!("--payload must be a JSON object: {error}"),
                2,
            );
        }
    };

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "enqueue",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "enqueue",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let dedup_key = format!("autopilot:{}:{key}", trigger.as_str());
    let event = OutboxEvent::new(
        OutboxEventId(Uuid::new_v4().to_string()),
        event_type,
        payload_json,
        dedup_key.clone(),
    );
    let event_id = event.id.0.clone();

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        SqlOutboxRepository::new(pool.clone())
            .enqueue(event)
            .await
            .map_err(|error| ("enqueue", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) => CommandResult::success(
            "enqueue",
            format!("enqueued event {event_id} with dedup key `{dedup_key}`"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("enqueue", error_class, message, exit_code)
        }
    }
}

fn build_payload(
    user_id: &str,
    key: &str,
    payload: Option<&str>,
) -> Result<String, serde_json::Error> {
    let mut map = match payload {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        },
        None => Map::new(),
    };

    // The runner looks these up when it turns the event into a run.
    map.entry("userId").or_insert_with(|| Value::String(user_id.to_string()));
    map.entry("key").or_insert_with(|| Value::String(key.to_string()));

    Ok(Value::Object(map).to_string())
}
