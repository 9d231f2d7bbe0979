use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use skipper_db::DbPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentReport {
    component: &'static str,
    readiness: Readiness,
    detail: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    readiness: Readiness,
    components: Vec<ComponentReport>,
    checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(db_pool)
}

pub async fn spawn(bind_address: &str, port: u16, db_pool: DbPool) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((bind_address, port)).await?;
    let address = listener.local_addr()?;

    info!(
        event_name = "system.health.start",
        bind_address = %address,
        "health endpoint listening"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(db_pool)).await {
            error!(
                event_name = "system.health.error",
                error = %error,
                "health endpoint terminated unexpectedly"
            );
        }
    });

    Ok(())
}

async fn health(State(pool): State<DbPool>) -> (StatusCode, Json<HealthResponse>) {
    let service = ComponentReport {
        component: "service",
        readiness: Readiness::Ready,
        detail: "agent runtime initialized".to_string(),
    };
    let database = database_report(&pool).await;

    let readiness = database.readiness;
    let status_code = match readiness {
        Readiness::Ready => StatusCode::OK,
        Readiness::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };

    let payload = HealthResponse {
        readiness,
        components: vec![service, database],
        checked_at: Utc::now().to_rfc3339(),
    };

    (status_code, Json(payload))
}

async fn database_report(pool: &DbPool) -> ComponentReport {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => ComponentReport {
            component: "database",
            readiness: Readiness::Ready,
            detail: "probe query succeeded".to_string(),
        },
        Err(error) => ComponentReport {
            component: "database",
            readiness: Readiness::Degraded,
            detail: format!("probe query failed: {error}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::Json;

    use skipper_db::connect_with_settings;

    use super::{health, Readiness};

    #[tokio::test]
    async fn health_is_ready_when_the_database_answers() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("pool should connect");

        let (status_code, Json(payload)) = health(State(pool.clone())).await;

        assert_eq!(status_code, StatusCode::OK);
        assert_eq!(payload.readiness, Readiness::Ready);
        assert!(payload.components.iter().all(|report| report.readiness == Readiness::Ready));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_degrades_when_the_pool_is_closed() {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 5)
            .await
            .expect("pool should connect");
        pool.close().await;

        let (status_code, Json(payload)) = health(State(pool)).await;

        assert_eq!(status_code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.readiness, Readiness::Degraded);
        let database = payload
            .components
            .iter()
            .find(|report| report.component == "database")
            .expect("database component present");
        assert_eq!(database.readiness, Readiness::Degraded);
    }
}
