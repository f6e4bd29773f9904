use axum::{
    routing::{get, post},
    Json,
};
use marquee_core::HealthReply;
use serde_json::Value;

use crate::{context::ServerContext, errors::ServerError, Router};

pub(super) fn router() -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
}

async fn rpc_handler(context: ServerContext, body: String) -> Result<Json<Value>, ServerError> {
    let reply = context.cluster.handle_rpc(&body).await?;

    Ok(Json(reply))
}

async fn health_handler(context: ServerContext) -> Json<HealthReply> {
    Json(HealthReply {
        status: "ok".to_string(),
        node_id: context.cluster.node_id().to_string(),
    })
}
