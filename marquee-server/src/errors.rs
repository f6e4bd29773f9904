use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::error;
use marquee_cluster::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl ServerError {
    fn as_status_code(&self) -> StatusCode {
        match self {
            Self::Rpc(RpcError::Decode(_)) => StatusCode::BAD_REQUEST,
            Self::Rpc(RpcError::RoomNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Rpc(RpcError::GroupClosed) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.as_status_code();

        // Log server errors when they happen
        if status.as_u16() >= 500 {
            error!("Peer request failed: {}", self);
        }

        (status, self.to_string()).into_response()
    }
}
