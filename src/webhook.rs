//! HTTP front-end feeding claims into the server's inbound channel.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tripwire::Tripwire;

use crate::error::DyndnsError;
use crate::record::UpdateRecordRequest;

/// Router with `POST /update`.
pub fn router(sender: mpsc::Sender<UpdateRecordRequest>) -> Router {
    Router::new()
        .route("/update", post(update))
        .with_state(sender)
}

async fn update(
    State(sender): State<mpsc::Sender<UpdateRecordRequest>>,
    Json(request): Json<UpdateRecordRequest>,
) -> StatusCode {
    debug!(host = %request.record.host, "received update request via webhook");
    match sender.send(request).await {
        Ok(()) => StatusCode::OK,
        Err(_) => {
            warn!("inbound channel closed, rejecting webhook request");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Serve the webhook on `listener` until the tripwire fires.
pub async fn serve(
    listener: TcpListener,
    sender: mpsc::Sender<UpdateRecordRequest>,
    tripwire: Tripwire,
) -> Result<(), DyndnsError> {
    info!(addr = %listener.local_addr()?, "webhook listening");
    axum::serve(listener, router(sender))
        .with_graceful_shutdown(tripwire)
        .await?;
    info!("webhook stopped");
    Ok(())
}
