use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
  extract::State,
  http::StatusCode,
  response::{sse::Event, sse::KeepAlive, IntoResponse, Response, Sse},
  routing::get,
  routing::post,
  Json, Router,
};
use futures_util::{stream, Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

use crate::{
  catalog::{Catalog, API_VERSION},
  engine::{SyncEngine, SyncRequest},
  error::GalleryError,
  model::{EventMessage, ExhibitId, ExhibitsResponse, PullRequest},
};

#[derive(Clone)]
pub struct ApiState {
  pub catalog: Arc<Catalog>,
  pub engine: SyncEngine,
}

pub fn router(state: ApiState) -> Router {
  Router::new()
    .route("/health", get(|| async { Json("OK") }))
    .route("/gallery", get(get_gallery))
    .route("/gallery/exhibits", get(get_exhibits))
    .route("/gallery/pull", post(post_pull).get(get_events))
    .layer(CorsLayer::permissive())
    .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ApiState) -> anyhow::Result<()> {
  let listener = tokio::net::TcpListener::bind(addr).await?;
  tracing::info!(%addr, "gallery server listening");
  axum::serve(listener, router(state)).await?;
  Ok(())
}

async fn get_gallery(State(st): State<ApiState>) -> Json<serde_json::Value> {
  Json(serde_json::json!({
    "title": st.catalog.title(),
    "apiVersion": API_VERSION,
  }))
}

async fn get_exhibits(State(st): State<ApiState>) -> Json<ExhibitsResponse> {
  Json(ExhibitsResponse {
    exhibits: st.catalog.views(),
    api_version: API_VERSION.to_string(),
  })
}

async fn post_pull(State(st): State<ApiState>, Json(req): Json<PullRequest>) -> Response {
  let Some(exhibit) = st.catalog.get(req.exhibit_id) else {
    let err = GalleryError::UnknownExhibit(req.exhibit_id);
    return (
      StatusCode::NOT_ACCEPTABLE,
      Json(serde_json::json!({ "message": err.to_string() })),
    )
      .into_response();
  };

  let request = SyncRequest {
    exhibit_id: req.exhibit_id,
    source: exhibit.git.clone(),
    target: st.catalog.local_path(exhibit),
    branch: req.branch.or_else(|| exhibit.branch.clone()),
    depth: req.depth.or(exhibit.depth),
    account: exhibit.account.clone(),
    token: exhibit.token.clone(),
  };

  // Fire and forget: admission (and any admission timeout) reports through
  // the event stream, never through this response.
  let engine = st.engine.clone();
  tokio::spawn(async move {
    engine.request_sync(request).await;
  });

  (StatusCode::OK, Json(serde_json::json!({}))).into_response()
}

/// JSON payloads for one subscriber: a connected frame, the last known
/// message per exhibit (ordered by id), then live events. Consecutive
/// duplicates per exhibit are suppressed, which also covers a message
/// present in both the replayed backlog and the live stream.
fn message_stream(engine: &SyncEngine) -> impl Stream<Item = String> {
  // Subscribe before snapshotting the cache so nothing falls in between.
  let rx = engine.subscribe();
  let backlog = engine.last_messages();

  let connected = stream::once(async { "{\"phase\":\"connected\"}".to_string() });

  let mut last_sent: HashMap<ExhibitId, EventMessage> = HashMap::new();
  let events = stream::iter(backlog)
    // A subscriber that lagged behind the broadcast buffer skips ahead.
    .chain(BroadcastStream::new(rx).filter_map(|msg| async move { msg.ok() }))
    .filter_map(move |msg: EventMessage| {
      let fresh = last_sent.get(&msg.exhibit_id) != Some(&msg);
      if fresh {
        last_sent.insert(msg.exhibit_id, msg.clone());
      }
      let item = fresh.then(|| {
        serde_json::to_string(&msg).unwrap_or_else(|_| "{\"phase\":\"error\"}".to_string())
      });
      async move { item }
    });

  connected.chain(events)
}

/// Persistent server-to-client event stream. Replays the last known message
/// per exhibit on (re)connect so a client that reloaded mid-sync resumes
/// seeing progress; never terminates on its own.
async fn get_events(State(st): State<ApiState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let stream = message_stream(&st.engine)
    .map(|json| Ok::<Event, Infallible>(Event::default().data(json)));

  Sse::new(stream).keep_alive(
    KeepAlive::new()
      .interval(Duration::from_secs(15))
      .text("keep-alive"),
  )
}
