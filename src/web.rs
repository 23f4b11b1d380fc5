use crate::config::{ConfigError, ReaderConfig};
use crate::flashcards::FlashcardRecord;
use crate::overrides::FuriganaOverrideRecord;
use crate::popup::{PopupError, PopupView, RubyChoice};
use crate::render::RenderedLine;
use crate::session::{ReaderSession, SessionError};
use crate::source::{AnySource, DICT_PATH};
use crate::store::{EXPORT_FILENAME, StoreExport};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};

type SharedState = Arc<AppState>;

pub struct AppState {
    pub session: ReaderSession<AnySource>,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub reader: ReaderConfig,
    /// Directory published under the sidecar mount, for running without a separate content server.
    pub content_root: Option<PathBuf>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            reader: ReaderConfig::default(),
            content_root: None,
        }
    }
}

#[derive(Debug)]
pub enum WebError {
    Io(std::io::Error),
    Config(ConfigError),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::Io(err) => write!(f, "io error: {err}"),
            WebError::Config(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WebError {}

impl From<std::io::Error> for WebError {
    fn from(value: std::io::Error) -> Self {
        WebError::Io(value)
    }
}

impl From<ConfigError> for WebError {
    fn from(value: ConfigError) -> Self {
        WebError::Config(value)
    }
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let session = config.reader.build_session()?;
    let state = Arc::new(AppState { session });
    let router = build_router(state, config.content_root.clone());
    info!(
        %config.addr,
        content = %config.reader.content,
        serve_dir = ?config.content_root,
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(value: SessionError) -> Self {
        match &value {
            SessionError::NoDocument
            | SessionError::Popup(PopupError::NoSelection | PopupError::NotEditing) => {
                ApiError::conflict(value.to_string())
            }
            SessionError::NotInteractive { .. }
            | SessionError::Popup(
                PopupError::NothingToEdit | PopupError::ReadingOutOfRange { .. },
            ) => ApiError::bad_request(value.to_string()),
            SessionError::Store(err) => {
                warn!(error = %err, "store operation failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: value.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

fn build_router(state: SharedState, content_root: Option<PathBuf>) -> Router {
    let router = Router::new()
        .route("/healthz", get(health))
        .route("/api/document", get(api_document))
        .route("/api/documents/:name", get(api_open_document))
        .route("/api/click", post(api_click))
        .route("/api/popup", get(api_popup))
        .route("/api/popup/close", post(api_close_popup))
        .route("/api/flashcards", get(api_flashcards))
        .route("/api/flashcards/toggle", post(api_toggle_flashcard))
        .route("/api/furigana/edit", post(api_begin_edit))
        .route("/api/furigana/save", post(api_save_edit))
        .route("/api/furigana/remove", post(api_remove_override))
        .route("/api/export", get(api_export))
        .with_state(state);
    let router = match content_root {
        Some(root) => router.nest_service(DICT_PATH, ServeDir::new(root)),
        None => router,
    };
    router
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "sidecar-web" }))
}

#[derive(Debug, Serialize)]
struct DocumentPayload {
    doc_name: String,
    lines: Vec<RenderedLine>,
}

#[derive(Debug, Deserialize)]
struct ClickParams {
    line_number: usize,
    morpheme_idx: usize,
}

#[derive(Debug, Deserialize)]
struct HitParams {
    group: usize,
    position: usize,
}

#[derive(Debug, Deserialize)]
struct SaveParams {
    readings: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TogglePayload {
    added: bool,
    record: FlashcardRecord,
    popup: Option<PopupView>,
}

fn document_payload(state: &AppState) -> Result<DocumentPayload, ApiError> {
    let doc_name = state.session.doc_name().ok_or(SessionError::NoDocument)?;
    let lines = state
        .session
        .render()
        .ok_or_else(|| ApiError::not_found(format!("document {doc_name} is unavailable")))?;
    Ok(DocumentPayload { doc_name, lines })
}

async fn api_document(State(state): State<SharedState>) -> Result<Json<DocumentPayload>, ApiError> {
    document_payload(&state).map(Json)
}

async fn api_open_document(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<DocumentPayload>, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::bad_request("document name must not be empty"));
    }
    state.session.open_document(&name).await?;
    document_payload(&state).map(Json)
}

async fn api_click(
    State(state): State<SharedState>,
    Json(params): Json<ClickParams>,
) -> Result<Json<Option<PopupView>>, ApiError> {
    state
        .session
        .click_displayed(params.line_number, params.morpheme_idx)
        .await?;
    Ok(Json(state.session.popup_view()?))
}

async fn api_popup(State(state): State<SharedState>) -> Result<Json<Option<PopupView>>, ApiError> {
    Ok(Json(state.session.popup_view()?))
}

async fn api_close_popup(State(state): State<SharedState>) -> StatusCode {
    state.session.close_popup();
    StatusCode::NO_CONTENT
}

async fn api_flashcards(State(state): State<SharedState>) -> Json<Vec<FlashcardRecord>> {
    Json(state.session.flashcard_list())
}

async fn api_toggle_flashcard(
    State(state): State<SharedState>,
    Json(params): Json<HitParams>,
) -> Result<Json<TogglePayload>, ApiError> {
    let hit = state
        .session
        .hit_at(params.group, params.position)
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "no dictionary hit at group {} position {}",
                params.group, params.position
            ))
        })?;
    let toggled = state.session.toggle_flashcard(&hit)?;
    Ok(Json(TogglePayload {
        added: toggled.added,
        record: toggled.record,
        popup: state.session.popup_view()?,
    }))
}

async fn api_begin_edit(State(state): State<SharedState>) -> Result<Json<Vec<RubyChoice>>, ApiError> {
    Ok(Json(state.session.begin_edit()?))
}

async fn api_save_edit(
    State(state): State<SharedState>,
    Json(params): Json<SaveParams>,
) -> Result<Json<FuriganaOverrideRecord>, ApiError> {
    for (index, reading) in params.readings.into_iter().enumerate() {
        state.session.set_reading(index, reading)?;
    }
    Ok(Json(state.session.save_edit()?))
}

async fn api_remove_override(
    State(state): State<SharedState>,
) -> Result<Json<FuriganaOverrideRecord>, ApiError> {
    Ok(Json(state.session.remove_override()?))
}

async fn api_export(State(state): State<SharedState>) -> impl IntoResponse {
    let disposition = format!("attachment; filename=\"{EXPORT_FILENAME}\"");
    let export: StoreExport = state.session.export();
    ([(header::CONTENT_DISPOSITION, disposition)], Json(export))
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use crate::cache::DictCache;
    use crate::source::MemorySource;
    use crate::store::DocumentStore;
    use axum::{body, body::Body, http::Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn memory_source() -> MemorySource {
        let manifest = json!([
            "Header text",
            {
                "line": "本を読む",
                "hash": "abc123",
                "furigana": [["本"], ["を"], [{"ruby": "読", "rt": "よ"}, "む"]],
            },
        ]);
        let dict = json!({
            "line": "本を読む",
            "furigana": [["本"], ["を"], [{"ruby": "読", "rt": "よ"}, "む"]],
            "bunsetsus": [],
            "dictHits": [
                [],
                [],
                [[{
                    "wordId": "yomu",
                    "score": 1.0,
                    "search": "読む",
                    "run": "読む",
                    "runIdx": [2, 3],
                    "summary": "読む よむ read",
                }]],
            ],
        });
        MemorySource::new()
            .with_file("story.json", manifest.to_string())
            .with_file("line-abc123.json", dict.to_string())
    }

    fn test_router(content_root: Option<PathBuf>) -> Router {
        let session = ReaderSession::new(
            Arc::new(AnySource::Memory(memory_source())),
            DocumentStore::in_memory(),
            Arc::new(DictCache::default()),
        );
        build_router(Arc::new(AppState { session }), content_root)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn post_json(uri: &str, payload: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let router = test_router(None);
        let (status, payload) = send(&router, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["status"], "ok");
    }

    #[tokio::test]
    async fn opening_a_document_renders_it() {
        let router = test_router(None);
        let (status, payload) = send(&router, get("/api/documents/story.json")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["doc_name"], "story.json");
        assert_eq!(payload["lines"][0]["kind"], "plain");
        assert_eq!(payload["lines"][1]["kind"], "annotated");
        assert_eq!(payload["lines"][1]["morphemes"][2]["furigana"][0]["rt"], "よ");

        let (status, _) = send(&router, get("/api/document")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_documents_are_not_found() {
        let router = test_router(None);
        let (status, payload) = send(&router, get("/api/documents/missing.md")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(payload["error"].as_str().unwrap().contains("missing.md"));
    }

    #[tokio::test]
    async fn click_before_open_is_a_conflict() {
        let router = test_router(None);
        let (status, _) = send(
            &router,
            post_json("/api/click", json!({"line_number": 1, "morpheme_idx": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn click_toggle_and_list_flashcards() {
        let router = test_router(None);
        send(&router, get("/api/documents/story.json")).await;
        let (status, popup) = send(
            &router,
            post_json("/api/click", json!({"line_number": 1, "morpheme_idx": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(popup["state"]["state"], "selected");
        assert_eq!(popup["hits"][0][0]["word_id"], "yomu");

        let (status, toggled) = send(
            &router,
            post_json("/api/flashcards/toggle", json!({"group": 0, "position": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(toggled["added"], true);
        assert_eq!(toggled["popup"]["hits"][0][0]["tagged_here"], true);

        let (_, listed) = send(&router, get("/api/flashcards")).await;
        assert_eq!(listed[0]["wordId"], "yomu");

        let (status, _) = send(
            &router,
            post_json("/api/flashcards/toggle", json!({"group": 3, "position": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn furigana_edit_round_trip() {
        let router = test_router(None);
        send(&router, get("/api/documents/story.json")).await;
        send(
            &router,
            post_json("/api/click", json!({"line_number": 1, "morpheme_idx": 2})),
        )
        .await;
        let (status, choices) = send(&router, post_json("/api/furigana/edit", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(choices[0]["rt"], "よ");

        let (status, record) = send(
            &router,
            post_json("/api/furigana/save", json!({"readings": ["どく"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["lineHash"], "abc123");
        assert_eq!(record["overrides"]["2"][0]["rt"], "どく");

        let (_, document) = send(&router, get("/api/document")).await;
        assert_eq!(document["lines"][1]["morphemes"][2]["overridden"], true);

        let (status, _) = send(
            &router,
            post_json("/api/furigana/save", json!({"readings": ["x"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn close_hides_the_popup() {
        let router = test_router(None);
        send(&router, get("/api/documents/story.json")).await;
        send(
            &router,
            post_json("/api/click", json!({"line_number": 1, "morpheme_idx": 0})),
        )
        .await;
        let (status, _) = send(&router, post_json("/api/popup/close", json!({}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, popup) = send(&router, get("/api/popup")).await;
        assert!(popup.is_null());
    }

    #[tokio::test]
    async fn export_is_an_attachment() {
        let router = test_router(None);
        let response = router.clone().oneshot(get("/api/export")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains(EXPORT_FILENAME));
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let export: StoreExport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(export.total_rows, 0);
    }

    #[tokio::test]
    async fn content_root_is_served_under_the_sidecar_mount() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("line-ff.json"), b"{}").unwrap();
        let router = test_router(Some(dir.path().to_path_buf()));
        let response = router
            .clone()
            .oneshot(get("/dict-hits-per-line/line-ff.json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn http_source_degrades_lines_whose_sidecar_is_missing() {
        use crate::decode::{DocLine, Document, load_document};
        use crate::source::{ContentSource, FetchError, HttpSource, HttpSourceConfig};

        let dir = tempfile::tempdir().unwrap();
        let dict = json!({
            "line": "本",
            "furigana": [["本"]],
            "bunsetsus": [],
            "dictHits": [[]],
        });
        std::fs::write(dir.path().join("line-aa.json"), dict.to_string()).unwrap();
        std::fs::write(
            dir.path().join("doc.md"),
            "# Title\n<line id=\"hash-aa\">本</line>\n<line id=\"hash-gone\">犬</line>",
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = test_router(Some(dir.path().to_path_buf()));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let source = Arc::new(
            HttpSource::new(format!("http://{addr}/"), &HttpSourceConfig::default()).unwrap(),
        );
        match source.fetch("line-gone.json").await {
            Err(FetchError::Status { path, status }) => {
                assert_eq!(path, "line-gone.json");
                assert_eq!(status, 404);
            }
            other => panic!("expected a 404 status error, got {other:?}"),
        }

        let cache = Arc::new(DictCache::unbounded());
        let Some(Document::Markdown(lines)) = load_document(&source, &cache, "doc.md").await else {
            panic!("markdown document should load over HTTP");
        };
        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[0], DocLine::Raw(text) if text == "# Title"));
        assert!(matches!(&lines[1], DocLine::Annotated { hash, dict } if hash == "aa" && dict.line == "本"));
        assert!(matches!(&lines[2], DocLine::Raw(text) if text.contains("hash-gone")));
        assert_eq!(cache.len(), 1);
    }
}
