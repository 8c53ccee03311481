use crate::{
    auth::{self, AuthAlert, Claims, RegisterRequest},
    config::Config,
    files::{self, FileMeta},
};
use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Extension, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::io::ReaderStream;
use travel_api::{Conversation, Trip, User};
use travelcore::{
    conversations, feed,
    feed::FeedSubscription,
    messages, recommendations, trips,
    users::{self, normalize_email, ProfileUpdate},
    CoreError, DbPool, MessageFeed, NotificationSink, PoolDirectory, Preferences, TracingSink,
    WeatherClient,
};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub directory: Arc<PoolDirectory>,
    pub feed: Arc<MessageFeed>,
    pub sink: Arc<dyn NotificationSink>,
    pub preferences: Arc<Preferences>,
    pub weather: WeatherClient,
    pub file_dir: PathBuf,
    pub config: Config,
    pub jwt_secret: Arc<Vec<u8>>,
    pub login_limiter: auth::LoginRateLimiter,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let file_dir = config.data_dir.join("files");
        tokio::fs::create_dir_all(&file_dir).await?;
        let pool = travelcore::open_pool(config.data_dir.join("travel_connect.db"))?;
        let preferences = Preferences::open(config.data_dir.join("preferences.json")).await?;
        let weather = WeatherClient::new(
            &config.weather.base_url,
            &config.weather.api_key,
            &config.weather.api_host,
        )?;
        let jwt_secret = auth::load_or_create_secret(&config.data_dir.join("jwt.secret")).await?;
        Ok(Self {
            directory: Arc::new(PoolDirectory::new(pool.clone())),
            pool,
            feed: Arc::new(MessageFeed::default()),
            sink: Arc::new(TracingSink),
            preferences: Arc::new(preferences),
            weather,
            file_dir,
            config,
            jwt_secret: Arc::new(jwt_secret),
            login_limiter: auth::LoginRateLimiter::new(5, std::time::Duration::from_secs(60)),
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/api/files", post(upload_file))
        .route("/api/files/:id", get(download_file))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes() as usize));
    let protected = Router::new()
        .route("/api/token/refresh", post(refresh_token))
        .route("/api/me", get(me).put(update_me).delete(delete_me))
        .route("/api/recommendations", get(recommend))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/:id/name", put(rename_conversation))
        .route("/api/conversations/:id/group", post(convert_to_group))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/ws/conversations/:id", get(ws_handler))
        .route("/api/trips", get(list_trips).post(save_trip))
        .route("/api/trips/:id", get(get_trip).delete(delete_trip))
        .route("/api/trips/:id/conversation", post(link_trip))
        .route("/api/weather", get(weather))
        .route("/api/preferences", get(get_preferences).put(put_preferences))
        .merge(uploads)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if let Ok(claims) = auth::verify_jwt(&state.jwt_secret, token) {
                    req.extensions_mut().insert(claims);
                    return Ok(next.run(req).await);
                }
            }
        }
    }
    Err(StatusCode::UNAUTHORIZED)
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);
type ApiResult<T> = std::result::Result<T, ApiError>;

fn err(status: StatusCode, msg: &str) -> ApiError {
    (status, Json(ErrorResp { error: msg.into() }))
}

fn alert(status: StatusCode, alert: AuthAlert) -> ApiError {
    err(status, &alert.to_string())
}

fn core_err(e: CoreError) -> ApiError {
    match &e {
        CoreError::DocumentDoesNotExist | CoreError::MissingResource(_) => {
            err(StatusCode::NOT_FOUND, &e.to_string())
        }
        CoreError::InvalidCurrentUserEmail => err(StatusCode::UNAUTHORIZED, &e.to_string()),
        CoreError::InvalidEmail(_) => alert(StatusCode::BAD_REQUEST, AuthAlert::EmailFieldIssue),
        CoreError::EmailAlreadyExists(_) => alert(StatusCode::CONFLICT, AuthAlert::EmailAlreadyExists),
        CoreError::NoMembers | CoreError::UnknownMembers(_) | CoreError::EmptyMessage => {
            err(StatusCode::BAD_REQUEST, &e.to_string())
        }
        CoreError::DuplicateConversation => err(StatusCode::CONFLICT, &e.to_string()),
        CoreError::AccessDenied(_) => err(StatusCode::FORBIDDEN, &e.to_string()),
        CoreError::Http(_) => {
            tracing::warn!(error = %e, "upstream request failed");
            err(StatusCode::BAD_GATEWAY, "upstream_unavailable")
        }
        _ => {
            tracing::error!(error = %e, "request failed");
            err(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

/// Run `f` on a pooled connection off the async workers.
async fn blocking<T, F>(pool: &DbPool, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> travelcore::Result<T> + Send + 'static,
{
    let pool = pool.clone();
    let res = tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&*conn)
    })
    .await
    .map_err(|e| core_err(e.into()))?;
    res.map_err(core_err)
}

/// Load a conversation by its app-level id, requiring the caller to be a member.
async fn member_conversation(state: &AppState, id: &str, email: &str) -> ApiResult<Conversation> {
    let lookup = id.to_string();
    let conversation = blocking(&state.pool, move |conn| {
        conversations::find_by_custom_id(conn, &lookup)
    })
    .await?
    .ok_or_else(|| core_err(CoreError::DocumentDoesNotExist))?;
    if !conversation.has_member(&normalize_email(email)) {
        return Err(err(StatusCode::FORBIDDEN, "not_a_member"));
    }
    Ok(conversation)
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(|a| alert(StatusCode::BAD_REQUEST, a))?;
    let hash = auth::hash_password(&req.password)
        .map_err(|_| alert(StatusCode::INTERNAL_SERVER_ERROR, AuthAlert::RegistrationError))?;
    let user = blocking(&state.pool, move |conn| {
        users::register_user(conn, &req.user, &hash)
    })
    .await?;
    tracing::info!(email = %user.email, "registered");
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
struct LoginReq {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResp {
    token: String,
    user: User,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> ApiResult<impl IntoResponse> {
    let email = normalize_email(&req.email);
    if !state.login_limiter.check(&email).await {
        return Err(err(StatusCode::TOO_MANY_REQUESTS, "rate_limited"));
    }
    let lookup = email.clone();
    let found = blocking(&state.pool, move |conn| {
        let hash = users::password_hash(conn, &lookup)?;
        let user = users::fetch_profile(conn, &lookup)?;
        Ok(hash.zip(user))
    })
    .await?;
    let Some((hash, user)) = found else {
        return Err(alert(StatusCode::UNAUTHORIZED, AuthAlert::EmailOrPasswordError));
    };
    if !auth::verify_password(&req.password, &hash) {
        return Err(alert(StatusCode::UNAUTHORIZED, AuthAlert::EmailOrPasswordError));
    }
    let token = auth::issue_jwt(&state.jwt_secret, &user.email, auth::TOKEN_TTL)
        .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "token"))?;
    tracing::info!(%email, "signed in");
    Ok(Json(LoginResp { token, user }))
}

/// Reissue the caller's token once it is close to expiry; otherwise echo it back.
async fn refresh_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let email = claims.sub.clone();
    let user = blocking(&state.pool, move |conn| users::fetch_profile(conn, &email))
        .await?
        .ok_or_else(|| err(StatusCode::UNAUTHORIZED, "unknown_user"))?;
    let current = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let token = match current {
        Some(token) if !auth::needs_refresh(&claims, auth::REFRESH_WINDOW) => token.to_string(),
        _ => {
            tracing::debug!(email = %user.email, "token refreshed");
            auth::issue_jwt(&state.jwt_secret, &user.email, auth::TOKEN_TTL)
                .map_err(|_| err(StatusCode::INTERNAL_SERVER_ERROR, "token"))?
        }
    };
    Ok(Json(LoginResp { token, user }))
}

async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<User>> {
    blocking(&state.pool, move |conn| users::fetch_profile(conn, &claims.sub))
        .await?
        .map(Json)
        .ok_or_else(|| core_err(CoreError::DocumentDoesNotExist))
}

async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<Json<User>> {
    let user = blocking(&state.pool, move |conn| {
        users::update_profile(conn, &claims.sub, &update)
    })
    .await?;
    Ok(Json(user))
}

async fn delete_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    let removed = blocking(&state.pool, move |conn| users::delete_profile(conn, &claims.sub)).await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(core_err(CoreError::DocumentDoesNotExist))
    }
}

async fn recommend(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<String>>> {
    recommendations::recommend_buddies(&state.pool, &claims.sub)
        .await
        .map(Json)
        .map_err(core_err)
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Conversation>>> {
    conversations::conversations_for(&state.pool, state.directory.clone(), &claims.sub)
        .await
        .map(Json)
        .map_err(core_err)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationReq {
    member_emails: Vec<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationReq>,
) -> ApiResult<impl IntoResponse> {
    let conversation = conversations::start_conversation(
        &state.pool,
        state.directory.clone(),
        req.member_emails,
        &claims.sub,
    )
    .await
    .map_err(core_err)?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameReq {
    display_name: String,
}

async fn rename_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<RenameReq>,
) -> ApiResult<StatusCode> {
    if req.display_name.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "empty_name"));
    }
    member_conversation(&state, &id, &claims.sub).await?;
    blocking(&state.pool, move |conn| {
        conversations::rename_conversation(conn, &id, &req.display_name)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn convert_to_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    member_conversation(&state, &id, &claims.sub).await?;
    blocking(&state.pool, move |conn| conversations::convert_to_group(conn, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    member_conversation(&state, &id, &claims.sub).await?;
    let (_, list) = blocking(&state.pool, move |conn| messages::fetch_messages(conn, &id)).await?;
    Ok(Json(list))
}

#[derive(Deserialize)]
struct SendReq {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "mediaURL")]
    media_url: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(req): Json<SendReq>,
) -> ApiResult<impl IntoResponse> {
    let conversation = member_conversation(&state, &id, &claims.sub).await?;
    let email = claims.sub.clone();
    let sender_id = blocking(&state.pool, move |conn| users::current_user_id(conn, &email)).await?;
    let msg = feed::send_and_publish(
        &state.pool,
        &state.feed,
        &conversation.document_id,
        &sender_id,
        req.text,
        req.media_url,
    )
    .await
    .map_err(core_err)?;
    Ok((StatusCode::CREATED, Json(msg)))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    member_conversation(&state, &id, &claims.sub).await?;
    let sub = feed::subscribe(&state.pool, &state.feed, &id, state.sink.clone())
        .await
        .map_err(core_err)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, sub)))
}

async fn handle_socket(stream: WebSocket, mut sub: FeedSubscription) {
    let (mut sender, mut receiver) = stream.split();
    let snapshot = json!({
        "t": "snapshot",
        "conversation": sub.conversation().id,
        "messages": sub.snapshot(),
    });
    if sender.send(WsMessage::Text(snapshot.to_string())).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            update = sub.next_update() => {
                let Some(update) = update else { break };
                let payload = json!({
                    "t": "update",
                    "messages": update.messages,
                    "notification": update.notification,
                });
                if sender.send(WsMessage::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!(conversation = %sub.conversation().id, "feed socket closed");
}

async fn list_trips(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Trip>>> {
    blocking(&state.pool, move |conn| trips::fetch_all_trips(conn, &claims.sub))
        .await
        .map(Json)
}

async fn save_trip(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(trip): Json<Trip>,
) -> ApiResult<Json<Trip>> {
    let stored = trip.clone();
    blocking(&state.pool, move |conn| trips::save_trip(conn, &claims.sub, &stored)).await?;
    Ok(Json(trip))
}

async fn get_trip(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Trip>> {
    blocking(&state.pool, move |conn| trips::fetch_trip(conn, &claims.sub, &id))
        .await?
        .map(Json)
        .ok_or_else(|| core_err(CoreError::DocumentDoesNotExist))
}

async fn delete_trip(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if blocking(&state.pool, move |conn| trips::delete_trip(conn, &claims.sub, &id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(core_err(CoreError::DocumentDoesNotExist))
    }
}

#[derive(Deserialize)]
struct LinkReq {
    #[serde(rename = "conversationID")]
    conversation_id: String,
}

async fn link_trip(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<LinkReq>,
) -> ApiResult<StatusCode> {
    blocking(&state.pool, move |conn| {
        let tx = conn.unchecked_transaction()?;
        trips::link_conversation(&tx, &claims.sub, &id, &req.conversation_id)?;
        conversations::link_trip(&tx, &req.conversation_id, &id)?;
        tx.commit()?;
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct WeatherQuery {
    city: String,
}

async fn weather(
    State(state): State<AppState>,
    Query(q): Query<WeatherQuery>,
) -> ApiResult<impl IntoResponse> {
    let city = q.city.trim();
    if city.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "missing_city"));
    }
    let report = state.weather.forecast(city).await.map_err(core_err)?;
    Ok(Json(report))
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferencesBody {
    dark_mode: bool,
}

async fn get_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Json<PreferencesBody> {
    Json(PreferencesBody {
        dark_mode: state.preferences.dark_mode_for(&claims.sub).await,
    })
}

async fn put_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(body): Json<PreferencesBody>,
) -> ApiResult<Json<PreferencesBody>> {
    state
        .preferences
        .set_dark_mode_for(&claims.sub, body.dark_mode)
        .await
        .map_err(core_err)?;
    Ok(Json(body))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResp {
    file_id: String,
    #[serde(rename = "mediaURL")]
    media_url: String,
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let field = multipart
        .next_field()
        .await
        .map_err(|_| err(StatusCode::BAD_REQUEST, "invalid_multipart"))?
        .ok_or_else(|| err(StatusCode::BAD_REQUEST, "missing_file"))?;
    let name = field
        .file_name()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "file".into());
    let mime = field
        .content_type()
        .map(|m| m.to_string())
        .or_else(|| mime_guess::from_path(&name).first().map(|m| m.to_string()))
        .unwrap_or_else(|| "application/octet-stream".into());
    let data = field
        .bytes()
        .await
        .map_err(|_| err(StatusCode::BAD_REQUEST, "invalid_body"))?;
    let file_id = files::save_file(&state.file_dir, data, &FileMeta { mime, name })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "storing upload failed");
            err(StatusCode::INTERNAL_SERVER_ERROR, "persist")
        })?;
    let media_url = files::media_url(&file_id);
    Ok((StatusCode::CREATED, Json(UploadResp { file_id, media_url })))
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let path = files::file_path(&state.file_dir, &id).ok_or(StatusCode::NOT_FOUND)?;
    let meta = files::load_meta(&state.file_dir, &id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let body = StreamBody::new(ReaderStream::new(file));
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("inline; filename=\"{}\"", meta.name.replace('"', "")))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    Ok((headers, body))
}

/// Serve the API on the configured bind address until the process stops.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
