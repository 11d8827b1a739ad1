use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeFile;

use crate::agent::Agent;
use crate::auth::{self, SessionClaims, SessionSigner, AUTH_COOKIE, OAUTH_STATE_COOKIE};
use crate::calendar::CalendarClient;
use crate::config::Config;
use crate::google_auth::{Credentials, GoogleOAuth, TokenSource};
use crate::openai::OpenAiClient;
use crate::patterns;
use crate::tools::{Calculator, CalendarAddTool, CalendarEditTool, CalendarListTool, NotesTool, Toolbox};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(e) => {
                log::error!("Request failed: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// State shared by every request and connection.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub signer: SessionSigner,
    pub oauth: Option<GoogleOAuth>,
    /// Shared so the cached service-account token is reused across connections.
    pub service_account: Option<Arc<TokenSource>>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("groundhog/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let service_account = match config.calendar.credentials_file.as_deref() {
            Some(path) if std::path::Path::new(path).exists() => {
                Some(Arc::new(TokenSource::service_account(path, http.clone())?))
            }
            Some(path) => {
                log::warn!("Calendar credentials file {} not found; service account disabled", path);
                None
            }
            None => None,
        };

        let oauth = GoogleOAuth::from_config(&config.oauth);
        let signer = SessionSigner::new(&config.auth.jwt_secret, config.auth.session_ttl_hours);

        Ok(Self {
            config: Arc::new(config),
            http,
            signer,
            oauth,
            service_account,
        })
    }

    /// Calendar access for one connection: the session's OAuth token first, then the service account.
    fn calendar_client(&self, session: Option<&SessionClaims>) -> Option<Arc<CalendarClient>> {
        let tokens = match session.and_then(|s| s.token.clone()) {
            Some(token) => {
                if token.is_expired(chrono::Utc::now().timestamp()) && token.refresh_token.is_none() {
                    log::warn!("Session OAuth token is expired and has no refresh token");
                }
                let credentials = Credentials::OAuth {
                    token,
                    client: self.oauth.clone(),
                };
                Arc::new(TokenSource::new(credentials, self.http.clone()))
            }
            None => self.service_account.clone()?,
        };

        let calendar = &self.config.calendar;
        Some(Arc::new(
            CalendarClient::new(tokens, self.http.clone())
                .with_calendar_id(calendar.calendar_id.clone())
                .with_lookahead_hours(calendar.lookahead_hours)
                .with_default_time_zone(calendar.default_time_zone.clone()),
        ))
    }

    pub fn build_toolbox(&self, session: Option<&SessionClaims>) -> Toolbox {
        let notes = &self.config.notes;
        let toolbox = Toolbox::new()
            .with(Calculator::new())
            .with(NotesTool::new(PathBuf::from(&notes.dir), notes.default_limit));

        match self.calendar_client(session) {
            Some(calendar) => toolbox
                .with(CalendarListTool::new(Some(calendar.clone())))
                .with(CalendarAddTool::new(Some(calendar.clone())))
                .with(CalendarEditTool::new(Some(calendar))),
            None => toolbox,
        }
    }

    pub fn build_agent(&self, session: Option<&SessionClaims>) -> Agent {
        let llm = &self.config.llm;
        let client = OpenAiClient::new(
            self.http.clone(),
            llm.api_key.clone(),
            llm.base_url.clone(),
            llm.model.clone(),
        )
        .with_temperature(llm.temperature);
        Agent::new(client, self.build_toolbox(session), llm.max_iterations)
    }
}

pub fn router(state: AppState) -> Router {
    let index = ServeFile::new(&state.config.server.index_file);
    Router::new()
        .route_service("/", index)
        .route("/health", get(health))
        .route("/patterns", get(list_patterns))
        .route("/login", post(login))
        .route("/oauth/login", get(oauth_login))
        .route("/oauth/oauth2callback", get(oauth_callback))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config.bind_addr();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    log::info!("Groundhog listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited")?;
    log::info!("Groundhog stopped");
    Ok(())
}

/// Completes on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("Shutdown signal received");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_patterns() -> Json<Vec<&'static str>> {
    Json(patterns::list_patterns())
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    password: String,
}

async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Result<Response, ApiError> {
    let Some(expected) = state.config.master_password() else {
        return Err(ApiError::NotFound("Password login disabled"));
    };
    if !auth::password_matches(&form.password, expected) {
        log::warn!("Password login rejected");
        return Err(ApiError::Unauthorized("Invalid password"));
    }

    let token = state.signer.issue("master", None)?;
    log::info!("Password login succeeded");
    let cookie = auth::set_cookie(AUTH_COOKIE, &token, Some(state.signer.ttl_secs()));
    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Json(json!({ "status": "ok" })),
    )
        .into_response())
}

async fn oauth_login(State(state): State<AppState>) -> Result<Response, ApiError> {
    let oauth = state.oauth.as_ref().ok_or(ApiError::NotFound("OAuth not configured"))?;
    let (url, oauth_state) = oauth.authorize_url().map_err(anyhow::Error::from)?;

    let cookie = auth::set_cookie(OAUTH_STATE_COOKIE, &oauth_state, Some(600));
    Ok((AppendHeaders([(header::SET_COOKIE, cookie)]), Redirect::to(&url)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<OAuthCallback>,
) -> Result<Response, ApiError> {
    let oauth = state.oauth.as_ref().ok_or(ApiError::NotFound("OAuth not configured"))?;

    let stored_state = auth::read_cookie(&headers, OAUTH_STATE_COOKIE);
    if stored_state.is_none() || stored_state != params.state {
        log::warn!("OAuth callback state mismatch");
        return Err(ApiError::BadRequest("State mismatch".into()));
    }
    if let Some(error) = params.error {
        return Err(ApiError::BadRequest(format!("OAuth error: {}", error)));
    }
    let code = params
        .code
        .ok_or_else(|| ApiError::BadRequest("Missing authorization code".into()))?;

    let token = oauth
        .exchange_code(&state.http, &code)
        .await
        .map_err(anyhow::Error::from)?;
    let session = state.signer.issue("oauth", Some(token))?;
    log::info!("OAuth login succeeded");

    Ok((
        AppendHeaders([
            (header::SET_COOKIE, auth::clear_cookie(OAUTH_STATE_COOKIE)),
            (
                header::SET_COOKIE,
                auth::set_cookie(AUTH_COOKIE, &session, Some(state.signer.ttl_secs())),
            ),
        ]),
        Redirect::to("/"),
    )
        .into_response())
}

/// One websocket frame from the client.
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl ChatRequest {
    pub fn prompt(&self) -> String {
        patterns::compose_prompt(self.pattern.as_deref(), self.message.as_deref().unwrap_or(""))
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = auth::session_from_headers(&headers, &state.signer);
    if state.config.auth_enabled() && session.is_none() {
        return Err(ApiError::Unauthorized("Not authenticated"));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, session)))
}

async fn handle_socket(socket: WebSocket, state: AppState, session: Option<SessionClaims>) {
    let conn_id = uuid::Uuid::new_v4();
    let mut agent = state.build_agent(session.as_ref());
    log::info!("WebSocket {} connected", conn_id);

    let (mut sender, mut receiver) = socket.split();

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("WebSocket {} error: {}", conn_id, e);
                break;
            }
        };

        let request: ChatRequest = match serde_json::from_str(text.as_str()) {
            Ok(request) => request,
            Err(e) => {
                if sender.send(Message::Text(format!("Invalid request: {}", e).into())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match agent.run(&request.prompt()).await {
            Ok(reply) => {
                log::debug!("WebSocket {} memory holds {} messages", conn_id, agent.history().len());
                if sender.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::error!("WebSocket {} agent failure: {:#}", conn_id, e);
                let _ = sender.send(Message::Text(format!("Server error: {:#}", e).into())).await;
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    log::info!("WebSocket {} disconnected", conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, OAuthConfig};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state(master_password: Option<&str>) -> AppState {
        let mut config = Config::default();
        config.llm.api_key = "sk-test".into();
        config.notes.dir = "/tmp/notes".into();
        config.auth = AuthConfig {
            jwt_secret: "test-secret".into(),
            master_password: master_password.map(str::to_string),
            ..AuthConfig::default()
        };
        AppState::new(config).unwrap()
    }

    fn form(password: &str) -> Form<LoginForm> {
        Form(LoginForm { password: password.into() })
    }

    #[tokio::test]
    async fn test_patterns_endpoint() {
        let Json(names) = list_patterns().await;
        assert_eq!(names[0], patterns::DEFAULT_PATTERN);
    }

    #[tokio::test]
    async fn test_login_disabled_without_master_password() {
        let err = login(State(state(None)), form("anything")).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password() {
        let err = login(State(state(Some("hunter2"))), form("guess")).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_sets_signed_cookie() {
        let state = state(Some("hunter2"));
        let response = login(State(state.clone()), form("hunter2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.contains("HttpOnly"));
        let token = cookie
            .strip_prefix("Auth=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        assert_eq!(state.signer.verify(token).unwrap().sub, "master");
    }

    #[tokio::test]
    async fn test_blank_master_password_disables_login() {
        let mut config: Config = toml::from_str("[auth]\nmaster_password = \"\"").unwrap();
        config.auth.jwt_secret = "test-secret".into();
        let state = AppState::new(config).unwrap();

        let err = login(State(state), form("")).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oauth_login_redirects_with_state_cookie() {
        let err = oauth_login(State(state(None))).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let mut config = Config::default();
        config.oauth = OAuthConfig {
            client_id: Some("cid".into()),
            client_secret: Some("secret".into()),
            redirect_url: Some("http://localhost:8000/oauth/oauth2callback".into()),
        };
        let response = oauth_login(State(AppState::new(config).unwrap())).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert!(response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .starts_with("https://accounts.google.com/"));
        assert!(response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .starts_with("oauth_state="));
    }

    fn oauth_state(token_url: &str) -> AppState {
        let mut state = state(None);
        state.oauth = Some(
            GoogleOAuth::new(
                "cid".into(),
                "secret".into(),
                "http://localhost:8000/oauth/oauth2callback".into(),
            )
            .with_endpoints(crate::google_auth::GOOGLE_AUTH_URL, token_url),
        );
        state
    }

    fn state_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, format!("{}={}", OAUTH_STATE_COOKIE, value).parse().unwrap());
        headers
    }

    fn callback(code: Option<&str>, state: Option<&str>, error: Option<&str>) -> Query<OAuthCallback> {
        Query(OAuthCallback {
            code: code.map(str::to_string),
            state: state.map(str::to_string),
            error: error.map(str::to_string),
        })
    }

    async fn detail(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        value["detail"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_oauth_callback_rejects_state_mismatch() {
        let state = oauth_state(crate::google_auth::GOOGLE_TOKEN_URL);

        let err = oauth_callback(State(state.clone()), HeaderMap::new(), callback(Some("c"), Some("abc"), None))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(detail(response).await, "State mismatch");

        let err = oauth_callback(State(state.clone()), state_cookie("abc"), callback(Some("c"), Some("xyz"), None))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = oauth_callback(State(state), state_cookie("abc"), callback(Some("c"), None, None))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oauth_callback_reports_provider_error() {
        let state = oauth_state(crate::google_auth::GOOGLE_TOKEN_URL);
        let err = oauth_callback(State(state), state_cookie("abc"), callback(None, Some("abc"), Some("access_denied")))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(detail(response).await, "OAuth error: access_denied");
    }

    #[tokio::test]
    async fn test_oauth_callback_exchanges_code_into_session() {
        let google = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.fresh",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "1//refresh"
            })))
            .expect(1)
            .mount(&google)
            .await;

        let state = oauth_state(&format!("{}/token", google.uri()));
        let response = oauth_callback(
            State(state.clone()),
            state_cookie("abc"),
            callback(Some("auth-code"), Some("abc"), None),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");

        let cookies: Vec<&str> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert!(cookies.iter().any(|c| c.starts_with("oauth_state=;")));
        let session = cookies
            .iter()
            .find_map(|c| c.strip_prefix("Auth="))
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        let claims = state.signer.verify(session).unwrap();
        assert_eq!(claims.sub, "oauth");
        let token = claims.token.unwrap();
        assert_eq!(token.access_token, "ya29.fresh");
        assert_eq!(token.refresh_token.as_deref(), Some("1//refresh"));
    }

    type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_server(state: AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await.unwrap() });
        addr
    }

    fn state_with_llm(llm: &MockServer, master_password: Option<&str>) -> AppState {
        let mut state = state(master_password);
        let mut config = (*state.config).clone();
        config.llm.base_url = Some(llm.uri());
        state.config = Arc::new(config);
        state
    }

    async fn next_text(socket: &mut Client) -> String {
        let frame = socket.next().await.unwrap().unwrap();
        frame.to_text().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_ws_requires_session_when_login_configured() {
        let llm = MockServer::start().await;
        let state = state_with_llm(&llm, Some("hunter2"));
        let token = state.signer.issue("master", None).unwrap();
        let addr = spawn_server(state).await;
        let url = format!("ws://{}/ws", addr);

        let err = tokio_tungstenite::connect_async(url.as_str()).await.unwrap_err();
        assert!(matches!(err, WsError::Http(ref response) if response.status().as_u16() == 401));

        let mut request = url.as_str().into_client_request().unwrap();
        request
            .headers_mut()
            .insert(header::COOKIE, format!("{}={}", AUTH_COOKIE, token).parse().unwrap());
        assert!(tokio_tungstenite::connect_async(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_ws_invalid_frame_keeps_connection_open() {
        let llm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": {"role": "assistant", "content": "Hello!"} }]
            })))
            .expect(1)
            .mount(&llm)
            .await;

        let addr = spawn_server(state_with_llm(&llm, None)).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        socket.send(WsMessage::Text("not json".into())).await.unwrap();
        assert!(next_text(&mut socket).await.starts_with("Invalid request: "));

        socket.send(WsMessage::Text(r#"{"message": "hi"}"#.into())).await.unwrap();
        assert_eq!(next_text(&mut socket).await, "Hello!");
    }

    #[tokio::test]
    async fn test_ws_agent_failure_replies_then_closes() {
        let llm = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&llm)
            .await;

        let addr = spawn_server(state_with_llm(&llm, None)).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        socket.send(WsMessage::Text(r#"{"message": "hi"}"#.into())).await.unwrap();
        assert!(next_text(&mut socket).await.starts_with("Server error: "));
        assert!(matches!(socket.next().await, Some(Ok(WsMessage::Close(_))) | None));
    }

    #[test]
    fn test_chat_request_prompt() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"message": "Focus on work", "pattern": "Plan Day"}"#).unwrap();
        assert_eq!(
            request.prompt(),
            "Based on the provided notes, create a detailed plan for my day.\n\nFocus on work"
        );

        let request: ChatRequest = serde_json::from_str(r#"{"message": "hello", "pattern": null}"#).unwrap();
        assert_eq!(request.prompt(), "hello");
    }

    #[test]
    fn test_toolbox_without_calendar() {
        let toolbox = state(None).build_toolbox(None);
        assert_eq!(toolbox.names(), vec!["calculator", "notes"]);
    }

    #[test]
    fn test_toolbox_with_session_oauth_token() {
        let state = state(None);
        let token = crate::google_auth::OAuthToken {
            access_token: "ya29".into(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        };
        let claims = SessionClaims {
            sub: "oauth".into(),
            iat: 0,
            exp: i64::MAX,
            token: Some(token),
        };
        let toolbox = state.build_toolbox(Some(&claims));
        assert_eq!(toolbox.names().len(), 5);
    }
}
