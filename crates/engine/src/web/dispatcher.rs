//! Request dispatcher
//!
//! The HTTP front door. Requests arrive either as the JSON API
//! (`POST /api` with a form field `request` holding
//! `{function, args}`) or as legacy paths; both are parsed into the same
//! [`ApiCommand`] values and dispatched identically. Public operations
//! work against the session table and the stores; everything per-agent is
//! forwarded to the session's connection worker.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tracing::debug;

use cpx_agent_core::endpoint::EndpointOptions;

use crate::conn::{ConnectionWorker, PollOutcome};
use crate::error::{EngineError, ErrCode};
use crate::web::cookies::{self, set_lang_cookie, set_session_cookie};
use crate::web::files;
use crate::web::reply::ApiReply;
use crate::web::AppState;

/// Typed commands the dispatcher executes.
#[derive(Debug)]
pub enum ApiCommand {
    CheckCookie,
    GetSalt,
    Login {
        username: String,
        password_cipher: String,
        opts: EndpointOptions,
    },
    GetQueueList,
    GetBrandList,
    GetReleaseOpts,
    Poll,
    Logout,
    /// Everything else goes to the connection worker.
    Forward { verb: String, args: Vec<Value> },
}

/// Response decoration decided while running a command.
struct ReplyCtx {
    lang: String,
    /// Session id minted during this request; must go out as `Set-Cookie`.
    new_session: Option<String>,
}

impl ReplyCtx {
    fn apply(self, mut response: Response) -> Response {
        set_lang_cookie(response.headers_mut(), &self.lang);
        if let Some(id) = &self.new_session {
            set_session_cookie(response.headers_mut(), id);
        }
        response
    }
}

// === handlers ===

pub async fn api(
    State(app): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let command = match parse_api_request(form.get("request").map(String::as_str)) {
        Ok(command) => command,
        Err(reply) => return run_reply(app, headers, reply).await,
    };
    run_command(app, headers, command).await
}

fn parse_api_request(raw: Option<&str>) -> Result<ApiCommand, ApiReply> {
    let raw = raw.ok_or_else(|| {
        ApiReply::error(ErrCode::NoFunction, "missing request field")
    })?;
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| ApiReply::error(ErrCode::NoFunction, "request is not valid JSON"))?;

    let function = value
        .get("function")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiReply::error(ErrCode::NoFunction, "no function name in request"))?
        .to_string();
    let args: Vec<Value> = value
        .get("args")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(match function.as_str() {
        "check_cookie" => ApiCommand::CheckCookie,
        "get_salt" => ApiCommand::GetSalt,
        "login" => {
            let username = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let password_cipher =
                args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
            let opts = args
                .get(2)
                .cloned()
                .map(|v| serde_json::from_value(v).unwrap_or_default())
                .unwrap_or_default();
            ApiCommand::Login { username, password_cipher, opts }
        }
        "get_queue_list" => ApiCommand::GetQueueList,
        "get_brand_list" => ApiCommand::GetBrandList,
        "get_release_opts" => ApiCommand::GetReleaseOpts,
        "poll" => ApiCommand::Poll,
        "logout" => ApiCommand::Logout,
        _ => ApiCommand::Forward { verb: function, args },
    })
}

pub async fn check_cookie(State(app): State<AppState>, headers: HeaderMap) -> Response {
    run_command(app, headers, ApiCommand::CheckCookie).await
}

pub async fn get_salt(State(app): State<AppState>, headers: HeaderMap) -> Response {
    run_command(app, headers, ApiCommand::GetSalt).await
}

#[derive(Debug, serde::Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub voipendpoint: Option<String>,
    pub voipendpointdata: Option<String>,
    pub useoutbandring: Option<String>,
}

pub async fn login(
    State(app): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let opts = EndpointOptions {
        voipendpoint: form.voipendpoint,
        voipendpointdata: form.voipendpointdata,
        useoutbandring: matches!(form.useoutbandring.as_deref(), Some("true") | Some("1")),
    };
    run_command(
        app,
        headers,
        ApiCommand::Login {
            username: form.username,
            password_cipher: form.password,
            opts,
        },
    )
    .await
}

pub async fn poll(State(app): State<AppState>, headers: HeaderMap) -> Response {
    run_command(app, headers, ApiCommand::Poll).await
}

pub async fn logout(State(app): State<AppState>, headers: HeaderMap) -> Response {
    run_command(app, headers, ApiCommand::Logout).await
}

pub async fn queue_list(State(app): State<AppState>, headers: HeaderMap) -> Response {
    run_command(app, headers, ApiCommand::GetQueueList).await
}

pub async fn brand_list(State(app): State<AppState>, headers: HeaderMap) -> Response {
    run_command(app, headers, ApiCommand::GetBrandList).await
}

pub async fn release_opts(State(app): State<AppState>, headers: HeaderMap) -> Response {
    run_command(app, headers, ApiCommand::GetReleaseOpts).await
}

pub async fn set_state(
    State(app): State<AppState>,
    Path(state): Path<String>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "set_state", vec![json!(state)]).await
}

pub async fn set_state_data(
    State(app): State<AppState>,
    Path((state, data)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "set_state", vec![json!(state), json!(data)]).await
}

pub async fn ack(
    State(app): State<AppState>,
    Path(counter): Path<String>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "ack", vec![json!(counter)]).await
}

pub async fn err(
    State(app): State<AppState>,
    Path(counter): Path<String>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "err", vec![json!(counter)]).await
}

pub async fn err_msg(
    State(app): State<AppState>,
    Path((counter, message)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "err", vec![json!(counter), json!(message)]).await
}

pub async fn dial(
    State(app): State<AppState>,
    Path(number): Path<String>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "dial", vec![json!(number)]).await
}

pub async fn get_avail_agents(State(app): State<AppState>, headers: HeaderMap) -> Response {
    forward(app, headers, "get_avail_agents", vec![]).await
}

pub async fn agent_transfer(
    State(app): State<AppState>,
    Path(login): Path<String>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "agent_transfer", vec![json!(login)]).await
}

pub async fn agent_transfer_case(
    State(app): State<AppState>,
    Path((login, case_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "agent_transfer", vec![json!(login), json!(case_id)]).await
}

pub async fn queue_transfer(
    State(app): State<AppState>,
    Path(queue): Path<String>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "queue_transfer", vec![json!(queue)]).await
}

pub async fn init_outbound(
    State(app): State<AppState>,
    Path((client, media_type)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "init_outbound", vec![json!(client), json!(media_type)]).await
}

pub async fn warm_transfer(
    State(app): State<AppState>,
    Path(number): Path<String>,
    headers: HeaderMap,
) -> Response {
    forward(app, headers, "warm_transfer", vec![json!(number)]).await
}

pub async fn warm_transfer_complete(State(app): State<AppState>, headers: HeaderMap) -> Response {
    forward(app, headers, "warm_transfer_complete", vec![]).await
}

pub async fn warm_transfer_cancel(State(app): State<AppState>, headers: HeaderMap) -> Response {
    forward(app, headers, "warm_transfer_cancel", vec![]).await
}

pub async fn mediapush(State(app): State<AppState>, headers: HeaderMap) -> Response {
    forward(app, headers, "mediapush", vec![]).await
}

/// `/supervisor/<command>[/<args>...]`: the whole remainder becomes the
/// supervisor verb's argument list.
pub async fn supervisor(
    State(app): State<AppState>,
    Path(command): Path<String>,
    headers: HeaderMap,
) -> Response {
    let args = command
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| json!(segment))
        .collect();
    forward(app, headers, "supervisor", args).await
}

async fn forward(app: AppState, headers: HeaderMap, verb: &str, args: Vec<Value>) -> Response {
    run_command(
        app,
        headers,
        ApiCommand::Forward {
            verb: verb.to_string(),
            args,
        },
    )
    .await
}

/// Everything unrouted: static files on GET, else the agent-connection
/// API keyed by the first path segment.
pub async fn fallback(
    State(app): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();

    if method == Method::GET {
        if let Some(file) = files::resolve(&app.config, &path).await {
            let mut response = files::serve(&file).await;
            let lang = cookies::negotiate_language(&headers, &app.config.general.www_root).await;
            set_lang_cookie(response.headers_mut(), &lang);

            let cookie_known = cookies::session_id(&headers)
                .map(|id| app.sessions.lookup(&id).is_some())
                .unwrap_or(false);
            if !cookie_known {
                set_session_cookie(response.headers_mut(), &app.sessions.issue_session());
            }
            return response;
        }
    }

    let mut segments = path.trim_matches('/').split('/');
    let verb = segments.next().unwrap_or("").to_string();
    if verb.is_empty() {
        return run_reply(app, headers, ApiReply::error(ErrCode::NoFunction, "no function")).await;
    }
    let args = segments.map(|s| json!(s)).collect();
    run_command(app, headers, ApiCommand::Forward { verb, args }).await
}

// === command execution ===

async fn run_reply(app: AppState, headers: HeaderMap, reply: ApiReply) -> Response {
    let ctx = ReplyCtx {
        lang: cookies::negotiate_language(&headers, &app.config.general.www_root).await,
        new_session: None,
    };
    ctx.apply(reply.into_response())
}

pub async fn run_command(app: AppState, headers: HeaderMap, command: ApiCommand) -> Response {
    let mut ctx = ReplyCtx {
        lang: cookies::negotiate_language(&headers, &app.config.general.www_root).await,
        new_session: None,
    };

    let cookie_id = cookies::session_id(&headers);
    let session = cookie_id.as_deref().and_then(|id| app.sessions.lookup(id));

    debug!("dispatch {:?} (session known: {})", command, session.is_some());

    match command {
        ApiCommand::CheckCookie => {
            let reply = match (&cookie_id, &session) {
                (Some(_), Some(entry)) => match &entry.connection {
                    Some(conn) => {
                        conn.keep_alive().await;
                        match conn.dump_agent().await {
                            Ok(snapshot) => ApiReply::success_with(json!(snapshot)),
                            Err(_) => {
                                // Worker died between lookup and dump.
                                ctx.new_session = Some(app.sessions.issue_session());
                                ApiReply::error(ErrCode::BadCookie, "session expired")
                            }
                        }
                    }
                    None => ApiReply::error(ErrCode::NoAgent, "no agent logged in"),
                },
                _ => {
                    ctx.new_session = Some(app.sessions.issue_session());
                    ApiReply::error(ErrCode::BadCookie, "bad cookie")
                }
            };
            ctx.apply(reply.into_response())
        }

        ApiCommand::GetSalt => {
            let id = match (&cookie_id, &session) {
                (Some(id), Some(_)) => id.clone(),
                _ => {
                    let id = app.sessions.issue_session();
                    ctx.new_session = Some(id.clone());
                    id
                }
            };
            let reply = match app.sessions.bind_salt(&id) {
                Some(salt) => ApiReply::success_with(json!({
                    "salt": salt,
                    "pubkey": app.auth.public_key(),
                })),
                None => ApiReply::error(ErrCode::UnknownError, "unknown error"),
            };
            ctx.apply(reply.into_response())
        }

        ApiCommand::Login { username, password_cipher, opts } => {
            let reply = match (&cookie_id, &session) {
                (Some(id), Some(entry)) => {
                    do_login(&app, id, entry.salt.clone(), &username, &password_cipher, opts).await
                }
                _ => {
                    ctx.new_session = Some(app.sessions.issue_session());
                    Err(EngineError::NoSalt)
                }
            };
            let reply = reply.unwrap_or_else(ApiReply::from);
            ctx.apply(reply.into_response())
        }

        ApiCommand::GetQueueList => {
            let reply = match app.store.list_queue_names().await {
                Ok(names) => {
                    let list: Vec<Value> = names.iter().map(|n| json!({ "name": n })).collect();
                    ApiReply::success_with(json!(list))
                }
                Err(e) => ApiReply::from(EngineError::Internal(e)),
            };
            ctx.apply(reply.into_response())
        }

        ApiCommand::GetBrandList => {
            let reply = match app.store.list_brands().await {
                Ok(brands) => ApiReply::success_with(json!(brands)),
                Err(e) => ApiReply::from(EngineError::Internal(e)),
            };
            ctx.apply(reply.into_response())
        }

        ApiCommand::GetReleaseOpts => {
            let reply = match app.store.list_release_opts().await {
                Ok(opts) => ApiReply::success_with(json!(opts)),
                Err(e) => ApiReply::from(EngineError::Internal(e)),
            };
            ctx.apply(reply.into_response())
        }

        ApiCommand::Poll => {
            let Some(conn) = session.as_ref().and_then(|s| s.connection.clone()) else {
                return ctx.apply(forbidden());
            };
            conn.keep_alive().await;

            let wait = Duration::from_secs(app.config.session.poll_timeout_secs);
            let outcome = match conn.poll().await {
                Ok(rx) => timeout(wait, rx).await,
                Err(_) => return ctx.apply(forbidden()),
            };

            let response = match outcome {
                Ok(Ok(PollOutcome::Events(events))) => {
                    ApiReply::success_with(json!(events)).into_response()
                }
                // Worker death and plain expiry both surface as 408; the
                // session itself stays intact.
                Ok(Ok(PollOutcome::Killed)) | Ok(Err(_)) | Err(_) => poll_timeout(),
            };
            ctx.apply(response)
        }

        ApiCommand::Logout => {
            let reply = match (&cookie_id, &session) {
                (Some(id), Some(_)) => {
                    if let Some(conn) = app.sessions.revoke(id) {
                        conn.stop().await;
                    }
                    ApiReply::success()
                }
                _ => {
                    ctx.new_session = Some(app.sessions.issue_session());
                    ApiReply::error(ErrCode::BadCookie, "bad cookie")
                }
            };
            ctx.apply(reply.into_response())
        }

        ApiCommand::Forward { verb, args } => {
            let Some(conn) = session.as_ref().and_then(|s| s.connection.clone()) else {
                return ctx.apply(forbidden());
            };
            conn.keep_alive().await;
            let reply = match conn.api(&verb, args).await {
                Ok(reply) => reply,
                Err(e) => ApiReply::from(e),
            };
            ctx.apply(reply.into_response())
        }
    }
}

async fn do_login(
    app: &AppState,
    session_id: &str,
    salt: Option<String>,
    username: &str,
    password_cipher: &str,
    opts: EndpointOptions,
) -> Result<ApiReply, EngineError> {
    let salt = salt.ok_or(EngineError::NoSalt)?;

    let agent = app.auth.login(username, password_cipher, &salt).await?;
    let (endpoint, ring_path) = opts.resolve(username)?;

    let worker = ConnectionWorker::spawn(agent.clone(), endpoint, ring_path, app.conn_deps());

    if let Err(e) = app.sessions.bind_connection(session_id, &salt, worker.clone()) {
        worker.stop().await;
        return Err(e);
    }
    app.directory.insert(agent.login.clone(), worker);

    let now = chrono::Utc::now().timestamp();
    Ok(ApiReply::success_with(json!({
        "profile": agent.profile,
        "statetime": now,
        "timestamp": now,
    })))
}

fn forbidden() -> Response {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .body(Body::from("forbidden"))
        .expect("static response")
}

fn poll_timeout() -> Response {
    let body = serde_json::to_string(&ApiReply::error(ErrCode::UnknownError, "poll timeout"))
        .expect("reply serialises");
    Response::builder()
        .status(StatusCode::REQUEST_TIMEOUT)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response")
}
