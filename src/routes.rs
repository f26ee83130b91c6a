use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::connection::{self, Identity};
use crate::error::StoreError;
use crate::hub::HubHandle;
use crate::messages::{ChatMessage, ChatUser, OnlineUser};
use crate::router::EventRouter;
use crate::store::ChatStore;
use crate::throttle::Throttle;

pub const SESSION_COOKIE: &str = "session_token";
pub const HISTORY_PAGE_SIZE: u32 = 10;

#[derive(Debug)]
struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

#[derive(Debug)]
struct StoreUnavailable;

impl warp::reject::Reject for StoreUnavailable {}

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub router: Arc<EventRouter>,
    pub store: Arc<dyn ChatStore>,
    pub outbound_capacity: usize,
    pub history_throttle: Throttle,
    pub users_throttle: Throttle,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    page: Option<u32>,
}

#[derive(Debug, Serialize)]
struct HistoryPage {
    messages: Vec<ChatMessage>,
    page: u32,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct ChatUsers {
    users: Vec<ChatUser>,
}

#[derive(Debug, Serialize)]
struct OnlineUsers {
    users: Vec<OnlineUser>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

pub fn routes(
    state: AppState,
    static_dir: PathBuf,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .map(|ws: warp::ws::Ws, identity: Identity, state: AppState| {
            ws.on_upgrade(move |socket| {
                connection::serve(
                    socket,
                    identity,
                    state.hub,
                    state.router,
                    state.outbound_capacity,
                )
            })
        });

    let history_route = warp::path!("api" / "messages" / String)
        .and(warp::get())
        .and(warp::query::<HistoryQuery>())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and_then(history);

    let chat_users_route = warp::path!("api" / "chat-users")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(with_state(state.clone()))
        .and_then(chat_users);

    let online_route = warp::path!("api" / "online")
        .and(warp::get())
        .and(authenticated(state.clone()))
        .and(with_state(state))
        .then(|_identity: Identity, state: AppState| async move {
            warp::reply::json(&OnlineUsers {
                users: state.hub.online_users().await,
            })
        });

    let static_files = warp::fs::dir(static_dir);

    ws_route
        .or(history_route)
        .or(chat_users_route)
        .or(online_route)
        .or(static_files)
        .with(warp::cors().allow_any_origin())
        .recover(handle_rejection)
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn authenticated(state: AppState) -> impl Filter<Extract = (Identity,), Error = Rejection> + Clone {
    warp::cookie::optional(SESSION_COOKIE)
        .and(with_state(state))
        .and_then(|token: Option<String>, state: AppState| async move {
            authenticate(token, &state).await
        })
}

async fn authenticate(token: Option<String>, state: &AppState) -> Result<Identity, Rejection> {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return Err(warp::reject::custom(Unauthorized));
    };

    let user_id = match state.store.session_user(&token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => return Err(warp::reject::custom(Unauthorized)),
        Err(e) => {
            error!("Session lookup failed: {}", e);
            return Err(warp::reject::custom(StoreUnavailable));
        }
    };

    match state.store.display_name(&user_id).await {
        Ok(username) => Ok(Identity { user_id, username }),
        Err(StoreError::UnknownUser(_)) => {
            warn!("Session points at unknown user {}", user_id);
            Err(warp::reject::custom(Unauthorized))
        }
        Err(e) => {
            error!("Display name lookup failed for {}: {}", user_id, e);
            Err(warp::reject::custom(StoreUnavailable))
        }
    }
}

async fn history(
    other_id: String,
    query: HistoryQuery,
    identity: Identity,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let page = query.page.filter(|page| *page > 0).unwrap_or(1);

    if !state.history_throttle.allow(&identity.user_id).await {
        debug!("History request from {} throttled", identity.user_id);
        return Ok(warp::reply::json(&HistoryPage {
            messages: Vec::new(),
            page,
            has_more: false,
        }));
    }

    let messages = state
        .store
        .conversation(&identity.user_id, &other_id, page, HISTORY_PAGE_SIZE)
        .await
        .map_err(|e| {
            error!("Loading conversation {} <-> {} failed: {}", identity.user_id, other_id, e);
            warp::reject::custom(StoreUnavailable)
        })?;
    let has_more = messages.len() == HISTORY_PAGE_SIZE as usize;

    if let Err(e) = state.store.mark_read(&identity.user_id, &other_id).await {
        warn!("Failed to mark messages from {} as read: {}", other_id, e);
    }

    Ok(warp::reply::json(&HistoryPage {
        messages,
        page,
        has_more,
    }))
}

/// The caller's inbox, with presence taken from the live registry.
async fn chat_users(identity: Identity, state: AppState) -> Result<impl Reply, Rejection> {
    if !state.users_throttle.allow(&identity.user_id).await {
        debug!("Chat list request from {} throttled", identity.user_id);
        return Ok(warp::reply::json(&ChatUsers { users: Vec::new() }));
    }

    let mut users = state.store.chat_users(&identity.user_id).await.map_err(|e| {
        error!("Loading chat users for {} failed: {}", identity.user_id, e);
        warp::reject::custom(StoreUnavailable)
    })?;
    for user in &mut users {
        user.is_online = state.hub.is_online(&user.id).await;
    }

    Ok(warp::reply::json(&ChatUsers { users }))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, error) = if err.find::<Unauthorized>().is_some() {
        (StatusCode::UNAUTHORIZED, "unauthorized")
    } else if err.find::<StoreUnavailable>().is_some() {
        (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        (StatusCode::BAD_REQUEST, "bad request")
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { error }),
        status,
    ))
}
