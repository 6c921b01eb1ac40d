//! API route handlers.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ApiError, Result};
use crate::models::{
    completion_body, AccountEntry, AccountsResponse, ChatCompletionRequest, ChunkBuilder,
    ModelEntry, ModelsResponse, ProviderQuery, SuccessResponse, UsageResponse,
};
use crate::state::AppState;

/// POST /v1/chat/completions - Run a chat completion, streamed or buffered.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }

    let request = req.into_chat_request();
    debug!(
        model = %request.model_id,
        provider = ?request.provider_id,
        stream = request.stream,
        messages = request.messages.len(),
        "Chat completion request"
    );

    if !request.stream {
        let completion = state
            .gateway
            .complete(request, CancellationToken::new())
            .await?;
        return Ok(Json(completion_body(&completion)).into_response());
    }

    // Resolution errors surface as HTTP errors before any SSE is written.
    let chat = state.gateway.send(request, CancellationToken::new())?;
    let builder = ChunkBuilder::new(chat.model_id(), chat.provider_id());

    // Dropping the response body drops `chat`, which cancels the upstream call.
    let events = chat
        .map(move |event| {
            Ok::<_, Infallible>(Event::default().data(builder.build(&event).to_string()))
        })
        .chain(stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// GET /v1/models - List models of every provider with an account.
pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<ModelsResponse>> {
    let models = state.gateway.list_models(query.provider.as_deref()).await?;

    Ok(Json(ModelsResponse {
        object: "list",
        data: models.into_iter().map(ModelEntry::from).collect(),
    }))
}

/// GET /api/accounts - List stored accounts without credentials.
pub async fn list_accounts(
    State(state): State<AppState>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<AccountsResponse>> {
    let selector = state.selector();
    let accounts: Vec<AccountEntry> = selector
        .store()
        .list(query.provider.as_deref())?
        .into_iter()
        .map(|account| {
            let usage = selector.usage_count(&account.id);
            AccountEntry::new(account, usage)
        })
        .collect();

    Ok(Json(AccountsResponse {
        total: accounts.len(),
        accounts,
    }))
}

/// DELETE /api/accounts/{id} - Delete one account.
pub async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if !state.selector().store().delete(&id)? {
        return Err(ApiError::NotFound(format!("account {}", id)));
    }

    info!(account = %id, "Deleted account");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/accounts/usage - Per-account request counters.
pub async fn get_usage(State(state): State<AppState>) -> Json<UsageResponse> {
    Json(UsageResponse {
        usage: state.selector().usage_counts(),
    })
}

/// POST /api/accounts/usage/reset - Clear request counters and rewind
/// round-robin cursors.
pub async fn reset_usage(State(state): State<AppState>) -> Json<SuccessResponse> {
    state.selector().reset_counts();
    state.selector().reset_cursors();
    info!("Account usage counters and cursors reset");
    Json(SuccessResponse { success: true })
}
