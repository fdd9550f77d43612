use crate::auth::Claims;
use crate::bus::{PromptJob, SCRIPTS_QUEUE};
use crate::database;
use crate::database::jobs::JobStatus;
use crate::database::system_stats::VIDEO_GENERATION_COUNT;
use crate::errors::ReelPipeError;
use crate::jobs::{CreateJob, JobSnapshot};
use crate::retry::{with_retry, RetryPolicy};
use crate::themes;
use crate::worker::script_stage::truncate_title;
use crate::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Json, Response},
    routing::{get, post},
    Extension, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;
use uuid::Uuid;
use validator::Validate;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/videos", post(submit_video))
        .route("/videos/:job_id", get(get_video_status))
        .route("/videos/:job_id/file", get(download_video))
        .route("/user/videos", get(get_user_videos))
        .route("/video-count", get(get_video_count))
        .route("/video-count/increment", post(increment_video_count))
        .route("/themes", get(list_themes))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitVideoRequest {
    pub job_id: Option<String>,
    #[validate(length(min = 1, max = 2000))]
    pub prompt: String,
    pub character_theme: String,
    pub title: Option<String>,
}

/// Submit a prompt for rendering. Ordering is deliberate: the job record
/// exists before the credit is debited (refunds always have a record to
/// key on), and nothing is published until the debit succeeded (no free
/// work). Each later failure compensates the earlier steps.
async fn submit_video(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<SubmitVideoRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if let Err(e) = request.validate() {
        return Err(error_body(StatusCode::BAD_REQUEST, &e.to_string()));
    }
    if themes::profile_for(&request.character_theme).is_err() {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            &format!(
                "Invalid theme '{}'. Available themes: {:?}",
                request.character_theme,
                themes::theme_tags()
            ),
        ));
    }

    let job_id = request
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let title = request
        .title
        .clone()
        .unwrap_or_else(|| truncate_title(&request.prompt));

    let prompt_job = PromptJob {
        job_id: job_id.clone(),
        prompt: request.prompt.clone(),
        character_theme: request.character_theme.clone(),
        title: Some(title.clone()),
    };
    let payload = serde_json::to_value(&prompt_job)
        .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;

    if let Err(e) = state
        .job_manager
        .create(CreateJob {
            job_id: job_id.clone(),
            user_id: claims.sub.clone(),
            title,
            character_theme: request.character_theme.clone(),
            prompt: request.prompt.clone(),
            queue: SCRIPTS_QUEUE.to_string(),
            payload,
            max_retries: state.config.jobs.max_retries,
            estimated_duration: None,
        })
        .await
    {
        tracing::error!("Failed to create job record for {}: {}", job_id, e);
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "job_id already exists or record creation failed",
        ));
    }

    if let Err(e) = state.ledger.spend(&claims.sub, "Video generation").await {
        // Roll back to the pre-call state.
        if let Err(cleanup) = state.job_manager.delete_unstarted(&job_id).await {
            tracing::error!("Failed to clean up job {} after spend failure: {}", job_id, cleanup);
        }
        return Err(match e {
            ReelPipeError::InsufficientCredits => error_body(
                StatusCode::PAYMENT_REQUIRED,
                "Insufficient credits. Please purchase more credits to continue.",
            ),
            other => {
                tracing::error!("Credit spend failed for {}: {}", claims.sub, other);
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Error processing credit")
            }
        });
    }

    if let Err(e) = with_retry(RetryPolicy::publish(), || {
        state.bus.publish(SCRIPTS_QUEUE, &prompt_job)
    })
    .await
    {
        tracing::error!("Failed to enqueue job {} after retries: {}", job_id, e);
        // Refund and record the terminal failure.
        if let Err(fail_err) = state
            .job_manager
            .fail_unassigned(&job_id, "enqueue_failed")
            .await
        {
            tracing::error!("Failed to mark job {} failed: {}", job_id, fail_err);
        }
        return Err(error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to queue job after retries",
        ));
    }

    tracing::info!("Job {} queued for user {}", job_id, claims.sub);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "job_id": job_id, "status": "queued" })),
    ))
}

/// Status snapshot: KV first, database as the authoritative fallback.
async fn get_video_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if let Some(snapshot) = state.kv.get_as::<JobSnapshot>(&format!("job:{job_id}")).await {
        return Ok(Json(serde_json::json!({
            "job_id": snapshot.job_id,
            "status": snapshot.status,
            "error_msg": snapshot.error_msg,
            "download_url": snapshot.download_url,
        })));
    }

    if let Some(job) = state.job_manager.get(&job_id).await.map_err(log_db_error)? {
        return Ok(Json(serde_json::json!({
            "job_id": job.id,
            "status": job.status,
            "error_msg": job.error_message,
            "download_url": job.download_url,
        })));
    }
    if let Some(job) = state
        .job_manager
        .get_archived(&job_id)
        .await
        .map_err(log_db_error)?
    {
        return Ok(Json(serde_json::json!({
            "job_id": job.id,
            "status": job.status,
            "error_msg": job.error_message,
            "download_url": job.download_url,
        })));
    }
    Err(StatusCode::NOT_FOUND)
}

/// Stream the finished MP4. Completion is checked against the durable
/// store, not the KV snapshot.
async fn download_video(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<String>,
) -> Result<Response, StatusCode> {
    let archived = state
        .job_manager
        .get_archived(&job_id)
        .await
        .map_err(log_db_error)?;

    let done = match archived {
        Some(job) if job.user_id == claims.sub => {
            matches!(JobStatus::try_from(job.status.as_str()), Ok(JobStatus::Completed))
        }
        _ => false,
    };
    if !done {
        return Err(StatusCode::NOT_FOUND);
    }

    let path = std::path::Path::new(&state.config.video_out_dir).join(format!("{job_id}.mp4"));
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    if metadata.len() == 0 {
        tracing::error!("Video file for job {} is empty", job_id);
        return Err(StatusCode::NOT_FOUND);
    }

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{job_id}.mp4\""),
        )
        .body(body)
        .map_err(|e| {
            tracing::error!("Failed to build file response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// All of the user's jobs, active and archived, newest first.
async fn get_user_videos(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, StatusCode> {
    let active = state
        .job_manager
        .list_for_user(&claims.sub)
        .await
        .map_err(log_db_error)?;
    let archived = state
        .job_manager
        .list_archived_for_user(&claims.sub)
        .await
        .map_err(log_db_error)?;

    let mut videos: Vec<Value> = Vec::with_capacity(active.len() + archived.len());
    for job in active {
        videos.push(serde_json::json!({
            "job_id": job.id,
            "title": job.title,
            "character_theme": job.character_theme,
            "prompt": job.prompt,
            "status": job.status,
            "download_url": job.download_url,
            "error_message": job.error_message,
            "created_at": job.created_at,
            "updated_at": job.updated_at,
        }));
    }
    for job in archived {
        videos.push(serde_json::json!({
            "job_id": job.id,
            "title": job.title,
            "character_theme": job.character_theme,
            "prompt": job.prompt,
            "status": job.status,
            "download_url": job.download_url,
            "error_message": job.error_message,
            "created_at": job.created_at,
            "updated_at": job.archived_at,
        }));
    }
    videos.sort_by_key(|v| std::cmp::Reverse(v.get("created_at").and_then(|c| c.as_i64())));

    Ok(Json(serde_json::json!({ "videos": videos })))
}

async fn get_video_count(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let count = database::get_stat(state.db.as_ref(), VIDEO_GENERATION_COUNT)
        .await
        .map_err(|e| {
            tracing::error!("Failed to read video count: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(serde_json::json!({ "count": count })))
}

async fn increment_video_count(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let count = database::increment_stat(state.db.as_ref(), VIDEO_GENERATION_COUNT, 1)
        .await
        .map_err(|e| {
            tracing::error!("Failed to increment video count: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    state.kv.put(VIDEO_GENERATION_COUNT, &count).await;
    Ok(Json(serde_json::json!({ "count": count })))
}

async fn list_themes() -> Json<Value> {
    Json(serde_json::json!(themes::theme_tags()))
}

fn error_body(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

fn log_db_error(e: ReelPipeError) -> StatusCode {
    tracing::error!("Database error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}
