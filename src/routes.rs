use std::sync::Arc;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, web};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::database as db;
use crate::database::NewSubmission;
use crate::queue::JobQueue;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

#[derive(Deserialize, Debug)]
pub struct SubmitRequest {
    pub problem_id: i64,
    pub code: String,
    pub language: Option<String>,
    pub task_id: Option<i64>,
    pub user_id: Option<i64>,
}

#[derive(Serialize)]
struct SubmitResponse {
    submission_id: i64,
    status: &'static str,
}

/// Accepts a submission, persists it as `queued` and enqueues a judge job
/// with the problem's limits.
pub async fn post_submission_handler(
    body: web::Json<SubmitRequest>,
    db_pool: web::Data<Arc<SqlitePool>>,
    queue: web::Data<Arc<JobQueue>>,
) -> impl Responder {
    if body.code.trim().is_empty() {
        return HttpResponse::BadRequest().json(ErrorResponse {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
        });
    }

    let limits = match db::fetch_problem_limits(body.problem_id, db_pool.get_ref().clone()).await {
        Ok(Some(limits)) => limits,
        Ok(None) => {
            return HttpResponse::NotFound().json(ErrorResponse {
                reason: "ERR_NOT_FOUND",
                code: 3,
            });
        }
        Err(e) => {
            log::error!("Failed to look up problem {}: {e}", body.problem_id);
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            });
        }
    };

    let submission = NewSubmission {
        problem_id: body.problem_id,
        task_id: body.task_id,
        user_id: body.user_id,
        code: body.code.clone(),
        language: body.language.clone().unwrap_or_else(|| "cpp".to_string()),
    };

    let submission_id = match db::create_submission(&submission, db_pool.get_ref().clone()).await {
        Ok(id) => id,
        Err(e) => {
            log::error!("Failed to create submission: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            });
        }
    };

    if let Err(e) = queue.enqueue(submission_id, limits).await {
        log::error!("Failed to enqueue submission {submission_id}: {e}");
        return HttpResponse::InternalServerError().json(ErrorResponse {
            reason: "ERR_INTERNAL",
            code: 6,
        });
    }

    HttpResponse::Ok().json(SubmitResponse {
        submission_id,
        status: "queued",
    })
}

pub async fn get_submission_handler(
    path: web::Path<i64>,
    db_pool: web::Data<Arc<SqlitePool>>,
) -> impl Responder {
    let id = path.into_inner();

    match db::fetch_submission(id, db_pool.get_ref().clone()).await {
        Ok(Some(record)) => HttpResponse::Ok().json(record),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            reason: "ERR_NOT_FOUND",
            code: 3,
        }),
        Err(e) => {
            log::error!("Failed to fetch submission {id}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            })
        }
    }
}

pub async fn get_queue_status_handler(queue: web::Data<Arc<JobQueue>>) -> impl Responder {
    match queue.status().await {
        Ok(counts) => HttpResponse::Ok().json(counts),
        Err(e) => {
            log::error!("Failed to read queue status: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            })
        }
    }
}
