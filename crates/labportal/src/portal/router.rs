use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use super::access::AccessError;
use super::catalog::CatalogError;
use super::domain::{
    NewStaffMember, PatientId, PatientRegistration, ResultEntry, ResultId, ReviewDecision,
    StaffId,
};
use super::repository::{AuditSink, PortalRepository, RepositoryError};
use super::service::{LabPortalService, PortalServiceError};

/// Header carrying the acting staff member's id.
pub const STAFF_HEADER: &str = "x-staff-id";

const REVIEW_QUEUE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub(crate) struct ConfirmPaymentRequest {
    pub(crate) amount: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IssueAccessCodeRequest {
    pub(crate) payment_reference: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RetrieveResultsRequest {
    pub(crate) access_code: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EnterResultRequest {
    pub(crate) values: Vec<ResultEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewRequest {
    pub(crate) decision: ReviewDecision,
    #[serde(default)]
    pub(crate) comments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssessmentRequest {
    pub(crate) notes: String,
}

/// Router exposing staff workflows and the patient access-code endpoints.
pub fn portal_router<R, A>(service: Arc<LabPortalService<R, A>>) -> Router
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    Router::new()
        .route("/api/v1/catalog", get(catalog_handler::<R, A>))
        .route("/api/v1/staff", post(register_staff_handler::<R, A>))
        .route(
            "/api/v1/staff/:staff_id",
            delete(deactivate_staff_handler::<R, A>),
        )
        .route("/api/v1/patients", post(register_patient_handler::<R, A>))
        .route(
            "/api/v1/patients/:patient_id",
            get(patient_overview_handler::<R, A>),
        )
        .route(
            "/api/v1/payments/:reference/confirm",
            post(confirm_payment_handler::<R, A>),
        )
        .route("/api/v1/access/codes", post(issue_access_code_handler::<R, A>))
        .route(
            "/api/v1/access/results",
            post(retrieve_results_handler::<R, A>),
        )
        .route(
            "/api/v1/results/review-queue",
            get(review_queue_handler::<R, A>),
        )
        .route(
            "/api/v1/results/:result_id/entry",
            put(enter_result_handler::<R, A>),
        )
        .route(
            "/api/v1/results/:result_id/review",
            post(review_result_handler::<R, A>),
        )
        .route(
            "/api/v1/results/:result_id/assessment",
            post(assess_result_handler::<R, A>),
        )
        .with_state(service)
}

type PortalState<R, A> = State<Arc<LabPortalService<R, A>>>;

pub(crate) fn staff_from_headers(headers: &HeaderMap) -> Result<StaffId, Response> {
    headers
        .get(STAFF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| StaffId(value.to_string()))
        .ok_or_else(|| {
            let payload = json!({ "error": format!("missing {STAFF_HEADER} header") });
            (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
        })
}

pub(crate) fn status_for(error: &PortalServiceError) -> StatusCode {
    match error {
        PortalServiceError::UnknownStaff(_) => StatusCode::UNAUTHORIZED,
        PortalServiceError::InactiveStaff(_) | PortalServiceError::Forbidden { .. } => {
            StatusCode::FORBIDDEN
        }
        PortalServiceError::StaffNotFound(_)
        | PortalServiceError::PatientNotFound(_)
        | PortalServiceError::ResultNotFound(_) => StatusCode::NOT_FOUND,
        PortalServiceError::InvalidRequest(_)
        | PortalServiceError::Review(_)
        | PortalServiceError::Catalog(CatalogError::UnknownTest(_))
        | PortalServiceError::Catalog(CatalogError::QuoteOverflow) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PortalServiceError::Access(access) => match access {
            AccessError::UnknownPaymentReference(_) | AccessError::UnknownAccessCode => {
                StatusCode::NOT_FOUND
            }
            AccessError::PaymentNotConfirmed { .. }
            | AccessError::PaymentAlreadyConfirmed(_)
            | AccessError::ResultsNotReady => StatusCode::CONFLICT,
            AccessError::InvalidPaymentAmount => StatusCode::UNPROCESSABLE_ENTITY,
            AccessError::AccessCodeExpired { .. } | AccessError::AccessLimitReached { .. } => {
                StatusCode::GONE
            }
            AccessError::ExpiryOutOfRange => StatusCode::INTERNAL_SERVER_ERROR,
        },
        PortalServiceError::Repository(RepositoryError::Conflict) => StatusCode::CONFLICT,
        PortalServiceError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        PortalServiceError::Catalog(_)
        | PortalServiceError::Repository(RepositoryError::Unavailable(_))
        | PortalServiceError::Audit(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(error: PortalServiceError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        error!(error = %error, "portal request failed");
    } else {
        warn!(status = status.as_u16(), error = %error, "portal request rejected");
    }

    let payload = json!({ "error": error.to_string() });
    (status, Json(payload)).into_response()
}

fn respond<T: serde::Serialize>(
    status: StatusCode,
    outcome: Result<T, PortalServiceError>,
) -> Response {
    match outcome {
        Ok(body) => (status, Json(body)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn catalog_handler<R, A>(State(service): PortalState<R, A>) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let tests: Vec<_> = service.catalog().tests().cloned().collect();
    (StatusCode::OK, Json(json!({ "tests": tests }))).into_response()
}

pub(crate) async fn register_staff_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Json(request): Json<NewStaffMember>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::CREATED,
        service.register_staff(&actor, request, Utc::now()),
    )
}

pub(crate) async fn deactivate_staff_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Path(staff_id): Path<String>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    match service.deactivate_staff(&actor, &StaffId(staff_id), Utc::now()) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn register_patient_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Json(registration): Json<PatientRegistration>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::CREATED,
        service.register_patient(&actor, registration, Utc::now()),
    )
}

pub(crate) async fn patient_overview_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Path(patient_id): Path<String>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::OK,
        service.patient_overview(&actor, &PatientId(patient_id)),
    )
}

pub(crate) async fn confirm_payment_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Path(reference): Path<String>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::OK,
        service.confirm_payment(&actor, &reference, request.amount, Utc::now()),
    )
}

pub(crate) async fn issue_access_code_handler<R, A>(
    State(service): PortalState<R, A>,
    Json(request): Json<IssueAccessCodeRequest>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    respond(
        StatusCode::CREATED,
        service
            .issue_access_code(&request.payment_reference, Utc::now())
            .map(|grant| grant.view()),
    )
}

pub(crate) async fn retrieve_results_handler<R, A>(
    State(service): PortalState<R, A>,
    Json(request): Json<RetrieveResultsRequest>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    respond(
        StatusCode::OK,
        service.retrieve_results(&request.access_code, Utc::now()),
    )
}

pub(crate) async fn review_queue_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::OK,
        service.review_queue(&actor, REVIEW_QUEUE_LIMIT),
    )
}

pub(crate) async fn enter_result_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Path(result_id): Path<String>,
    Json(request): Json<EnterResultRequest>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::OK,
        service.enter_result(&actor, &ResultId(result_id), request.values, Utc::now()),
    )
}

pub(crate) async fn review_result_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Path(result_id): Path<String>,
    Json(request): Json<ReviewRequest>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::OK,
        service.review_result(
            &actor,
            &ResultId(result_id),
            request.decision,
            &request.comments,
            Utc::now(),
        ),
    )
}

pub(crate) async fn assess_result_handler<R, A>(
    State(service): PortalState<R, A>,
    headers: HeaderMap,
    Path(result_id): Path<String>,
    Json(request): Json<AssessmentRequest>,
) -> Response
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    let actor = match staff_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    respond(
        StatusCode::OK,
        service.assess_result(&actor, &ResultId(result_id), &request.notes, Utc::now()),
    )
}
