use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::portal::domain::{
    AccessCode, AccessGrant, AuditEvent, LabResultRecord, NewStaffMember, PatientId,
    PatientRecord, PatientRegistration, PaymentRecord, PaymentReference, Registration,
    ResultEntry, ResultId, ResultStatus, StaffId, StaffMember, StaffRole,
};
use crate::portal::memory::{InMemoryAuditLog, InMemoryPortalRepository};
use crate::portal::repository::{AuditError, AuditSink, PortalRepository, RepositoryError};
use crate::portal::{portal_router, LabPortalService, PortalPolicy, TestCatalog, STAFF_HEADER};

pub(super) const ADMIN: &str = "admin";
pub(super) const DESK: &str = "desk-1";
pub(super) const TECH: &str = "tech-1";
pub(super) const SCIENTIST: &str = "sci-1";
pub(super) const PSYCHOLOGIST: &str = "psy-1";

pub(super) type MemoryService = LabPortalService<InMemoryPortalRepository, InMemoryAuditLog>;

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 7, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn staff(id: &str) -> StaffId {
    StaffId(id.to_string())
}

pub(super) fn build_service() -> (
    MemoryService,
    Arc<InMemoryPortalRepository>,
    Arc<InMemoryAuditLog>,
) {
    build_service_with_policy(PortalPolicy::default())
}

pub(super) fn build_service_with_policy(
    policy: PortalPolicy,
) -> (
    MemoryService,
    Arc<InMemoryPortalRepository>,
    Arc<InMemoryAuditLog>,
) {
    let repository = Arc::new(InMemoryPortalRepository::default());
    let audit = Arc::new(InMemoryAuditLog::default());
    let service = LabPortalService::new(
        repository.clone(),
        audit.clone(),
        TestCatalog::standard(),
        policy,
    );
    seed_staff(&service);
    (service, repository, audit)
}

pub(super) fn seed_staff<R, A>(service: &LabPortalService<R, A>)
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    service
        .seed_admin(&staff(ADMIN), "Lab Administrator", now())
        .expect("admin seeded");

    for (id, name, role) in [
        (DESK, "Front Desk", StaffRole::Receptionist),
        (TECH, "Bench Technician", StaffRole::Technician),
        (SCIENTIST, "Reviewing Scientist", StaffRole::Scientist),
        (PSYCHOLOGIST, "Clinical Psychologist", StaffRole::Psychologist),
    ] {
        service
            .register_staff(
                &staff(ADMIN),
                NewStaffMember {
                    staff_id: Some(id.to_string()),
                    name: name.to_string(),
                    role,
                },
                now(),
            )
            .expect("staff registered");
    }
}

pub(super) fn registration(tests: &[&str]) -> PatientRegistration {
    PatientRegistration {
        full_name: "Adaeze Okafor".to_string(),
        phone: "+234 803 555 0142".to_string(),
        email: Some("adaeze@example.com".to_string()),
        date_of_birth: None,
        referring_clinic: Some(" ".to_string()),
        tests: tests.iter().map(|code| code.to_string()).collect(),
    }
}

pub(super) fn entry(analyte: &str, value: &str) -> ResultEntry {
    ResultEntry {
        analyte: analyte.to_string(),
        value: value.to_string(),
    }
}

pub(super) fn result_for<'a>(results: &'a [LabResultRecord], code: &str) -> &'a LabResultRecord {
    results
        .iter()
        .find(|result| result.test_code == code)
        .expect("result for ordered test")
}

/// Register, pay in full, and return the payment reference with the created results.
pub(super) fn paid_registration(
    service: &MemoryService,
    tests: &[&str],
) -> (PaymentReference, Vec<LabResultRecord>) {
    let registration = service
        .register_patient(&staff(DESK), registration(tests), now())
        .expect("registration succeeds");
    let reference = registration.payment.reference.clone();
    service
        .confirm_payment(
            &staff(DESK),
            &reference.0,
            registration.payment.amount_due,
            now(),
        )
        .expect("payment confirmed");
    (reference, registration.results)
}

pub(super) fn approve_glucose(service: &MemoryService, result_id: &ResultId) {
    service
        .enter_result(&staff(TECH), result_id, vec![entry("Glucose", "6.4")], now())
        .expect("entry accepted");
    service
        .review_result(
            &staff(SCIENTIST),
            result_id,
            crate::portal::ReviewDecision::Approve,
            "consistent with impaired fasting glucose",
            now(),
        )
        .expect("approval recorded");
}

pub(super) struct UnavailableRepository;

fn outage() -> RepositoryError {
    RepositoryError::Unavailable("database offline".to_string())
}

fn offline<T>() -> Result<T, RepositoryError> {
    Err(outage())
}

impl PortalRepository for UnavailableRepository {
    fn insert_staff(&self, _staff: StaffMember) -> Result<StaffMember, RepositoryError> {
        offline()
    }

    fn update_staff(&self, _staff: StaffMember) -> Result<(), RepositoryError> {
        offline()
    }

    fn fetch_staff(&self, _id: &StaffId) -> Result<Option<StaffMember>, RepositoryError> {
        offline()
    }

    fn insert_registration(
        &self,
        _registration: Registration,
    ) -> Result<Registration, RepositoryError> {
        offline()
    }

    fn fetch_patient(&self, _id: &PatientId) -> Result<Option<PatientRecord>, RepositoryError> {
        offline()
    }

    fn update_result_with<T, E, F>(&self, _id: &ResultId, _apply: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut LabResultRecord) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        Err(outage().into())
    }

    fn fetch_result(&self, _id: &ResultId) -> Result<Option<LabResultRecord>, RepositoryError> {
        offline()
    }

    fn results_for_patient(
        &self,
        _patient: &PatientId,
    ) -> Result<Vec<LabResultRecord>, RepositoryError> {
        offline()
    }

    fn results_with_status(
        &self,
        _status: ResultStatus,
        _limit: usize,
    ) -> Result<Vec<LabResultRecord>, RepositoryError> {
        offline()
    }

    fn update_payment_with<T, E, F>(
        &self,
        _reference: &PaymentReference,
        _apply: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut PaymentRecord) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        Err(outage().into())
    }

    fn fetch_payment(
        &self,
        _reference: &PaymentReference,
    ) -> Result<Option<PaymentRecord>, RepositoryError> {
        offline()
    }

    fn payments_for_patient(
        &self,
        _patient: &PatientId,
    ) -> Result<Vec<PaymentRecord>, RepositoryError> {
        offline()
    }

    fn insert_grant(&self, _grant: AccessGrant) -> Result<AccessGrant, RepositoryError> {
        offline()
    }

    fn update_grant_with<T, E, F>(&self, _code: &AccessCode, _apply: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut AccessGrant) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        Err(outage().into())
    }

    fn fetch_grant(&self, _code: &AccessCode) -> Result<Option<AccessGrant>, RepositoryError> {
        offline()
    }

    fn grants_for_payment(
        &self,
        _reference: &PaymentReference,
    ) -> Result<Vec<AccessGrant>, RepositoryError> {
        offline()
    }
}

#[derive(Default)]
pub(super) struct FailingAudit;

impl AuditSink for FailingAudit {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::Transport("audit store offline".to_string()))
    }
}

pub(super) fn router_with_service(service: MemoryService) -> axum::Router {
    portal_router(Arc::new(service))
}

pub(super) fn json_request(
    method: &str,
    uri: &str,
    staff_id: Option<&str>,
    body: Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(id) = staff_id {
        builder = builder.header(STAFF_HEADER, id);
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).expect("json body")))
        .expect("request builds")
}

pub(super) fn get_request(uri: &str, staff_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(id) = staff_id {
        builder = builder.header(STAFF_HEADER, id);
    }
    builder.body(Body::empty()).expect("request builds")
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
