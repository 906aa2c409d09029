use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::access::{
    self, check_grant, generate_access_code, generate_payment_reference, mint_grant, AccessError,
    PortalPolicy,
};
use super::catalog::{normalize_code, CatalogError, TestCatalog};
use super::domain::{
    AccessCode, AccessGrant, AuditAction, AuditEvent, LabResultRecord, NewStaffMember, PatientId,
    PatientOverview, PatientRecord, PatientRegistration, PatientResults, PaymentRecord,
    PaymentReference, PaymentStatus, Registration, ResultEntry, ResultFlag, ResultId,
    ResultStatus, ReviewDecision, StaffAction, StaffId, StaffMember, StaffRole, PATIENT_ACTOR,
};
use super::repository::{AuditError, AuditSink, PortalRepository, RepositoryError};
use super::review::{self, ReviewError};

/// Attempts at drawing a random code before giving up on collisions.
const MAX_CODE_ATTEMPTS: usize = 8;

/// Monotonic id source, one per service instance.
#[derive(Debug)]
struct Sequence {
    prefix: &'static str,
    next: AtomicU64,
}

impl Sequence {
    const fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            next: AtomicU64::new(1),
        }
    }

    fn next(&self) -> String {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{id:06}", self.prefix)
    }
}

/// Service composing the catalog, repository, audit trail, and access policy.
pub struct LabPortalService<R, A> {
    repository: Arc<R>,
    audit: Arc<A>,
    catalog: Arc<TestCatalog>,
    policy: PortalPolicy,
    patient_ids: Sequence,
    result_ids: Sequence,
    staff_ids: Sequence,
}

impl<R, A> LabPortalService<R, A>
where
    R: PortalRepository + 'static,
    A: AuditSink + 'static,
{
    pub fn new(
        repository: Arc<R>,
        audit: Arc<A>,
        catalog: TestCatalog,
        policy: PortalPolicy,
    ) -> Self {
        Self {
            repository,
            audit,
            catalog: Arc::new(catalog),
            policy,
            patient_ids: Sequence::new("PAT"),
            result_ids: Sequence::new("RES"),
            staff_ids: Sequence::new("STF"),
        }
    }

    pub fn catalog(&self) -> &TestCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &PortalPolicy {
        &self.policy
    }

    /// Create the bootstrap admin account if it does not exist yet.
    pub fn seed_admin(
        &self,
        staff_id: &StaffId,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<StaffMember, PortalServiceError> {
        if let Some(existing) = self.repository.fetch_staff(staff_id)? {
            return Ok(existing);
        }

        let admin = self.repository.insert_staff(StaffMember {
            staff_id: staff_id.clone(),
            name: name.to_string(),
            role: StaffRole::Admin,
            active: true,
            created_at: now,
        })?;
        info!(staff_id = %admin.staff_id, "seeded admin account");
        Ok(admin)
    }

    pub fn register_staff(
        &self,
        actor: &StaffId,
        request: NewStaffMember,
        now: DateTime<Utc>,
    ) -> Result<StaffMember, PortalServiceError> {
        self.authorize(actor, StaffAction::ManageStaff)?;

        let name = request.name.trim();
        if name.is_empty() {
            return Err(PortalServiceError::InvalidRequest(
                "staff name is required".to_string(),
            ));
        }
        let staff_id = match request.staff_id.as_deref().map(str::trim) {
            Some("") => {
                return Err(PortalServiceError::InvalidRequest(
                    "staff id cannot be blank".to_string(),
                ))
            }
            Some(id) => StaffId(id.to_string()),
            None => StaffId(self.staff_ids.next()),
        };

        let staff = self.repository.insert_staff(StaffMember {
            staff_id,
            name: name.to_string(),
            role: request.role,
            active: true,
            created_at: now,
        })?;

        self.record_audit(
            staff_actor(actor),
            AuditAction::StaffRegistered,
            staff.staff_id.to_string(),
            [("role", staff.role.label().to_string())],
            now,
        )?;
        Ok(staff)
    }

    pub fn deactivate_staff(
        &self,
        actor: &StaffId,
        staff_id: &StaffId,
        now: DateTime<Utc>,
    ) -> Result<StaffMember, PortalServiceError> {
        self.authorize(actor, StaffAction::ManageStaff)?;
        if actor == staff_id {
            return Err(PortalServiceError::InvalidRequest(
                "staff cannot deactivate their own account".to_string(),
            ));
        }

        let mut staff = self
            .repository
            .fetch_staff(staff_id)?
            .ok_or_else(|| PortalServiceError::StaffNotFound(staff_id.clone()))?;
        staff.active = false;
        self.repository.update_staff(staff.clone())?;

        self.record_audit(
            staff_actor(actor),
            AuditAction::StaffDeactivated,
            staff_id.to_string(),
            [],
            now,
        )?;
        Ok(staff)
    }

    /// Register a patient, raise the invoice, and open one result per ordered test.
    pub fn register_patient(
        &self,
        actor: &StaffId,
        registration: PatientRegistration,
        now: DateTime<Utc>,
    ) -> Result<Registration, PortalServiceError> {
        self.authorize(actor, StaffAction::RegisterPatient)?;
        let codes = self.validate_registration(&registration)?;
        let amount_due = self.catalog.quote(&codes)?;

        let patient = PatientRecord {
            patient_id: PatientId(self.patient_ids.next()),
            full_name: registration.full_name.trim().to_string(),
            phone: registration.phone.trim().to_string(),
            email: non_blank(registration.email),
            date_of_birth: registration.date_of_birth,
            referring_clinic: non_blank(registration.referring_clinic),
            registered_by: actor.clone(),
            registered_at: now,
        };

        let reference = self.unique_payment_reference()?;
        let status = if amount_due == 0 {
            PaymentStatus::Confirmed
        } else {
            PaymentStatus::Pending
        };
        let payment = PaymentRecord {
            reference,
            patient_id: patient.patient_id.clone(),
            amount_due,
            amount_paid: 0,
            status,
            confirmed_by: None,
            confirmed_at: (status == PaymentStatus::Confirmed).then_some(now),
        };

        let mut results = Vec::with_capacity(codes.len());
        for code in &codes {
            let definition = self.catalog.require(code)?;
            results.push(LabResultRecord {
                result_id: ResultId(self.result_ids.next()),
                patient_id: patient.patient_id.clone(),
                test_code: definition.code.clone(),
                test_name: definition.name.clone(),
                requires_assessment: definition.requires_assessment,
                status: ResultStatus::AwaitingEntry,
                values: Vec::new(),
                entered_by: None,
                entered_at: None,
                reviews: Vec::new(),
                assessment: None,
            });
        }

        let Registration {
            patient,
            payment,
            results,
        } = self.repository.insert_registration(Registration {
            patient,
            payment,
            results,
        })?;

        self.record_audit(
            staff_actor(actor),
            AuditAction::PatientRegistered,
            patient.patient_id.to_string(),
            [
                ("tests", codes.join(",")),
                ("payment_reference", payment.reference.to_string()),
            ],
            now,
        )?;
        info!(
            patient_id = %patient.patient_id,
            tests = codes.len(),
            amount_due,
            "patient registered"
        );

        Ok(Registration {
            patient,
            payment,
            results,
        })
    }

    pub fn confirm_payment(
        &self,
        actor: &StaffId,
        reference: &str,
        amount: u32,
        now: DateTime<Utc>,
    ) -> Result<PaymentRecord, PortalServiceError> {
        self.authorize(actor, StaffAction::RecordPayment)?;
        let reference = PaymentReference::normalize(reference);
        let payment = self
            .repository
            .update_payment_with(&reference, |payment| {
                access::apply_payment(payment, amount, actor, now)?;
                Ok::<_, PortalServiceError>(payment.clone())
            })?
            .ok_or_else(|| AccessError::UnknownPaymentReference(reference.clone()))?;

        self.record_audit(
            staff_actor(actor),
            AuditAction::PaymentRecorded,
            reference.to_string(),
            [
                ("amount", amount.to_string()),
                ("outstanding", payment.outstanding().to_string()),
            ],
            now,
        )?;
        let confirmed = payment.status == PaymentStatus::Confirmed;
        info!(%reference, amount, confirmed, "payment recorded");
        Ok(payment)
    }

    /// Exchange a confirmed payment reference for an access code.
    ///
    /// A grant that is still usable is returned as-is instead of minting a second code.
    pub fn issue_access_code(
        &self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, PortalServiceError> {
        let reference = PaymentReference::normalize(reference);
        let payment = self
            .repository
            .fetch_payment(&reference)?
            .ok_or_else(|| AccessError::UnknownPaymentReference(reference.clone()))?;
        if payment.status != PaymentStatus::Confirmed {
            return Err(AccessError::PaymentNotConfirmed {
                reference,
                outstanding: payment.outstanding(),
            }
            .into());
        }

        if let Some(active) = self
            .repository
            .grants_for_payment(&reference)?
            .into_iter()
            .find(|grant| grant.is_active(now))
        {
            debug!(%reference, "returning active access code");
            return Ok(active);
        }

        let code = self.unique_access_code()?;
        let grant = mint_grant(&payment, code, &self.policy, now)?;
        let grant = self.repository.insert_grant(grant)?;

        self.record_audit(
            PATIENT_ACTOR.to_string(),
            AuditAction::AccessCodeIssued,
            grant.patient_id.to_string(),
            [
                ("payment_reference", reference.to_string()),
                ("expires_at", grant.expires_at.to_rfc3339()),
            ],
            now,
        )?;
        info!(patient_id = %grant.patient_id, %reference, "access code issued");
        Ok(grant)
    }

    /// Resolve an access code to the patient's released results, counting the access.
    pub fn retrieve_results(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<PatientResults, PortalServiceError> {
        let code = AccessCode::normalize(code);
        let grant = self
            .repository
            .fetch_grant(&code)?
            .ok_or(AccessError::UnknownAccessCode)?;
        if let Err(err) = check_grant(&grant, now) {
            warn!(patient_id = %grant.patient_id, error = %err, "access code refused");
            return Err(err.into());
        }

        let patient = self
            .repository
            .fetch_patient(&grant.patient_id)?
            .ok_or_else(|| PortalServiceError::PatientNotFound(grant.patient_id.clone()))?;
        let (released, pending): (Vec<_>, Vec<_>) = self
            .repository
            .results_for_patient(&patient.patient_id)?
            .into_iter()
            .partition(LabResultRecord::is_released);
        if released.is_empty() {
            return Err(AccessError::ResultsNotReady.into());
        }

        // the limit is checked again under the repository lock before the access counts
        let grant = self
            .repository
            .update_grant_with(&code, |grant| {
                check_grant(grant, now)?;
                grant.access_count += 1;
                Ok::<_, PortalServiceError>(grant.clone())
            })?
            .ok_or(AccessError::UnknownAccessCode)?;

        self.record_audit(
            PATIENT_ACTOR.to_string(),
            AuditAction::ResultsRetrieved,
            patient.patient_id.to_string(),
            [
                ("released", released.len().to_string()),
                ("access_count", grant.access_count.to_string()),
            ],
            now,
        )?;

        Ok(PatientResults {
            patient_id: patient.patient_id,
            full_name: patient.full_name,
            results: released.iter().map(LabResultRecord::released_view).collect(),
            pending_tests: pending.into_iter().map(|result| result.test_name).collect(),
            remaining_accesses: grant.remaining_accesses(),
            expires_at: grant.expires_at,
        })
    }

    pub fn enter_result(
        &self,
        actor: &StaffId,
        result_id: &ResultId,
        values: Vec<ResultEntry>,
        now: DateTime<Utc>,
    ) -> Result<LabResultRecord, PortalServiceError> {
        self.authorize(actor, StaffAction::EnterResult)?;
        let record = self.update_result(result_id, |record| {
            let definition = self.catalog.require(&record.test_code)?;
            review::record_entry(record, definition, values, actor, now)?;
            Ok(())
        })?;

        let abnormal = record
            .values
            .iter()
            .filter(|value| matches!(value.flag, ResultFlag::Low | ResultFlag::High))
            .count();
        self.record_audit(
            staff_actor(actor),
            AuditAction::ResultEntered,
            result_id.to_string(),
            [("abnormal_values", abnormal.to_string())],
            now,
        )?;
        Ok(record)
    }

    pub fn review_result(
        &self,
        actor: &StaffId,
        result_id: &ResultId,
        decision: ReviewDecision,
        comments: &str,
        now: DateTime<Utc>,
    ) -> Result<LabResultRecord, PortalServiceError> {
        self.authorize(actor, StaffAction::ReviewResult)?;
        let record = self.update_result(result_id, |record| {
            Ok(review::record_review(record, decision, comments, actor, now)?)
        })?;

        self.record_audit(
            staff_actor(actor),
            AuditAction::ResultReviewed,
            result_id.to_string(),
            [("status", record.status.label().to_string())],
            now,
        )?;
        info!(%result_id, status = record.status.label(), "result reviewed");
        Ok(record)
    }

    pub fn assess_result(
        &self,
        actor: &StaffId,
        result_id: &ResultId,
        notes: &str,
        now: DateTime<Utc>,
    ) -> Result<LabResultRecord, PortalServiceError> {
        self.authorize(actor, StaffAction::AssessResult)?;
        let record = self.update_result(result_id, |record| {
            Ok(review::record_assessment(record, notes, actor, now)?)
        })?;

        self.record_audit(
            staff_actor(actor),
            AuditAction::ResultAssessed,
            result_id.to_string(),
            [],
            now,
        )?;
        Ok(record)
    }

    pub fn review_queue(
        &self,
        actor: &StaffId,
        limit: usize,
    ) -> Result<Vec<LabResultRecord>, PortalServiceError> {
        self.authorize(actor, StaffAction::ViewRecords)?;
        Ok(self
            .repository
            .results_with_status(ResultStatus::PendingReview, limit)?)
    }

    pub fn patient_overview(
        &self,
        actor: &StaffId,
        patient_id: &PatientId,
    ) -> Result<PatientOverview, PortalServiceError> {
        self.authorize(actor, StaffAction::ViewRecords)?;
        let patient = self
            .repository
            .fetch_patient(patient_id)?
            .ok_or_else(|| PortalServiceError::PatientNotFound(patient_id.clone()))?;
        let payments = self.repository.payments_for_patient(patient_id)?;
        let results = self.repository.results_for_patient(patient_id)?;

        Ok(PatientOverview {
            patient,
            payments,
            results,
        })
    }

    fn authorize(
        &self,
        actor: &StaffId,
        action: StaffAction,
    ) -> Result<StaffMember, PortalServiceError> {
        let staff = self
            .repository
            .fetch_staff(actor)?
            .ok_or_else(|| PortalServiceError::UnknownStaff(actor.clone()))?;
        if !staff.active {
            return Err(PortalServiceError::InactiveStaff(actor.clone()));
        }
        if !staff.role.permits(action) {
            warn!(staff_id = %actor, role = staff.role.label(), %action, "staff action refused");
            return Err(PortalServiceError::Forbidden {
                role: staff.role,
                action,
            });
        }
        Ok(staff)
    }

    fn validate_registration(
        &self,
        registration: &PatientRegistration,
    ) -> Result<Vec<String>, PortalServiceError> {
        if registration.full_name.trim().is_empty() {
            return Err(PortalServiceError::InvalidRequest(
                "patient full name is required".to_string(),
            ));
        }
        if registration.phone.trim().is_empty() {
            return Err(PortalServiceError::InvalidRequest(
                "patient phone number is required".to_string(),
            ));
        }
        if registration.tests.is_empty() {
            return Err(PortalServiceError::InvalidRequest(
                "at least one test must be ordered".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        let mut codes = Vec::with_capacity(registration.tests.len());
        for raw in &registration.tests {
            let code = normalize_code(raw);
            if !seen.insert(code.clone()) {
                return Err(PortalServiceError::InvalidRequest(format!(
                    "test {code} ordered more than once"
                )));
            }
            self.catalog.require(&code)?;
            codes.push(code);
        }
        Ok(codes)
    }

    /// Apply a workflow step to the stored result as a single repository update.
    fn update_result(
        &self,
        result_id: &ResultId,
        step: impl FnOnce(&mut LabResultRecord) -> Result<(), PortalServiceError>,
    ) -> Result<LabResultRecord, PortalServiceError> {
        self.repository
            .update_result_with(result_id, |record| {
                step(record)?;
                Ok::<_, PortalServiceError>(record.clone())
            })?
            .ok_or_else(|| PortalServiceError::ResultNotFound(result_id.clone()))
    }

    fn unique_payment_reference(&self) -> Result<PaymentReference, PortalServiceError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let reference = generate_payment_reference(&mut rng);
            if self.repository.fetch_payment(&reference)?.is_none() {
                return Ok(reference);
            }
        }
        Err(RepositoryError::Conflict.into())
    }

    fn unique_access_code(&self) -> Result<AccessCode, PortalServiceError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_access_code(&mut rng);
            if self.repository.fetch_grant(&code)?.is_none() {
                return Ok(code);
            }
        }
        Err(RepositoryError::Conflict.into())
    }

    fn record_audit<const N: usize>(
        &self,
        actor: String,
        action: AuditAction,
        subject: String,
        details: [(&str, String); N],
        now: DateTime<Utc>,
    ) -> Result<(), PortalServiceError> {
        let details = details
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<BTreeMap<_, _>>();
        self.audit.record(AuditEvent {
            at: now,
            actor,
            action,
            subject,
            details,
        })?;
        Ok(())
    }
}

fn staff_actor(staff_id: &StaffId) -> String {
    format!("staff:{staff_id}")
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Error raised by the portal service.
#[derive(Debug, thiserror::Error)]
pub enum PortalServiceError {
    #[error("staff member {0} is not registered")]
    UnknownStaff(StaffId),
    #[error("staff member {0} is deactivated")]
    InactiveStaff(StaffId),
    #[error("{role} staff may not {action}")]
    Forbidden {
        role: StaffRole,
        action: StaffAction,
    },
    #[error("staff member {0} not found")]
    StaffNotFound(StaffId),
    #[error("patient {0} not found")]
    PatientNotFound(PatientId),
    #[error("result {0} not found")]
    ResultNotFound(ResultId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}
