use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier assigned to a registered patient.
    PatientId
);
string_id!(
    /// Identifier of a single ordered test result.
    ResultId
);
string_id!(
    /// Identifier of a staff account.
    StaffId
);
string_id!(
    /// Invoice reference the patient quotes when claiming results.
    PaymentReference
);
string_id!(
    /// Token granting unauthenticated access to released results.
    AccessCode
);

impl PaymentReference {
    /// Normalize user input so lookups ignore surrounding whitespace and case.
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }
}

impl AccessCode {
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }
}

/// Roles that can be assigned to staff accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Admin,
    Receptionist,
    Technician,
    Scientist,
    Psychologist,
}

impl StaffRole {
    pub const fn label(self) -> &'static str {
        match self {
            StaffRole::Admin => "admin",
            StaffRole::Receptionist => "receptionist",
            StaffRole::Technician => "technician",
            StaffRole::Scientist => "scientist",
            StaffRole::Psychologist => "psychologist",
        }
    }

    /// Role gate for staff operations. Admins may do everything.
    pub fn permits(self, action: StaffAction) -> bool {
        match self {
            StaffRole::Admin => true,
            StaffRole::Receptionist => matches!(
                action,
                StaffAction::RegisterPatient | StaffAction::RecordPayment | StaffAction::ViewRecords
            ),
            StaffRole::Technician => {
                matches!(action, StaffAction::EnterResult | StaffAction::ViewRecords)
            }
            StaffRole::Scientist => {
                matches!(action, StaffAction::ReviewResult | StaffAction::ViewRecords)
            }
            StaffRole::Psychologist => {
                matches!(action, StaffAction::AssessResult | StaffAction::ViewRecords)
            }
        }
    }
}

impl fmt::Display for StaffRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Operations subject to role gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffAction {
    ManageStaff,
    RegisterPatient,
    RecordPayment,
    EnterResult,
    ReviewResult,
    AssessResult,
    ViewRecords,
}

impl fmt::Display for StaffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StaffAction::ManageStaff => "manage staff",
            StaffAction::RegisterPatient => "register patients",
            StaffAction::RecordPayment => "record payments",
            StaffAction::EnterResult => "enter results",
            StaffAction::ReviewResult => "review results",
            StaffAction::AssessResult => "assess results",
            StaffAction::ViewRecords => "view records",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub staff_id: StaffId,
    pub name: String,
    pub role: StaffRole,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Request payload for creating a staff account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStaffMember {
    #[serde(default)]
    pub staff_id: Option<String>,
    pub name: String,
    pub role: StaffRole,
}

/// Intake form captured at the front desk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRegistration {
    pub full_name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub referring_clinic: Option<String>,
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: PatientId,
    pub full_name: String,
    pub phone: String,
    pub email: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub referring_clinic: Option<String>,
    pub registered_by: StaffId,
    pub registered_at: DateTime<Utc>,
}

/// Lifecycle of an ordered test result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    AwaitingEntry,
    PendingReview,
    Approved,
    Rejected,
    Assessed,
}

impl ResultStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ResultStatus::AwaitingEntry => "awaiting_entry",
            ResultStatus::PendingReview => "pending_review",
            ResultStatus::Approved => "approved",
            ResultStatus::Rejected => "rejected",
            ResultStatus::Assessed => "assessed",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Interpretation of a measured value against its reference interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFlag {
    Low,
    Normal,
    High,
    Unflagged,
}

/// Raw value typed in by a technician.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub analyte: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasuredValue {
    pub analyte: String,
    pub value: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    pub flag: ResultFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// Scientist sign-off recorded against an entered result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScientistReview {
    pub reviewer: StaffId,
    pub decision: ReviewDecision,
    pub comments: String,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsychologistAssessment {
    pub assessor: StaffId,
    pub notes: String,
    pub assessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabResultRecord {
    pub result_id: ResultId,
    pub patient_id: PatientId,
    pub test_code: String,
    pub test_name: String,
    pub requires_assessment: bool,
    pub status: ResultStatus,
    pub values: Vec<MeasuredValue>,
    pub entered_by: Option<StaffId>,
    pub entered_at: Option<DateTime<Utc>>,
    /// Every review in order, including earlier rejections.
    pub reviews: Vec<ScientistReview>,
    pub assessment: Option<PsychologistAssessment>,
}

impl LabResultRecord {
    /// Whether the patient may see this result.
    pub fn is_released(&self) -> bool {
        match self.status {
            ResultStatus::Assessed => true,
            ResultStatus::Approved => !self.requires_assessment,
            _ => false,
        }
    }

    pub fn latest_review(&self) -> Option<&ScientistReview> {
        self.reviews.last()
    }

    pub fn released_view(&self) -> ReleasedResultView {
        ReleasedResultView {
            result_id: self.result_id.clone(),
            test_code: self.test_code.clone(),
            test_name: self.test_name.clone(),
            values: self.values.clone(),
            scientist_comments: self
                .latest_review()
                .map(|review| review.comments.clone())
                .filter(|comments| !comments.trim().is_empty()),
            assessment_notes: self.assessment.as_ref().map(|a| a.notes.clone()),
            approved_at: self.latest_review().map(|review| review.reviewed_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub reference: PaymentReference,
    pub patient_id: PatientId,
    pub amount_due: u32,
    pub amount_paid: u32,
    pub status: PaymentStatus,
    pub confirmed_by: Option<StaffId>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    pub fn outstanding(&self) -> u32 {
        self.amount_due.saturating_sub(self.amount_paid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub code: AccessCode,
    pub patient_id: PatientId,
    pub payment_reference: PaymentReference,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u32,
    pub max_accesses: u32,
}

impl AccessGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.access_count >= self.max_accesses
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_exhausted()
    }

    pub fn remaining_accesses(&self) -> u32 {
        self.max_accesses.saturating_sub(self.access_count)
    }

    pub fn view(&self) -> AccessGrantView {
        AccessGrantView {
            access_code: self.code.clone(),
            patient_id: self.patient_id.clone(),
            expires_at: self.expires_at,
            remaining_accesses: self.remaining_accesses(),
        }
    }
}

/// What the patient is shown after verifying their payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrantView {
    pub access_code: AccessCode,
    pub patient_id: PatientId,
    pub expires_at: DateTime<Utc>,
    pub remaining_accesses: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedResultView {
    pub result_id: ResultId,
    pub test_code: String,
    pub test_name: String,
    pub values: Vec<MeasuredValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scientist_comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

/// Payload returned for a successful access-code retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientResults {
    pub patient_id: PatientId,
    pub full_name: String,
    pub results: Vec<ReleasedResultView>,
    /// Ordered tests that are still in the lab.
    pub pending_tests: Vec<String>,
    pub remaining_accesses: u32,
    pub expires_at: DateTime<Utc>,
}

/// Everything created at the front desk for one visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub patient: PatientRecord,
    pub payment: PaymentRecord,
    pub results: Vec<LabResultRecord>,
}

/// Staff-facing summary of a patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientOverview {
    pub patient: PatientRecord,
    pub payments: Vec<PaymentRecord>,
    pub results: Vec<LabResultRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StaffRegistered,
    StaffDeactivated,
    PatientRegistered,
    PaymentRecorded,
    AccessCodeIssued,
    ResultsRetrieved,
    ResultEntered,
    ResultReviewed,
    ResultAssessed,
}

/// Append-only trail of who did what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub subject: String,
    pub details: BTreeMap<String, String>,
}

pub const PATIENT_ACTOR: &str = "patient";
