//! Result entry, scientist review, and psychologist assessment.
//!
//! A result moves `awaiting_entry -> pending_review -> approved -> assessed`. A rejection sends it
//! back to the bench (`rejected`), from where the technician re-enters values.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::catalog::TestDefinition;
use super::domain::{
    LabResultRecord, MeasuredValue, PsychologistAssessment, ResultEntry, ResultStatus,
    ReviewDecision, ScientistReview, StaffId,
};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("cannot move result from {from} to {to}")]
    InvalidTransition {
        from: ResultStatus,
        to: ResultStatus,
    },
    #[error("analyte '{analyte}' is not part of test {test}")]
    UnknownAnalyte { analyte: String, test: String },
    #[error("missing value for analyte '{0}'")]
    MissingAnalyte(String),
    #[error("analyte '{0}' was entered more than once")]
    DuplicateAnalyte(String),
    #[error("value for analyte '{0}' is empty")]
    EmptyValue(String),
    #[error("rejecting a result requires reviewer comments")]
    MissingComments,
    #[error("test {0} does not take a psychologist assessment")]
    AssessmentNotRequired(String),
    #[error("assessment notes are empty")]
    EmptyAssessment,
}

impl ResultStatus {
    pub fn can_transition_to(self, next: ResultStatus) -> bool {
        matches!(
            (self, next),
            (ResultStatus::AwaitingEntry, ResultStatus::PendingReview)
                | (ResultStatus::Rejected, ResultStatus::PendingReview)
                | (ResultStatus::PendingReview, ResultStatus::Approved)
                | (ResultStatus::PendingReview, ResultStatus::Rejected)
                | (ResultStatus::Approved, ResultStatus::Assessed)
        )
    }
}

fn advance(record: &mut LabResultRecord, next: ResultStatus) -> Result<(), ReviewError> {
    if !record.status.can_transition_to(next) {
        return Err(ReviewError::InvalidTransition {
            from: record.status,
            to: next,
        });
    }
    record.status = next;
    Ok(())
}

/// Validate bench values against the test definition and queue the result for review.
pub fn record_entry(
    record: &mut LabResultRecord,
    definition: &TestDefinition,
    entries: Vec<ResultEntry>,
    technician: &StaffId,
    now: DateTime<Utc>,
) -> Result<(), ReviewError> {
    if !record.status.can_transition_to(ResultStatus::PendingReview) {
        return Err(ReviewError::InvalidTransition {
            from: record.status,
            to: ResultStatus::PendingReview,
        });
    }

    let mut seen = BTreeSet::new();
    let mut values = Vec::with_capacity(entries.len());
    for entry in entries {
        let analyte = definition.analyte(&entry.analyte).ok_or_else(|| {
            ReviewError::UnknownAnalyte {
                analyte: entry.analyte.trim().to_string(),
                test: definition.code.clone(),
            }
        })?;
        if !seen.insert(analyte.name.clone()) {
            return Err(ReviewError::DuplicateAnalyte(analyte.name.clone()));
        }

        let value = entry.value.trim();
        if value.is_empty() {
            return Err(ReviewError::EmptyValue(analyte.name.clone()));
        }

        values.push(MeasuredValue {
            analyte: analyte.name.clone(),
            value: value.to_string(),
            unit: analyte.unit.clone(),
            reference_range: analyte.reference_range(),
            flag: analyte.flag(value),
        });
    }

    if let Some(missing) = definition
        .analytes
        .iter()
        .find(|analyte| !seen.contains(&analyte.name))
    {
        return Err(ReviewError::MissingAnalyte(missing.name.clone()));
    }

    // keep catalog order regardless of entry order
    values.sort_by_key(|value| {
        definition
            .analytes
            .iter()
            .position(|analyte| analyte.name == value.analyte)
    });

    advance(record, ResultStatus::PendingReview)?;
    record.values = values;
    record.entered_by = Some(technician.clone());
    record.entered_at = Some(now);
    Ok(())
}

pub fn record_review(
    record: &mut LabResultRecord,
    decision: ReviewDecision,
    comments: &str,
    reviewer: &StaffId,
    now: DateTime<Utc>,
) -> Result<(), ReviewError> {
    let comments = comments.trim();
    let next = match decision {
        ReviewDecision::Approve => ResultStatus::Approved,
        ReviewDecision::Reject => {
            if comments.is_empty() {
                return Err(ReviewError::MissingComments);
            }
            ResultStatus::Rejected
        }
    };

    advance(record, next)?;
    record.reviews.push(ScientistReview {
        reviewer: reviewer.clone(),
        decision,
        comments: comments.to_string(),
        reviewed_at: now,
    });
    Ok(())
}

pub fn record_assessment(
    record: &mut LabResultRecord,
    notes: &str,
    assessor: &StaffId,
    now: DateTime<Utc>,
) -> Result<(), ReviewError> {
    if !record.requires_assessment {
        return Err(ReviewError::AssessmentNotRequired(record.test_code.clone()));
    }
    let notes = notes.trim();
    if notes.is_empty() {
        return Err(ReviewError::EmptyAssessment);
    }

    advance(record, ResultStatus::Assessed)?;
    record.assessment = Some(PsychologistAssessment {
        assessor: assessor.clone(),
        notes: notes.to_string(),
        assessed_at: now,
    });
    Ok(())
}
