use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use super::domain::{
    AccessCode, AccessGrant, PaymentRecord, PaymentReference, PaymentStatus, StaffId,
};

pub const ACCESS_CODE_LENGTH: usize = 8;

/// Upper-case letters and digits without the easily confused 0/O and 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const DEFAULT_ACCESS_CODE_TTL_HOURS: i64 = 72;
const DEFAULT_MAX_ACCESSES: u32 = 5;
/// Longest lifetime an access code may be given (one year).
pub const MAX_ACCESS_CODE_TTL_HOURS: i64 = 24 * 365;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("no payment found for reference {0}")]
    UnknownPaymentReference(PaymentReference),
    #[error("payment {reference} is not confirmed ({outstanding} outstanding)")]
    PaymentNotConfirmed {
        reference: PaymentReference,
        outstanding: u32,
    },
    #[error("payment {0} is already confirmed")]
    PaymentAlreadyConfirmed(PaymentReference),
    #[error("payment amount must be greater than zero")]
    InvalidPaymentAmount,
    #[error("access code not recognised")]
    UnknownAccessCode,
    #[error("access code expired at {expired_at}")]
    AccessCodeExpired { expired_at: DateTime<Utc> },
    #[error("access code has been used the maximum of {max_accesses} times")]
    AccessLimitReached { max_accesses: u32 },
    #[error("results are not ready yet")]
    ResultsNotReady,
    #[error("access code expiry falls outside the supported date range")]
    ExpiryOutOfRange,
}

/// Lifetime and usage limits applied to newly issued access codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalPolicy {
    access_code_ttl: Duration,
    max_accesses: u32,
}

impl PortalPolicy {
    /// Non-positive values fall back to the defaults; lifetimes are capped at one year.
    pub fn new(access_code_ttl_hours: i64, max_accesses: u32) -> Self {
        let ttl_hours = if access_code_ttl_hours > 0 {
            access_code_ttl_hours.min(MAX_ACCESS_CODE_TTL_HOURS)
        } else {
            DEFAULT_ACCESS_CODE_TTL_HOURS
        };
        let max_accesses = if max_accesses > 0 {
            max_accesses
        } else {
            DEFAULT_MAX_ACCESSES
        };

        Self {
            access_code_ttl: Duration::hours(ttl_hours),
            max_accesses,
        }
    }

    pub fn access_code_ttl(&self) -> Duration {
        self.access_code_ttl
    }

    pub fn max_accesses(&self) -> u32 {
        self.max_accesses
    }
}

impl Default for PortalPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ACCESS_CODE_TTL_HOURS, DEFAULT_MAX_ACCESSES)
    }
}

fn random_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ACCESS_CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn generate_access_code<R: Rng + ?Sized>(rng: &mut R) -> AccessCode {
    AccessCode(random_token(rng))
}

pub fn generate_payment_reference<R: Rng + ?Sized>(rng: &mut R) -> PaymentReference {
    PaymentReference(format!("PAY-{}", random_token(rng)))
}

/// Apply an amount received at the desk. The payment confirms once fully covered.
pub fn apply_payment(
    payment: &mut PaymentRecord,
    amount: u32,
    staff: &StaffId,
    now: DateTime<Utc>,
) -> Result<(), AccessError> {
    if payment.status == PaymentStatus::Confirmed {
        return Err(AccessError::PaymentAlreadyConfirmed(
            payment.reference.clone(),
        ));
    }
    if amount == 0 {
        return Err(AccessError::InvalidPaymentAmount);
    }

    payment.amount_paid = payment.amount_paid.saturating_add(amount);
    if payment.amount_paid >= payment.amount_due {
        payment.status = PaymentStatus::Confirmed;
        payment.confirmed_by = Some(staff.clone());
        payment.confirmed_at = Some(now);
    }
    Ok(())
}

pub fn mint_grant(
    payment: &PaymentRecord,
    code: AccessCode,
    policy: &PortalPolicy,
    now: DateTime<Utc>,
) -> Result<AccessGrant, AccessError> {
    if payment.status != PaymentStatus::Confirmed {
        return Err(AccessError::PaymentNotConfirmed {
            reference: payment.reference.clone(),
            outstanding: payment.outstanding(),
        });
    }

    let expires_at = now
        .checked_add_signed(policy.access_code_ttl())
        .ok_or(AccessError::ExpiryOutOfRange)?;

    Ok(AccessGrant {
        code,
        patient_id: payment.patient_id.clone(),
        payment_reference: payment.reference.clone(),
        issued_at: now,
        expires_at,
        access_count: 0,
        max_accesses: policy.max_accesses(),
    })
}

pub fn check_grant(grant: &AccessGrant, now: DateTime<Utc>) -> Result<(), AccessError> {
    if grant.is_expired(now) {
        return Err(AccessError::AccessCodeExpired {
            expired_at: grant.expires_at,
        });
    }
    if grant.is_exhausted() {
        return Err(AccessError::AccessLimitReached {
            max_accesses: grant.max_accesses,
        });
    }
    Ok(())
}
