//! Membership billing rules: amount breakdowns, renewal windows, status and
//! the reporting period fields stamped onto payments and expenses.

use bson::oid::ObjectId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Renewal opens when fewer than this many days remain.
pub const RENEWAL_WINDOW_DAYS: i64 = 7;

/// Receipts kept per user; older ones are evicted on insert.
pub const RECEIPTS_PER_USER: usize = 5;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountBreakdown {
    pub base_amount: Decimal,
    pub registration_fee: Decimal,
    pub discount: Decimal,
    pub total_amount: Decimal,
}

/// Form inputs that shape the amount of a membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmountInput {
    pub registration_fee: bool,
    pub custom_registration_fee: Decimal,
    pub discount: bool,
    pub discount_amount: Decimal,
}

pub fn compute_amounts(plan_price: Decimal, input: &AmountInput) -> AmountBreakdown {
    let registration_fee = if input.registration_fee {
        input.custom_registration_fee
    } else {
        Decimal::ZERO
    };
    let discount = if input.discount {
        input.discount_amount
    } else {
        Decimal::ZERO
    };

    AmountBreakdown {
        base_amount: plan_price,
        registration_fee,
        discount,
        total_amount: (plan_price + registration_fee - discount).max(Decimal::ZERO),
    }
}

/// Whole days until `end`, counting a started day as a full one.
pub fn days_remaining(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (end - now).whole_seconds();
    let days = seconds / SECONDS_PER_DAY;

    if seconds > 0 && seconds % SECONDS_PER_DAY != 0 {
        days + 1
    } else {
        days
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Renewal,
    UpdateOnly,
}

pub fn decide_edit(end: OffsetDateTime, now: OffsetDateTime) -> EditKind {
    if days_remaining(end, now) < RENEWAL_WINDOW_DAYS {
        EditKind::Renewal
    } else {
        EditKind::UpdateOnly
    }
}

pub fn renewal_window(now: OffsetDateTime, duration_days: i64) -> (OffsetDateTime, OffsetDateTime) {
    (now, now + Duration::days(duration_days))
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipStatus {
    Active,
    Pending,
    Expired,
}

impl MembershipStatus {
    pub fn at(start: OffsetDateTime, end: OffsetDateTime, now: OffsetDateTime) -> Self {
        if start > now {
            Self::Pending
        } else if end < now {
            Self::Expired
        } else {
            Self::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Pending => "Pending",
            Self::Expired => "Expired",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeriodFields {
    pub month: i32,
    pub year: i32,
    pub quarter: i32,
    pub month_key: String,
}

impl PeriodFields {
    pub fn of(at: OffsetDateTime) -> Self {
        let month = i32::from(u8::from(at.month()));
        let year = at.year();

        Self {
            month,
            year,
            quarter: (month - 1) / 3 + 1,
            month_key: format!("{year:04}-{month:02}"),
        }
    }
}

/// Ids of the receipts that fall outside the `keep` newest by creation time.
pub fn receipts_to_evict(
    mut existing: Vec<(ObjectId, OffsetDateTime)>,
    keep: usize,
) -> Vec<ObjectId> {
    existing.sort_by(|(a_id, a_at), (b_id, b_at)| b_at.cmp(a_at).then_with(|| b_id.cmp(a_id)));

    existing.into_iter().skip(keep).map(|(id, _)| id).collect()
}

pub fn generate_transaction_id(now: OffsetDateTime) -> String {
    let suffix = ObjectId::new().to_hex();
    format!(
        "TXN{}{}",
        now.unix_timestamp(),
        suffix[suffix.len() - 6..].to_uppercase()
    )
}

pub fn generate_receipt_number(now: OffsetDateTime) -> String {
    let suffix = ObjectId::new().to_hex();
    format!(
        "RCPT-{:04}{:02}{:02}-{}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        suffix[suffix.len() - 6..].to_uppercase()
    )
}
