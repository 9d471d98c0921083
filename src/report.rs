//! Chart-ready aggregation of payments, expenses and membership states.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    billing::{days_remaining, MembershipStatus, RENEWAL_WINDOW_DAYS},
    util::DecimalString,
};

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One payment or expense reduced to what the reports need.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry<'a> {
    pub year: i32,
    pub month: i32,
    pub label: &'a str,
    pub amount: Decimal,
}

impl Entry<'_> {
    fn within(&self, year: i32, month: Option<i32>) -> bool {
        self.year == year && month.map_or(true, |month| self.month == month)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MonthBucket {
    pub month: i32,
    pub label: String,
    pub amount: DecimalString,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Share {
    pub label: String,
    pub amount: DecimalString,
    pub count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct YearReport {
    pub year: i32,
    pub monthly: Vec<MonthBucket>,
    pub breakdown: Vec<Share>,
    pub total: DecimalString,
    pub count: usize,
}

/// Twelve buckets for `year`, months without entries included as zero.
pub fn monthly_buckets(entries: &[Entry], year: i32) -> Vec<MonthBucket> {
    let mut amounts = [Decimal::ZERO; 12];

    for entry in entries.iter().filter(|it| it.within(year, None)) {
        if let Some(slot) = usize::try_from(entry.month - 1)
            .ok()
            .and_then(|index| amounts.get_mut(index))
        {
            *slot += entry.amount;
        }
    }

    amounts
        .into_iter()
        .zip(MONTH_LABELS)
        .zip(1..)
        .map(|((amount, label), month)| MonthBucket {
            month,
            label: label.to_string(),
            amount: amount.into(),
        })
        .collect()
}

/// Totals per label, largest first.
pub fn breakdown(entries: &[Entry], year: i32, month: Option<i32>) -> Vec<Share> {
    let mut shares = BTreeMap::<&str, (Decimal, usize)>::new();

    for entry in entries.iter().filter(|it| it.within(year, month)) {
        let share = shares.entry(entry.label).or_default();
        share.0 += entry.amount;
        share.1 += 1;
    }

    let mut shares = shares
        .into_iter()
        .map(|(label, (amount, count))| Share {
            label: label.to_string(),
            amount: amount.into(),
            count,
        })
        .collect::<Vec<_>>();
    shares.sort_by(|a, b| b.amount.cmp(&a.amount));

    shares
}

pub fn total(entries: &[Entry], year: i32, month: Option<i32>) -> (Decimal, usize) {
    entries
        .iter()
        .filter(|it| it.within(year, month))
        .fold((Decimal::ZERO, 0), |(amount, count), it| {
            (amount + it.amount, count + 1)
        })
}

pub fn year_report(entries: &[Entry], year: i32) -> YearReport {
    let (total, count) = total(entries, year, None);

    YearReport {
        year,
        monthly: monthly_buckets(entries, year),
        breakdown: breakdown(entries, year, None),
        total: total.into(),
        count,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipCounts {
    pub active: usize,
    pub pending: usize,
    pub expired: usize,
    /// Active memberships with fewer than seven days left.
    pub expiring_soon: usize,
}

impl MembershipCounts {
    /// Counts by status recomputed from the dates, so stale stored statuses
    /// don't skew the dashboard. Pending stays pending until approved.
    pub fn tally<I>(memberships: I, now: OffsetDateTime) -> Self
    where
        I: IntoIterator<Item = (MembershipStatus, OffsetDateTime, OffsetDateTime)>,
    {
        memberships
            .into_iter()
            .fold(Self::default(), |mut counts, (stored, start, end)| {
                let status = match stored {
                    MembershipStatus::Pending => MembershipStatus::Pending,
                    _ => MembershipStatus::at(start, end, now),
                };

                match status {
                    MembershipStatus::Active => {
                        counts.active += 1;
                        if days_remaining(end, now) < RENEWAL_WINDOW_DAYS {
                            counts.expiring_soon += 1;
                        }
                    }
                    MembershipStatus::Pending => counts.pending += 1,
                    MembershipStatus::Expired => counts.expired += 1,
                }

                counts
            })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Summary {
    pub year: i32,
    pub month: Option<i32>,
    pub revenue: DecimalString,
    pub expenses: DecimalString,
    /// Revenue minus expenses, negative on a loss.
    pub profit: DecimalString,
    pub payment_count: usize,
    pub expense_count: usize,
    pub memberships: MembershipCounts,
    pub new_customers: usize,
}

pub fn summarize(
    payments: &[Entry],
    expenses: &[Entry],
    year: i32,
    month: Option<i32>,
    memberships: MembershipCounts,
    new_customers: usize,
) -> Summary {
    let (revenue, payment_count) = total(payments, year, month);
    let (spent, expense_count) = total(expenses, year, month);

    Summary {
        year,
        month,
        revenue: revenue.into(),
        expenses: spent.into(),
        profit: (revenue - spent).into(),
        payment_count,
        expense_count,
        memberships,
        new_customers,
    }
}
