//! Usage period resolution
//!
//! Maps an organisation's subscription onto the window of usage that counts
//! against its allowance. Free accounts use a rolling 30-day window; paid
//! accounts use the month of the current billing term that "now" falls in,
//! derived from the subscription information cache.

use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use flaglane_shared::types::{Subscription, SubscriptionInformationCache};

use crate::error::{GovernanceError, GovernanceResult};

/// Rolling window length for free accounts, in days
pub const FREE_PLAN_WINDOW_DAYS: i64 = 30;

/// The usage window applicable to an organisation at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsagePeriod {
    pub starts_at: OffsetDateTime,
    /// Whole days between period start and now; rendered as "-{days}d" for
    /// the usage query collaborator
    pub days: i64,
    pub allowed_api_calls: i64,
}

/// Advance a timestamp by whole calendar months, clamping the day of month
/// to the target month's length (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(dt: OffsetDateTime, months: i32) -> OffsetDateTime {
    let zero_based = dt.year() * 12 + (dt.month() as i32 - 1) + months;
    let year = zero_based.div_euclid(12);
    let month_number = (zero_based.rem_euclid(12) + 1) as u8;
    let month = Month::try_from(month_number).unwrap_or(Month::January);

    let day = dt.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => dt.replace_date(date),
        // Unreachable for clamped days; keep the input rather than panic
        Err(_) => dt,
    }
}

/// Number of whole calendar months elapsed from `start` to `end`
/// (0 if `end` precedes `start`).
pub fn whole_months_between(start: OffsetDateTime, end: OffsetDateTime) -> i32 {
    if end < start {
        return 0;
    }
    let mut months = (end.year() - start.year()) * 12 + (end.month() as i32 - start.month() as i32);
    if add_months(start, months) > end {
        months -= 1;
    }
    months.max(0)
}

/// Resolve the usage period for an organisation.
///
/// Paid plans require the subscription information cache; when it is absent
/// this fails with [`GovernanceError::MissingBillingCache`] and the caller is
/// expected to log and skip the organisation, never abort the batch.
pub fn resolve_usage_period(
    organisation_id: Uuid,
    subscription: &Subscription,
    cache: Option<&SubscriptionInformationCache>,
    now: OffsetDateTime,
) -> GovernanceResult<UsagePeriod> {
    if subscription.is_free_plan() {
        // Default to a rolling month for free accounts
        return Ok(UsagePeriod {
            starts_at: now - Duration::days(FREE_PLAN_WINDOW_DAYS),
            days: FREE_PLAN_WINDOW_DAYS,
            allowed_api_calls: subscription.max_api_calls,
        });
    }

    let cache = cache.ok_or(GovernanceError::MissingBillingCache(organisation_id))?;
    let billing_starts_at = cache.current_billing_term_starts_at;

    // Truncate to the closest active month to get the start of the current period
    let month_delta = whole_months_between(billing_starts_at, now);
    let period_starts_at = add_months(billing_starts_at, month_delta);

    Ok(UsagePeriod {
        starts_at: period_starts_at,
        days: (now - period_starts_at).whole_days(),
        allowed_api_calls: cache.allowed_30d_api_calls,
    })
}
