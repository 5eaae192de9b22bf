//! Earnings arithmetic for hourly and fixed monthly contracts.
//!
//! Everything here is pure and works at full `Decimal` precision; rounding
//! happens where an amount is persisted or presented.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::models::{ContractType, Task};

/// Money split for one contract over one billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EarningsBreakdown {
    pub total_hours: Decimal,
    pub freelancer_rate: Decimal,
    pub freelancer_earnings: Decimal,
    pub agency_earnings: Decimal,
    pub client_cost: Decimal,
}

/// Client-facing line: what quantity at what rate for how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineCharge {
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// Rate left to the freelancer after the agency commission.
pub fn freelancer_rate(rate: Decimal, agency_rate: Decimal) -> Decimal {
    rate * (Decimal::ONE_HUNDRED - agency_rate) / Decimal::ONE_HUNDRED
}

/// Sum of `billable_hours` over billable tasks. Wall-clock duration is ignored.
pub fn total_billable_hours(tasks: &[Task]) -> Decimal {
    tasks
        .iter()
        .filter(|task| task.is_billable)
        .map(|task| task.billable_hours)
        .sum()
}

/// Split earnings for `total_hours` of work at `rate` with an `agency_rate` percent cut.
///
/// Monthly contracts are all-or-nothing: any positive hours charge the full
/// fixed rate, zero hours charge nothing.
pub fn calculate_earnings(
    contract_type: ContractType,
    rate: Decimal,
    agency_rate: Decimal,
    total_hours: Decimal,
) -> EarningsBreakdown {
    let freelancer_rate = freelancer_rate(rate, agency_rate);
    let agency_share = agency_rate / Decimal::ONE_HUNDRED;

    let (freelancer_earnings, agency_earnings, client_cost) = match contract_type {
        ContractType::Hourly => (
            total_hours * freelancer_rate,
            total_hours * rate * agency_share,
            total_hours * rate,
        ),
        ContractType::Monthly if total_hours > Decimal::ZERO => {
            (freelancer_rate, rate * agency_share, rate)
        }
        ContractType::Monthly => (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
    };

    EarningsBreakdown {
        total_hours,
        freelancer_rate,
        freelancer_earnings,
        agency_earnings,
        client_cost,
    }
}

/// Invoice line for a contract, or `None` when nothing is chargeable.
pub fn line_charge(
    contract_type: ContractType,
    rate: Decimal,
    total_hours: Decimal,
) -> Option<LineCharge> {
    if total_hours <= Decimal::ZERO {
        return None;
    }

    let charge = match contract_type {
        ContractType::Hourly => LineCharge {
            quantity: total_hours,
            rate,
            amount: round_money(total_hours * rate),
        },
        ContractType::Monthly => LineCharge {
            quantity: Decimal::ONE,
            rate,
            amount: round_money(rate),
        },
    };

    Some(charge)
}

/// Round to cents, halves away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Minor currency units (cents) for a decimal amount.
pub fn to_minor_units(amount: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;

    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or_default()
}
