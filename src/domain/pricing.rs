use std::cmp::Ordering;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::models::{CostBreakdown, PricingSnapshot, TariffRecord, TariffScope};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PricingError {
    #[error("{0} exceeds the representable amount range")]
    Overflow(&'static str),
}

/// `connection_fee + kWh * price + max(0, idle - grace) * idle_fee`, in exact decimals.
pub fn compute_cost(
    pricing: &PricingSnapshot,
    energy_kwh: Decimal,
    idle_minutes: Decimal,
) -> Result<CostBreakdown, PricingError> {
    let energy_cost = energy_kwh
        .checked_mul(pricing.price_kwh)
        .ok_or(PricingError::Overflow("energy cost"))?;
    let billable_idle_minutes = idle_minutes
        .checked_sub(pricing.idle_grace_minutes)
        .ok_or(PricingError::Overflow("billable idle minutes"))?
        .max(Decimal::ZERO);
    let idle_cost = billable_idle_minutes
        .checked_mul(pricing.idle_fee_per_minute)
        .ok_or(PricingError::Overflow("idle cost"))?;
    let total = pricing
        .connection_fee
        .checked_add(energy_cost)
        .and_then(|subtotal| subtotal.checked_add(idle_cost))
        .ok_or(PricingError::Overflow("total"))?;

    Ok(CostBreakdown {
        price_kwh: pricing.price_kwh,
        energy_kwh,
        energy_cost,
        idle_minutes,
        billable_idle_minutes,
        idle_cost,
        connection_fee: pricing.connection_fee,
        total,
    })
}

/// Picks the winning tariff among candidates already known to be valid for
/// the instant and mode: charge-box scope beats global, then the most
/// recently created row.
pub fn pick_tariff(candidates: &[TariffRecord]) -> Option<&TariffRecord> {
    candidates.iter().max_by(|left, right| rank(left, right))
}

fn rank(left: &TariffRecord, right: &TariffRecord) -> Ordering {
    scope_weight(left.scope)
        .cmp(&scope_weight(right.scope))
        .then_with(|| left.created_at.cmp(&right.created_at))
        .then_with(|| left.revision.cmp(&right.revision))
}

fn scope_weight(scope: TariffScope) -> u8 {
    match scope {
        TariffScope::Global => 0,
        TariffScope::ChargeBox => 1,
    }
}
