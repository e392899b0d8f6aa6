use rust_decimal::Decimal;
use thiserror::Error;

const WH_PER_KWH: i64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnergyResult {
    pub kwh: Decimal,
    pub warnings: Vec<EnergyWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyWarning {
    NegativeMeterDeltaClamped,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnergyComputationError {
    #[error("meter readings must not be negative (start {meter_start}, stop {meter_stop})")]
    NegativeMeterReading { meter_start: i64, meter_stop: i64 },
}

/// kWh delivered between two cumulative meter readings in Wh.
pub fn compute_session_kwh(
    meter_start_wh: i64,
    meter_stop_wh: i64,
) -> Result<SessionEnergyResult, EnergyComputationError> {
    if meter_start_wh < 0 || meter_stop_wh < 0 {
        return Err(EnergyComputationError::NegativeMeterReading {
            meter_start: meter_start_wh,
            meter_stop: meter_stop_wh,
        });
    }

    let raw_delta = meter_stop_wh - meter_start_wh;
    if raw_delta < 0 {
        return Ok(SessionEnergyResult {
            kwh: Decimal::ZERO,
            warnings: vec![EnergyWarning::NegativeMeterDeltaClamped],
        });
    }

    Ok(SessionEnergyResult {
        kwh: Decimal::from(raw_delta) / Decimal::from(WH_PER_KWH),
        warnings: Vec::new(),
    })
}
