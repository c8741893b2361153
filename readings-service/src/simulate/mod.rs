use std::str::FromStr;

use futures::{StreamExt, TryStreamExt};
use time::{Duration, OffsetDateTime};

use meter_store::{
    db::FieldAccess,
    domain::{meter::fields as meter_fields, Meter},
    PartitionStore,
};

use crate::{error::ServiceError, writer::ReadingWriter};

const BASE_VOLUME_M3: f64 = 0.010;
const NOISE_SPAN_M3: f64 = 0.006;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    FiveMinutes,
    FifteenMinutes,
    Hourly,
    SixHourly,
    Daily,
}

impl Frequency {
    pub fn step(self) -> Duration {
        match self {
            Frequency::FiveMinutes => Duration::minutes(5),
            Frequency::FifteenMinutes => Duration::minutes(15),
            Frequency::Hourly => Duration::hours(1),
            Frequency::SixHourly => Duration::hours(6),
            Frequency::Daily => Duration::days(1),
        }
    }
}

impl FromStr for Frequency {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "5m" => Ok(Frequency::FiveMinutes),
            "15m" => Ok(Frequency::FifteenMinutes),
            "1h" => Ok(Frequency::Hourly),
            "6h" => Ok(Frequency::SixHourly),
            "1d" => Ok(Frequency::Daily),
            other => Err(ServiceError::InvalidArgument(format!(
                "unknown frequency '{other}', expected one of 5m, 15m, 1h, 6h, 1d"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterSelection {
    Ids(Vec<String>),
    /// The first `n` meters in id order.
    First(usize),
}

#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub frequency: Frequency,
    pub meters: MeterSelection,
}

/// Synthetic delta volume around 10 litres, stable for a given meter and
/// instant.
pub fn simulated_volume(meter_id: &str, ts: OffsetDateTime) -> f64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(meter_id.as_bytes());
    hasher.update(&ts.unix_timestamp().to_le_bytes());
    let sample = f64::from(hasher.finalize().as_bytes()[0]) / 255.0;
    (BASE_VOLUME_M3 + (sample - 0.5) * NOISE_SPAN_M3).max(0.0)
}

/// Generates readings for existing meters through the [`ReadingWriter`].
pub struct Simulator<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> Simulator<'a, S>
where
    S: PartitionStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Returns the number of readings written.
    pub async fn run(&self, plan: &SimulationPlan) -> Result<u64, ServiceError> {
        if plan.end < plan.start {
            return Err(ServiceError::InvalidArgument(format!(
                "simulation end {} is before start {}",
                plan.end, plan.start
            )));
        }

        let meters = self.select_meters(&plan.meters).await?;
        if meters.is_empty() {
            tracing::warn!("no meters selected, nothing to simulate");
            return Ok(0);
        }

        let writer = ReadingWriter::new(self.store);
        let step = plan.frequency.step();
        let mut total = 0u64;
        for (meter_id, client_id) in &meters {
            let mut written = 0u64;
            let mut ts = plan.start;
            while ts <= plan.end {
                writer
                    .write_reading(meter_id, client_id.as_deref(), ts, simulated_volume(meter_id, ts))
                    .await?;
                written += 1;
                ts += step;
            }
            tracing::info!(meter_id = %meter_id, written, "meter simulated");
            total += written;
        }
        Ok(total)
    }

    /// Resolves the selection to (meter id, client id) pairs.
    async fn select_meters(
        &self,
        selection: &MeterSelection,
    ) -> Result<Vec<(String, Option<String>)>, ServiceError> {
        match selection {
            MeterSelection::Ids(ids) => {
                let mut meters = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.store.get(&Meter::path(id).map_err(ServiceError::bad_id)?).await? {
                        Some(doc) => meters.push((
                            id.clone(),
                            doc.str_field(meter_fields::CLIENT_ID).map(str::to_string),
                        )),
                        None => tracing::warn!(meter_id = %id, "meter not found, skipped"),
                    }
                }
                Ok(meters)
            }
            MeterSelection::First(limit) => {
                let meters: Vec<(String, Option<String>)> = self
                    .store
                    .list(&Meter::collection()?)
                    .take(*limit)
                    .map_ok(|snap| {
                        let client = snap.data.str_field(meter_fields::CLIENT_ID).map(str::to_string);
                        (snap.id().to_string(), client)
                    })
                    .try_collect()
                    .await?;
                Ok(meters)
            }
        }
    }
}
