// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Raw device message ingestion.
//!
//! A message carries payloads for any number of devices:
//!
//! ```json
//! {"dev-01": {"1700000000000": {"e": {...}, "w": {...}, "i": ["..."], "temp": 21.5}}}
//! ```
//!
//! Every device is handled in its own transaction so one bad payload never
//! blocks the others. Lock order inside a device is datastreams, then the
//! device, matching the health sweeps.

use std::collections::BTreeMap;

use monapps_core::model::{Datastream, Field, Reading, ReadingKind, Tracked};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::alarm_log::{self, AlarmLevel};
use crate::context::JobContext;
use crate::error::Result;
use crate::health;
use crate::scheduler;

/// Errors for messages that cannot be processed at all.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The message is not valid JSON.
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The message is valid JSON but not a device map.
    #[error("Message is not an object keyed by device")]
    NotAnObject,
}

/// Summary of one processed message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Devices whose payload was committed.
    pub devices: usize,
    /// Device payloads skipped (unknown device, malformed or failed).
    pub skipped: usize,
    /// Datastream readings written.
    pub readings: u64,
}

/// Writes raw device readings and folds device alarms into health.
#[derive(Debug, Clone)]
pub struct RawDataProcessor {
    ctx: JobContext,
}

/// Readings and alarms collected from one device payload.
#[derive(Debug, Default)]
struct DevicePayload {
    readings: BTreeMap<String, Vec<Reading>>,
    alarms: Option<(i64, Value, Value)>,
    infos: Vec<(i64, String)>,
}

impl RawDataProcessor {
    /// Create a processor.
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Process one broker message.
    pub async fn process_message(&self, raw: &[u8]) -> Result<IngestReport> {
        let message: Value = serde_json::from_slice(raw).map_err(IngestError::from)?;
        let Value::Object(devices) = message else {
            return Err(IngestError::NotAnObject.into());
        };

        let mut report = IngestReport::default();
        for (dev_ui, payload) in devices {
            let dev_ui = dev_ui.to_lowercase();
            let Value::Object(payload) = payload else {
                warn!(dev_ui = %dev_ui, "Device payload is not an object, skipping");
                alarm_log::record_for(
                    AlarmLevel::Warning,
                    "ingest",
                    self.ctx.now(),
                    &format!("Incorrect payload for device '{dev_ui}'"),
                );
                report.skipped += 1;
                continue;
            };

            match self.process_device(&dev_ui, payload).await {
                Ok(Some(written)) => {
                    report.devices += 1;
                    report.readings += written;
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(dev_ui = %dev_ui, error = %e, "Failed to process device payload");
                    report.skipped += 1;
                }
            }
        }

        debug!(
            devices = report.devices,
            skipped = report.skipped,
            readings = report.readings,
            "Processed raw data message"
        );
        Ok(report)
    }

    /// Process the payload of one device. `None` when the device is unknown.
    async fn process_device(
        &self,
        dev_ui: &str,
        payload: Map<String, Value>,
    ) -> Result<Option<u64>> {
        let parsed = parse_payload(dev_ui, payload);
        let now = self.ctx.now();
        let mut tx = self.ctx.store.begin().await?;

        let Some(device_id) = tx.find_device_id(dev_ui).await? else {
            warn!(dev_ui = %dev_ui, "Unknown device, skipping payload");
            tx.rollback().await?;
            return Ok(None);
        };
        let datastreams = tx.lock_datastreams_of_device(device_id).await?;
        let Some(device) = tx.lock_device(device_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut device = Tracked::new(device);

        let mut by_name: BTreeMap<String, Tracked<Datastream>> = datastreams
            .into_iter()
            .map(|ds| (ds.name.clone(), Tracked::new(ds)))
            .collect();

        let mut written = 0;
        let mut ds_health_changed = false;
        for (channel, mut readings) in parsed.readings {
            let Some(ds) = by_name.get_mut(&channel) else {
                debug!(dev_ui = %dev_ui, channel = %channel, "Unknown channel, skipping");
                continue;
            };
            if ds.is_value_integer {
                for reading in &mut readings {
                    reading.value = reading.value.round();
                }
            }
            let kind = if ds.is_enabled {
                ReadingKind::Valid
            } else {
                ReadingKind::Unused
            };
            written += tx.insert_ds_readings(ds.id, kind, &readings, true).await?;

            if kind == ReadingKind::Valid
                && let Some(latest) = readings.iter().map(|r| r.time).max()
            {
                ds.set_if_newer(Field::LastReadingTs, |d| &mut d.last_reading_ts, latest);
                ds_health_changed |= health::refresh_datastream_health(ds, now);
            }
        }

        if let Some((ts, errors, warnings)) = parsed.alarms {
            device.set(Field::Errors, |d| &mut d.errors, errors);
            device.set(Field::Warnings, |d| &mut d.warnings, warnings);
            let msg_health = health::msg_health_from_alarms(&device.errors, &device.warnings);
            if device.set(Field::MsgHealth, |d| &mut d.msg_health, msg_health) {
                debug!(dev_ui = %dev_ui, ts, health = %msg_health, "Device message health changed");
            }
        }

        let mut saved = Vec::new();
        for ds in by_name.into_values() {
            if ds.has_changes() {
                tx.save_datastream(&ds).await?;
                saved.push(ds.into_parts());
            }
        }
        if device.has_changes() {
            tx.save_device(&device).await?;
        }

        // After the save: the in-memory row still holds the old due time.
        if device.is_dirty(Field::MsgHealth) || ds_health_changed {
            scheduler::mark_device_dirty(&mut *tx, device.id, now, &self.ctx.debounce).await?;
        }

        tx.commit().await?;

        let (device, fields) = device.into_parts();
        for (ts, msg) in &parsed.infos {
            alarm_log::record(AlarmLevel::Info, &device, *ts, msg);
        }
        self.ctx.notifier.notify_updated(&device, &fields);
        for (ds, fields) in &saved {
            self.ctx.notifier.notify_updated(ds, fields);
        }

        Ok(Some(written))
    }
}

/// Split a device payload into per-channel readings, the newest alarm maps
/// and info messages. Malformed timestamps and non-numeric values are
/// skipped.
fn parse_payload(dev_ui: &str, payload: Map<String, Value>) -> DevicePayload {
    let mut parsed = DevicePayload::default();

    for (ts_key, entry) in payload {
        let Ok(ts) = ts_key.parse::<i64>() else {
            warn!(dev_ui = %dev_ui, ts = %ts_key, "Invalid timestamp, skipping entry");
            continue;
        };
        let Value::Object(entry) = entry else {
            warn!(dev_ui = %dev_ui, ts, "Entry is not an object, skipping");
            continue;
        };

        let mut errors = None;
        let mut warnings = None;
        for (key, value) in entry {
            match key.as_str() {
                "e" => errors = Some(value),
                "w" => warnings = Some(value),
                "i" => match value {
                    Value::Array(items) => parsed.infos.extend(
                        items
                            .into_iter()
                            .map(|item| (ts, item.as_str().map_or_else(|| item.to_string(), String::from))),
                    ),
                    Value::String(msg) => parsed.infos.push((ts, msg)),
                    _ => {}
                },
                _ => match value.as_f64() {
                    Some(v) if v.is_finite() => {
                        parsed.readings.entry(key).or_default().push(Reading::new(ts, v));
                    }
                    _ => debug!(dev_ui = %dev_ui, channel = %key, ts, "Non-numeric value, skipping"),
                },
            }
        }

        if (errors.is_some() || warnings.is_some())
            && parsed.alarms.as_ref().is_none_or(|(prev, _, _)| ts > *prev)
        {
            parsed.alarms = Some((
                ts,
                errors.unwrap_or_else(|| json!({})),
                warnings.unwrap_or_else(|| json!({})),
            ));
        }
    }

    for readings in parsed.readings.values_mut() {
        readings.sort_by_key(|r| r.time);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_parse_payload_splits_channels_and_alarms() {
        let parsed = parse_payload(
            "dev",
            payload(json!({
                "2000": {"temp": 21.5, "hum": 40, "e": {"overheat": {"v": 1}}},
                "1000": {"temp": 20.0, "w": {"low": {}}, "i": ["booted"]},
            })),
        );

        let temp = &parsed.readings["temp"];
        assert_eq!(temp.iter().map(|r| r.time).collect::<Vec<_>>(), vec![1000, 2000]);
        assert_eq!(parsed.readings["hum"], vec![Reading::new(2000, 40.0)]);

        let (ts, errors, warnings) = parsed.alarms.expect("alarms");
        assert_eq!(ts, 2000);
        assert_eq!(errors, json!({"overheat": {"v": 1}}));
        assert_eq!(warnings, json!({}));
        assert_eq!(parsed.infos, vec![(1000, "booted".to_string())]);
    }

    #[test]
    fn test_parse_payload_skips_garbage() {
        let parsed = parse_payload(
            "dev",
            payload(json!({
                "not-a-ts": {"temp": 1.0},
                "1000": {"temp": "warm", "flag": true, "ok": 3},
                "2000": 5,
            })),
        );
        assert_eq!(parsed.readings.len(), 1);
        assert_eq!(parsed.readings["ok"], vec![Reading::new(1000, 3.0)]);
        assert!(parsed.alarms.is_none());
    }
}
