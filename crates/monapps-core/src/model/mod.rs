// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: grades, change tracking, entity rows and readings.

mod entities;
mod health;
mod reading;
mod tracked;

pub use entities::{
    AppSchedule, AppType, Application, Asset, CURR_STATE_FEED, Datafeed, Datastream, Device,
    Entity, STATUS_FEED,
};
pub use health::{HealthGrade, InvalidHealthGrade, ReevalFields, RollupField};
pub use reading::{Reading, ReadingKind, ReadingRange};
pub use tracked::{Field, Tracked};

/// "Nothing pending" due time (year 3000).
pub const MAX_TS_MS: i64 = 32_503_679_999_999;
