// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Orchestration of storage-layout experiments against a running
//! distributed filesystem cluster.

pub mod admin;
pub mod config;
pub mod executor;
pub mod experiment;
pub mod failure;
pub mod fanout;
pub mod lifecycle;
pub mod monitor;
pub mod poll;
pub mod recorder;
pub mod shutdown;
pub mod summary;
pub mod telemetry;
pub mod topology;
