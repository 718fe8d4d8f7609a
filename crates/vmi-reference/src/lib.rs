// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference importer built on the `vmi-core` framework: synthetic gauge,
//! counter and categorical generators backed by random value sources. It
//! doubles as a load generator and as living documentation of the generator
//! API.

pub mod categorical;
pub mod config;
pub mod counter;
pub mod gauge;
pub mod sources;

pub use categorical::{categorical_task_builder, CategoricalMetrics};
pub use config::ReferenceConfig;
pub use counter::{counter_task_builder, CounterMetrics};
pub use gauge::{gauge_task_builder, GaugeMetrics};
