// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Aggregates, value objects and the contracts the coordinators depend on.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Company and User aggregates, peer and repository traits

pub mod membership;
pub mod errors;
pub mod company;
pub mod user;
pub mod repository;
pub mod peer;
pub mod service_config;
