// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer
//!
//! axum routers for the two services plus the HTTP error mapping.

pub mod company_api;
pub mod error;
pub mod user_api;

pub use company_api::company_router;
pub use error::ApiError;
pub use user_api::user_router;
