// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod mutation;
pub mod user_service;
pub mod company_service;
pub mod propagation;
pub mod repository_factory;

// Re-export services for convenience
pub use user_service::{StandardUserService, UserService, UserView};
pub use company_service::{CompanyService, CompanyView, StandardCompanyService};
pub use propagation::{CompanyPropagationHandler, UserPropagationHandler};
