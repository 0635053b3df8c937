// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod repositories;
pub mod db;
pub mod propagation_channel;
pub mod peer_client;

pub use peer_client::{HttpCompanyPeer, HttpUserPeer};
pub use propagation_channel::{
    Delivery, PropagationChannel, PropagationReport, PropagationSender, PropagationWorker,
};
