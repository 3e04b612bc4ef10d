// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod common;
pub mod service;
pub mod stateful_set;

pub use common::*;
pub use service::*;
pub use stateful_set::*;
