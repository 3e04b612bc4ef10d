// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod fakes;
pub mod ledger;
pub mod resources;
