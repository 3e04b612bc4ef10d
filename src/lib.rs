// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod config;
pub mod crd;
pub mod error;
pub mod reconciler;
pub mod resources;
pub mod shim_layer;

#[cfg(test)]
mod unit_tests;
