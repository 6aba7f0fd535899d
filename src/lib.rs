/*
 * volume-sweeper - StatefulSet Volume Claim Janitor
 * Copyright (C) 2025 the volume-sweeper authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Volume sweeper core library
//!
//! Keeps a managed-by label on PersistentVolumeClaims in sync with the
//! StatefulSet controlling the pod that mounts them, and deletes claims
//! orphaned by StatefulSet deletion. The controller is level-triggered: every
//! decision is re-derived from cached cluster state, never from event
//! payloads.

pub mod config;
pub mod controller;
pub mod selector;

// Re-export commonly used types
pub use config::SweeperConfig;
pub use controller::{Context, Error, ObjectKey, Result, WorkQueue, MANAGED_BY_LABEL};
pub use selector::Selector;
