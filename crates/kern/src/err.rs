// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.

use sos_abi::FaultInfo;
use thiserror::Error;

/// An unrecoverable error committed by a process: a CPU-raised fault that,
/// per spec.md §4.5, always results in the offending process being killed
/// (an implicit `EXIT`). Syscall-level errors that the calling process can
/// recover from are reported as plain `status::ERROR_*` codes instead, since
/// they change nothing about process state.
#[derive(Clone, Debug, Error)]
#[error("unrecoverable fault: {0}")]
pub struct UserError(#[from] FaultInfo);
