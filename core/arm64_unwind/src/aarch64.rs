//! AArch64 `.pdata`/`.xdata` decoding and unwinding.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
mod custom;
mod interpreter;
pub mod packed;
mod restore;
pub mod runtime_function;
pub mod unwind;
pub mod unwind_code;
pub mod xdata;
