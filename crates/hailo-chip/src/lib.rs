//! Silicon contract model for Hailo vDMA accelerators.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the host runtime and the device agree on: how the
//! 32 vDMA channels of an engine are partitioned, how a DMA descriptor is
//! laid out, where the per-channel registers live, the firmware control
//! constants, and the firmware action-list record table.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`vdma`] | Channel partition (H2D 0..16, D2H 16..32), `ChannelId`, `Direction`, ring sizes |
//! | [`descriptor`] | 16-byte descriptor layout, interrupt bits, list/page limits, sizing helpers |
//! | [`regs`] | Per-channel register offsets and control bits |
//! | [`control`] | Firmware control protocol constants, opcodes, CPU ids |
//! | [`context`] | Context kinds and context-count limits |
//! | [`action`] | Action-list record types and their fixed payload sizes |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod context;
pub mod control;
pub mod descriptor;
pub mod regs;
pub mod vdma;
