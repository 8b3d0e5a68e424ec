// SPDX-License-Identifier: GPL-3.0-only

//! Backend abstraction layer for camera capture

pub mod capture;
