// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

pub mod newdata;
pub mod rangeset;
pub mod transfer;
