// SPDX-FileCopyrightText: 2026 The otaconv developers
// SPDX-License-Identifier: GPL-3.0-only

//! otaconv is primarily an application and not a library. The CLI source
//! files use concrete types wherever possible for simplicity, while the
//! "library"-style source files aim to be generic over their readers.

pub mod apply;
pub mod cli;
pub mod device;
pub mod format;
pub mod stream;
pub mod util;
