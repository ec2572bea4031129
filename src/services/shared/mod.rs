// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Transport plumbing shared by provider clients.

pub mod ws;
