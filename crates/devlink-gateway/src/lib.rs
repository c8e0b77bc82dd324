// Copyright (c) 2025-2026 Nyx Systems LLC.
// SPDX-License-Identifier: SEE LICENSE IN ../../LICENSE
//
// This file is part of Devlink (embedded device gateway).
// Free for non-commercial use. Commercial use requires a license.
// See LICENSE and COMMERCIAL_LICENSE.md for details.

// Devlink gateway
// Terminates encrypted device sessions and bridges them to the backend plane

// Message-framed transport seam (WebSocket in production, in-memory in tests)
pub mod transport;

// Program deployment state machine with cross-session retry backoff
pub mod deploy;

// Per-connection device session: dispatch, stats, backend bridging
pub mod device_session;

// Connection intake: auth, handshake, session lifecycle
pub mod endpoint;

// WebSocket transport adapter
pub mod ws;
