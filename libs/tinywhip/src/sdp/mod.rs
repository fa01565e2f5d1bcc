// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// SDP helpers
//
// Only the handful of fields the negotiation layer needs: ICE credentials and
// media-line identifiers read from the local offer, and the trickle-ICE
// fragment written for PATCH requests.

pub mod fragment;
pub mod offer;

pub use fragment::{build_trickle_fragment, Candidate, IceComponent};
pub use offer::{IceCredentials, LocalOfferInfo, MediaLine};
