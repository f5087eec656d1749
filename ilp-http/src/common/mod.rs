// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use http::HeaderName;

pub mod address;
pub mod authentication;
pub mod config;
pub mod handler;
pub mod ildcp;
pub mod packet;

/// Content type of a raw ILP packet body.
pub const ILP_CONTENT_TYPE: &str = "application/ilp+octet-stream";

/// Name of the sending peer; in multilateral mode, its routing segment.
pub const PEER_NAME_HEADER: HeaderName = HeaderName::from_static("ilp-peer-name");

/// Destination of the carried Prepare. Informational only.
pub const DESTINATION_HEADER: HeaderName = HeaderName::from_static("ilp-destination");
