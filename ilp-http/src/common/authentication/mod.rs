// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Credentials presented on and verified against the `Authorization` header
mod traits;
pub use traits::*;

mod static_token_authentication;
pub use static_token_authentication::StaticTokenAuthentication;

mod jwt_authentication;
pub use jwt_authentication::JwtAuthentication;
