//! Wire messages for the token exchange service.
//!
//! Mirrors `tokenexchange.v1`:
//!
//! ```protobuf
//! service TokenExchange {
//!   rpc ExchangeToken(ExchangeTokenRequest) returns (ExchangeTokenResponse);
//! }
//! ```

/// Fully qualified path of the unary exchange method.
pub const EXCHANGE_TOKEN_PATH: &str = "/tokenexchange.v1.TokenExchange/ExchangeToken";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExchangeTokenRequest {
    #[prost(string, tag = "1")]
    pub applicant: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub user_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub original_token: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExchangeTokenResponse {
    #[prost(string, tag = "1")]
    pub token: ::prost::alloc::string::String,
}
