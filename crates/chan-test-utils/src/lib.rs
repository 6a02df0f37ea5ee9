// chan-test-utils: Shared test utilities for the channel gateway suite.
//
// Provides a mock WebSocket client and bearer-token minting helpers for
// integration testing against an in-process gateway.

pub mod mock_ws_client;
pub mod tokens;

pub use mock_ws_client::MockWsClient;
pub use tokens::{mint_token, mint_token_with_exp, obfuscate_token, TestClaims};
