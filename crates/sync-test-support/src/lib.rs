// sync-test-support: shared test utilities for the bookmark sync hub.
//
// Provides a mock device-side WebSocket client used by the hub's own
// integration tests to drive the persistent channel end to end.

pub mod mock_ws_client;

pub use mock_ws_client::MockWsClient;
