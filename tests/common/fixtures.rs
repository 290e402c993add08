//! Backend mocks and wait helpers

use std::time::Duration;

use artifact_sync::{BackendClient, Config, MemoryTransport};
use tokio::sync::watch;
use wiremock::MockServer;

/// How long any single wait in these tests may take
pub const WAIT: Duration = Duration::from_secs(5);

/// A PDF-looking body
pub fn pdf_body(revision: u32) -> Vec<u8> {
    format!("%PDF-1.7\n% revision {revision}\n%%EOF").into_bytes()
}

/// Client and config pointed at the mock backend
pub fn backend_for(server: &MockServer) -> (BackendClient, Config) {
    let config = Config::with_base_url(server.uri());
    let client = BackendClient::new(config.api.clone()).unwrap();
    (client, config)
}

/// Wait until exactly `n` channels listen on `transport`
pub async fn wait_for_listeners(transport: &MemoryTransport, n: usize) {
    tokio::time::timeout(WAIT, async {
        while transport.listener_count() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {n} listener(s), have {}", transport.listener_count()));
}

/// Wait until the watched value satisfies `wanted` and return it
pub async fn wait_until<T: Clone>(rx: &mut watch::Receiver<T>, wanted: impl Fn(&T) -> bool) -> T {
    tokio::time::timeout(WAIT, rx.wait_for(|value| wanted(value)))
        .await
        .expect("condition not reached in time")
        .expect("publisher dropped")
        .clone()
}

/// Number of regular files in `dir`
pub fn file_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}
