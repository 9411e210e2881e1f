use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::HardwareError;

/// RFID/NFC reader producing a stream of tag ids
#[async_trait]
pub trait TagReader: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<String>;
    async fn reset(&self) -> Result<(), HardwareError>;
    async fn cleanup(&self) -> Result<(), HardwareError>;
}

#[derive(Debug)]
pub struct DummyReader {
    tx: broadcast::Sender<String>,
}

impl Default for DummyReader {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }
}

impl DummyReader {
    /// Simulate a card being held to the reader
    pub fn present(&self, tag_id: &str) {
        debug!(tag_id, "dummy reader presenting tag");
        let _ = self.tx.send(tag_id.to_string());
    }
}

#[async_trait]
impl TagReader for DummyReader {
    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    async fn reset(&self) -> Result<(), HardwareError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), HardwareError> {
        Ok(())
    }
}
