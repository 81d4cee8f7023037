use anyhow::Result;
use module::EventProcessor;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, error};

use super::gateway::WindowUsage;

pub mod module;
pub mod usage_writer;

/// Work for the background writer of window usage.
#[derive(Debug)]
pub enum UsageCommand {
    /// Seconds of one window to store, or buffer if that fails.
    Flush(WindowUsage),
    /// Retry everything buffered while the store was unreachable.
    DrainPending,
    /// Answered once every command sent before it is processed.
    Barrier(oneshot::Sender<()>),
}

/// Represents the receiving end of window usage. This module is responsible for receiving
/// commands in order and handing them to a processor.
pub struct ProcessingModule<Processor> {
    receiver: UnboundedReceiver<UsageCommand>,
    processor: Processor,
}

impl<P: EventProcessor> ProcessingModule<P> {
    pub fn new(receiver: UnboundedReceiver<UsageCommand>, processor: P) -> Self {
        Self {
            receiver,
            processor,
        }
    }

    /// Processes commands until every sender is dropped.
    pub async fn run(mut self) -> Result<()> {
        while let Some(command) = self.receiver.recv().await {
            debug!("Processing command {:?}", command);
            if let Err(e) = self.processor.process_next(command).await {
                error!("Error processing usage command: {e:?}")
            }
        }

        let result = self.processor.finalize().await;
        self.receiver.close();
        result
    }
}
