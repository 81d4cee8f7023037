use anyhow::Result;

use super::UsageCommand;

/// Represents a consumer of [UsageCommand]s. Abstracts over where window usage ends up, so the
/// processing loop can be tested without a store.
pub trait EventProcessor {
    fn process_next(&mut self, message: UsageCommand) -> impl std::future::Future<Output = Result<()>>;

    fn finalize(&mut self) -> impl std::future::Future<Output = Result<()>>;
}
