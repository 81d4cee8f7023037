use anyhow::Result;


/// The agent spends nearly all of its time waiting on timers and the store, so one thread is
/// enough.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
