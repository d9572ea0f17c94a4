//! Migration background thread.
//!
//! A single thread owns migrator progress. It wakes when a new
//! configuration lands and on a periodic tick, runs one migration pass,
//! and exits cooperatively on shutdown.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::daemon::KvsDaemon;

const MIGRATION_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum MigrationWake {
    NewConfig,
    Shutdown,
}

/// Handle to the migration thread.
pub struct MigrationThread {
    sender: Sender<MigrationWake>,
    worker: Option<JoinHandle<()>>,
}

impl MigrationThread {
    /// Starts the thread over one daemon instance.
    #[must_use]
    pub fn spawn(daemon: Arc<KvsDaemon>) -> Self {
        let (sender, receiver) = unbounded::<MigrationWake>();
        let worker = thread::Builder::new()
            .name("mdn-kvs-migration".to_owned())
            .spawn(move || migration_thread_main(&receiver, &daemon))
            .ok();
        Self { sender, worker }
    }

    /// Wakes the thread after a configuration change.
    pub fn new_config(&self) {
        let _ = self.sender.send(MigrationWake::NewConfig);
    }

    /// Stops the thread and joins it.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(MigrationWake::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MigrationThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn migration_thread_main(receiver: &Receiver<MigrationWake>, daemon: &Arc<KvsDaemon>) {
    log::info!("migration thread started");
    loop {
        match receiver.recv_timeout(MIGRATION_TICK) {
            Ok(MigrationWake::NewConfig) | Err(RecvTimeoutError::Timeout) => {
                daemon.step_migrations();
            }
            Ok(MigrationWake::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("migration thread shutting down");
}
