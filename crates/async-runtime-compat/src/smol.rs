//! Smol runtime spawner implementation

use crate::{BoxTask, Spawner};

/// Spawner for smol's global executor
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolSpawner;

impl Spawner for SmolSpawner {
    fn spawn(&self, future: BoxTask) {
        smol::spawn(future).detach();
    }

    fn runtime_name(&self) -> &'static str {
        "smol"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_spawned_task_runs_to_completion() {
        let spawner = SmolSpawner;
        let (tx, rx) = async_channel::bounded(1);

        spawner.spawn(Box::pin(async move {
            tx.send(42).await.unwrap();
        }));

        assert_eq!(rx.recv().await.unwrap(), 42);
        assert_eq!(spawner.runtime_name(), "smol");
    }
}
