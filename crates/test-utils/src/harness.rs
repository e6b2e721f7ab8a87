use std::sync::Arc;

use tokio::sync::mpsc;

use dagflow::dag::{Graph, RunSummary};
use dagflow::engine::{CoreRuntime, RunQueue, RunTrigger, Runtime, RuntimeEvent, RuntimeOptions};
use dagflow::exec::{ExecutorBackend, RealExecutorBackend, TaskRegistry};
use dagflow::persist::{MemoryRunStore, RunRecord};
use dagflow::types::QueuedRunBehaviour;

/// Everything needed to drive a `Runtime` from a test.
pub struct Pipeline {
    pub graph: Arc<Graph>,
    pub options: RuntimeOptions,
    pub behaviour: QueuedRunBehaviour,
    pub store: MemoryRunStore,
    pub resume: Vec<RunRecord>,
}

impl Pipeline {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            options: RuntimeOptions::default(),
            behaviour: QueuedRunBehaviour::Queue,
            store: MemoryRunStore::new(),
            resume: Vec::new(),
        }
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn behaviour(mut self, behaviour: QueuedRunBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn store(mut self, store: MemoryRunStore) -> Self {
        self.store = store;
        self
    }

    pub fn resume(mut self, records: Vec<RunRecord>) -> Self {
        self.resume = records;
        self
    }

    /// Run with the real executor and the given operators.
    pub async fn run(
        self,
        registry: TaskRegistry,
        triggers: Vec<RunTrigger>,
    ) -> Vec<RunSummary> {
        registry.check(&self.graph).expect("registry covers the graph");
        let (tx, rx) = mpsc::channel(64);
        let executor = RealExecutorBackend::new(Arc::new(registry), tx.clone());
        self.run_with(executor, tx, rx, triggers).await
    }

    /// Run with any executor backend wired to `tx`.
    pub async fn run_with<E: ExecutorBackend>(
        self,
        executor: E,
        tx: mpsc::Sender<RuntimeEvent>,
        rx: mpsc::Receiver<RuntimeEvent>,
        triggers: Vec<RunTrigger>,
    ) -> Vec<RunSummary> {
        for trigger in triggers {
            tx.send(RuntimeEvent::RunTriggered(trigger))
                .await
                .expect("runtime channel open");
        }

        let core = CoreRuntime::new(
            self.graph,
            RunQueue::new(self.behaviour, None),
            self.options,
        );
        Runtime::new(core, tx, rx, executor, Box::new(self.store))
            .with_resume(self.resume)
            .run()
            .await
            .expect("runtime finishes cleanly")
    }
}
