use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

use super::{HistoryStore, QueueKind, WorkItem, dedupe_completions};
use crate::Event;

/// Filesystem-backed store: one JSONL file per execution under
/// `<root>/<instance>/<execution_id>.jsonl`, one JSONL file per queue, and a
/// sidecar file per peek-locked item under `<root>/.locks/`.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    timer_queue_file: PathBuf,
    cap: usize,
    // Queue files are rewritten wholesale; serialize writers within this process
    queue_lock: Arc<Mutex<()>>,
}

impl FsHistoryStore {
    /// Open a store rooted at `root`. With `reset_on_create` all existing
    /// data is deleted first; otherwise items still locked by a previous
    /// process are put back on their queues.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        let timer_q = path.join("timer-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        for q in [&orch_q, &work_q, &timer_q] {
            let _ = std::fs::OpenOptions::new().create(true).append(true).open(q);
        }
        let store = Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            timer_queue_file: timer_q,
            cap: 1024,
            queue_lock: Arc::new(Mutex::new(())),
        };
        if !reset_on_create {
            store.recover_locked_items();
        }
        store
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }
    // Instance names become a single directory under the root; dot-dirs hold locks
    fn is_safe_instance(instance: &str) -> bool {
        let mut parts = Path::new(instance).components();
        matches!(parts.next(), Some(Component::Normal(_))) && parts.next().is_none() && !instance.starts_with('.')
    }
    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.inst_root(instance).join(format!("{execution_id}.jsonl"))
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
            QueueKind::Timer => &self.timer_queue_file,
        }
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    // Rewrite through a temp file + rename so readers never see a partial queue
    fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), String> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| e.to_string())?;
            for it in items {
                let line = serde_json::to_string(it).map_err(|e| e.to_string())?;
                tf.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
                tf.write_all(b"\n").map_err(|e| e.to_string())?;
            }
        }
        std::fs::rename(&tmp, qf).map_err(|e| e.to_string())
    }

    /// Items locked by a process that died before ack/abandon would be lost;
    /// put them back at the front of their queues.
    fn recover_locked_items(&self) {
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            let Ok(rd) = std::fs::read_dir(self.lock_dir(kind)) else {
                continue;
            };
            let mut recovered = Vec::new();
            for ent in rd.flatten() {
                let path = ent.path();
                match std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| serde_json::from_str::<WorkItem>(&s).ok())
                {
                    Some(item) => recovered.push(item),
                    None => warn!(path = %path.display(), "discarding unreadable lock sidecar"),
                }
                let _ = std::fs::remove_file(&path);
            }
            if recovered.is_empty() {
                continue;
            }
            let mut items = self.read_queue(kind);
            for item in recovered.into_iter().rev() {
                if !items.contains(&item) {
                    items.insert(0, item);
                }
            }
            if let Err(e) = self.write_queue(kind, &items) {
                warn!(?kind, error = %e, "failed to restore locked work items");
            }
        }
    }

    async fn read_exec_file(&self, path: &Path) -> Vec<Event> {
        let data = fs::read_to_string(path).await.unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        match self.latest_execution_id(instance).await {
            Some(latest) => self.read_with_execution(instance, latest).await,
            None => Vec::new(),
        }
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let latest = self
            .latest_execution_id(instance)
            .await
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        self.append_with_execution(instance, latest, new_events).await
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if let Some(name) = ent.file_name().to_str()
                    && is_dir
                    && !name.starts_with('.')
                {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        // Persist the locked item before removing it from the queue
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let token = format!("{now_ns:x}-{:x}", std::process::id());
        std::fs::create_dir_all(self.lock_dir(kind)).ok()?;
        let line = serde_json::to_string(&first).ok()?;
        std::fs::write(self.lock_path(kind, &token), line).ok()?;
        if let Err(e) = self.write_queue(kind, &items) {
            warn!(?kind, error = %e, "failed to rewrite queue after peek-lock");
            let _ = std::fs::remove_file(self.lock_path(kind, &token));
            return None;
        }
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _guard = self.queue_lock.lock().await;
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.write_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| e.to_string())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        if !Self::is_safe_instance(instance) {
            return None;
        }
        let mut max_eid = 0u64;
        if let Ok(mut rd) = fs::read_dir(self.inst_root(instance)).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str()
                    && let Some(stem) = name.strip_suffix(".jsonl")
                    && let Ok(id) = stem.parse::<u64>()
                {
                    max_eid = max_eid.max(id);
                }
            }
        }
        (max_eid > 0).then_some(max_eid)
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        match self.latest_execution_id(instance).await {
            Some(lat) => (1..=lat).collect(),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        if !Self::is_safe_instance(instance) {
            return Vec::new();
        }
        self.read_exec_file(&self.exec_path(instance, execution_id)).await
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        if !Self::is_safe_instance(instance) {
            return Err(format!("invalid instance name: {instance:?}"));
        }
        let path = self.exec_path(instance, execution_id);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("execution not found: {instance}#{execution_id}"));
        }
        let existing = self.read_exec_file(&path).await;
        let fresh = dedupe_completions(&existing, new_events);
        if existing.len() + fresh.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                fresh.len()
            ));
        }
        let mut buf = String::new();
        for ev in &fresh {
            buf.push_str(&serde_json::to_string(ev).map_err(|e| e.to_string())?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(buf.as_bytes()).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn create_new_execution(&self, instance: &str, orchestration: &str, input: &str) -> Result<u64, String> {
        if !Self::is_safe_instance(instance) {
            return Err(format!("invalid instance name: {instance:?}"));
        }
        let next = self.latest_execution_id(instance).await.unwrap_or(0) + 1;
        fs::create_dir_all(self.inst_root(instance))
            .await
            .map_err(|e| e.to_string())?;
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.exec_path(instance, next))
            .await
            .map_err(|e| e.to_string())?;
        self.append_with_execution(
            instance,
            next,
            vec![Event::OrchestrationStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            }],
        )
        .await?;
        Ok(next)
    }
}
