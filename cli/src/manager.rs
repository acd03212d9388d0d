//! Owner of the generation history.
//!
//! Every read and write of the persisted task list goes through
//! [`TaskManager`]. Callers get snapshots and issue intents (submit, retry,
//! remove, clear); reconciliation against the remote API happens in
//! [`TaskManager::reconcile`], which the poller drives on a timer.

use crate::{
    api::MusicApi,
    config::AppConfig,
    contacts::ContactBook,
    error::SubmitError,
    events::{EventHub, TaskEvent},
    notify::{CompletionNotice, DispatchOutcome, Notifier},
    share,
    store::{self, KeyValueStore, HISTORY_KEY},
    style::StyleOptions,
    task::{GenerationTask, TaskStatus},
    types::{RemoteStatus, RemoteTask},
};
use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use indexmap::IndexMap;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const FALLBACK_FAILURE: &str = "Generation failed";

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_tasks: usize,
    pub min_prompt_chars: usize,
    pub max_prompt_chars: usize,
    pub model: String,
    /// `Some(message)` while generation is switched off.
    pub maintenance: Option<String>,
    pub media_base_url: String,
}

impl ManagerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_tasks: config.task_limit(),
            min_prompt_chars: config.min_prompt_chars(),
            max_prompt_chars: config.max_prompt_chars(),
            model: config.model().to_string(),
            maintenance: (!config.app_enabled()).then(|| config.maintenance_message().to_string()),
            media_base_url: config.media_base_url().to_string(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Another pass was still in flight.
    Skipped,
    Idle,
    Checked { checked: usize, changed: usize },
}

#[derive(Default)]
struct Ledger {
    tasks: IndexMap<String, GenerationTask>,
    // Records whose resubmission is in flight; reconciliation leaves them be.
    resubmitting: HashSet<String>,
}

pub struct TaskManager {
    api: Arc<dyn MusicApi>,
    store: Arc<dyn KeyValueStore>,
    contacts: ContactBook,
    notifier: Arc<dyn Notifier>,
    events: EventHub,
    settings: ManagerSettings,
    ledger: Mutex<Ledger>,
    submit_gate: Mutex<()>,
    reconcile_gate: Mutex<()>,
}

impl TaskManager {
    pub fn load(
        api: Arc<dyn MusicApi>,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
        events: EventHub,
        settings: ManagerSettings,
    ) -> Result<Self> {
        let tasks = load_history(store.as_ref())?;
        let pending = tasks.values().filter(|task| task.is_pending()).count();
        info!(tasks = tasks.len(), pending, "loaded generation history");
        Ok(Self {
            api,
            contacts: ContactBook::new(store.clone()),
            store,
            notifier,
            events,
            settings,
            ledger: Mutex::new(Ledger { tasks, resubmitting: HashSet::new() }),
            submit_gate: Mutex::new(()),
            reconcile_gate: Mutex::new(()),
        })
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Newest first.
    pub async fn snapshot(&self) -> Vec<GenerationTask> {
        self.ledger.lock().await.tasks.values().cloned().collect()
    }

    pub async fn get(&self, task_id: &str) -> Option<GenerationTask> {
        self.ledger.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn has_pending(&self) -> bool {
        self.ledger.lock().await.tasks.values().any(GenerationTask::is_pending)
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        let ledger = self.ledger.lock().await;
        ledger.tasks.values().filter(|task| task.is_pending()).map(|task| task.id.clone()).collect()
    }

    pub async fn submit(
        &self,
        prompt: &str,
        style: StyleOptions,
    ) -> Result<GenerationTask, SubmitError> {
        self.ensure_available()?;
        let prompt = self.validate_prompt(prompt)?;

        // Submissions are serialised so the limit check below still holds
        // when the new record is inserted.
        let _gate = self.submit_gate.lock().await;
        {
            let ledger = self.ledger.lock().await;
            if ledger.tasks.len() >= self.settings.max_tasks {
                return Err(SubmitError::LimitReached { limit: self.settings.max_tasks });
            }
        }

        let request = style.build_request(&self.settings.model, &prompt);
        let task_id = self.api.submit_generation(&request).await.map_err(|err| {
            error!("music generation submit failed: {err}");
            SubmitError::from(err)
        })?;

        let task = GenerationTask::pending(task_id.clone(), prompt, style, Utc::now());
        {
            let mut ledger = self.ledger.lock().await;
            if ledger.tasks.contains_key(&task_id) {
                error!(%task_id, "remote returned an id that is already tracked");
                return Err(SubmitError::DuplicateTask(task_id));
            }
            ledger.tasks.shift_insert(0, task_id.clone(), task.clone());
            self.persist_logged(&ledger);
        }

        info!(%task_id, "generation task submitted");
        self.events.publish(TaskEvent::Submitted { task_id });
        Ok(task)
    }

    /// One polling pass over every pending task. Never fails: remote errors
    /// are logged and the task is simply checked again next pass.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let Ok(_pass) = self.reconcile_gate.try_lock() else {
            debug!("reconcile pass already in flight, skipping");
            return ReconcileOutcome::Skipped;
        };

        let pending: Vec<String> = {
            let ledger = self.ledger.lock().await;
            let pending: Vec<String> = ledger
                .tasks
                .values()
                .filter(|task| task.is_pending() && !ledger.resubmitting.contains(&task.id))
                .map(|task| task.id.clone())
                .collect();
            if pending.is_empty() {
                // A resubmission in flight will leave a pending record behind.
                if ledger.resubmitting.is_empty() {
                    return ReconcileOutcome::Idle;
                }
                return ReconcileOutcome::Checked { checked: 0, changed: 0 };
            }
            pending
        };

        let api = &self.api;
        let checks = join_all(pending.iter().map(|task_id| async move {
            (task_id.as_str(), api.task_status(task_id).await)
        }))
        .await;

        let now = Utc::now();
        let mut finished = Vec::new();
        {
            let mut ledger = self.ledger.lock().await;
            for (task_id, check) in checks {
                let remote = match check {
                    Ok(remote) => remote,
                    Err(err) => {
                        warn!(%task_id, "status check failed, will retry: {err}");
                        continue;
                    }
                };
                if !remote.is_terminal() {
                    debug!(%task_id, "still rendering");
                    continue;
                }
                if ledger.resubmitting.contains(task_id) {
                    continue;
                }
                let Some(task) = ledger.tasks.get_mut(task_id) else {
                    continue;
                };
                if apply_remote(task, remote, now) {
                    finished.push(task.clone());
                }
            }
            if !finished.is_empty() {
                self.persist_logged(&ledger);
            }
        }

        let changed = finished.len();
        for task in finished {
            match task.status {
                TaskStatus::Completed => {
                    info!(task_id = %task.id, "generation completed");
                    self.events.publish(TaskEvent::Completed {
                        task_id: task.id.clone(),
                        title: task.title(),
                    });
                }
                _ => {
                    let error = task.error.clone().unwrap_or_default();
                    warn!(task_id = %task.id, %error, "generation failed");
                    self.events.publish(TaskEvent::Failed { task_id: task.id.clone(), error });
                }
            }
            self.notify_once(&task).await;
        }

        ReconcileOutcome::Checked { checked: pending.len(), changed }
    }

    /// Resubmits a failed task with its original prompt and style. Returns
    /// the id the record carries afterwards.
    pub async fn retry(&self, task_id: &str) -> Result<String, SubmitError> {
        self.ensure_available()?;

        let (prompt, style) = {
            let mut ledger = self.ledger.lock().await;
            let task = ledger
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| SubmitError::UnknownTask(task_id.to_string()))?;
            if !task.restart(Utc::now()) {
                return Err(SubmitError::NotRetryable(task_id.to_string()));
            }
            let resubmission = (task.prompt.clone(), task.style_options());
            ledger.resubmitting.insert(task_id.to_string());
            self.persist_logged(&ledger);
            resubmission
        };
        self.events.publish(TaskEvent::RetryStarted { task_id: task_id.to_string() });

        let request = style.build_request(&self.settings.model, &prompt);
        let submitted = self.api.submit_generation(&request).await;

        let mut ledger = self.ledger.lock().await;
        ledger.resubmitting.remove(task_id);

        let outcome = match submitted {
            Ok(new_id) if new_id != task_id && ledger.tasks.contains_key(&new_id) => {
                Err(SubmitError::DuplicateTask(new_id))
            }
            Ok(new_id) => {
                let Some(index) = ledger.tasks.get_index_of(task_id) else {
                    warn!(%task_id, %new_id, "task removed while its retry was in flight");
                    return Err(SubmitError::UnknownTask(task_id.to_string()));
                };
                if let Some((_, mut task)) = ledger.tasks.shift_remove_index(index) {
                    task.id = new_id.clone();
                    task.style = Some(style);
                    task.tags = Some(style.tags());
                    ledger.tasks.shift_insert(index, new_id.clone(), task);
                }
                Ok(new_id)
            }
            Err(err) => Err(SubmitError::from(err)),
        };

        match outcome {
            Ok(new_id) => {
                self.persist_logged(&ledger);
                drop(ledger);
                info!(previous_id = %task_id, task_id = %new_id, "generation task resubmitted");
                self.events.publish(TaskEvent::Resubmitted {
                    previous_id: task_id.to_string(),
                    task_id: new_id.clone(),
                });
                Ok(new_id)
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(task) = ledger.tasks.get_mut(task_id) {
                    task.fail(message.clone(), Utc::now());
                }
                self.persist_logged(&ledger);
                drop(ledger);
                error!(%task_id, "retry failed: {message}");
                self.events
                    .publish(TaskEvent::Failed { task_id: task_id.to_string(), error: message });
                Err(err)
            }
        }
    }

    /// Returns whether a record was removed.
    pub async fn remove(&self, task_id: &str) -> Result<bool> {
        let mut ledger = self.ledger.lock().await;
        let removed = ledger.tasks.shift_remove(task_id).is_some();
        if removed {
            ledger.resubmitting.remove(task_id);
            self.persist(&ledger)?;
            drop(ledger);
            self.events.publish(TaskEvent::Removed { task_id: task_id.to_string() });
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        ledger.tasks.clear();
        ledger.resubmitting.clear();
        self.persist(&ledger)?;
        drop(ledger);
        self.events.publish(TaskEvent::Cleared);
        Ok(())
    }

    async fn notify_once(&self, task: &GenerationTask) {
        if task.notification_sent {
            return;
        }
        let contacts = match self.contacts.load() {
            Ok(contacts) => contacts,
            Err(err) => {
                warn!(task_id = %task.id, "could not read contact details: {err:#}");
                return;
            }
        };
        if contacts.is_empty() {
            return;
        }

        let notice = CompletionNotice {
            task_id: task.id.clone(),
            title: task.title(),
            status: task.status,
            url: task
                .first_playable()
                .map(|song| {
                    share::absolute_song_url(&self.settings.media_base_url, &song.song_path)
                }),
        };

        match self.notifier.dispatch(&contacts, &notice).await {
            Ok(DispatchOutcome::Sent) => {
                let mut ledger = self.ledger.lock().await;
                let marked =
                    ledger.tasks.get_mut(&task.id).is_some_and(GenerationTask::mark_notified);
                if marked {
                    self.persist_logged(&ledger);
                }
                drop(ledger);
                info!(task_id = %task.id, "completion notification sent");
                self.events.publish(TaskEvent::NotificationSent { task_id: task.id.clone() });
            }
            Ok(DispatchOutcome::NothingToSend) => {}
            Err(err) => {
                warn!(task_id = %task.id, "completion notification failed: {err:#}");
                self.events.publish(TaskEvent::NotificationFailed {
                    task_id: task.id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    fn ensure_available(&self) -> Result<(), SubmitError> {
        match &self.settings.maintenance {
            Some(message) => Err(SubmitError::Maintenance(message.clone())),
            None => Ok(()),
        }
    }

    fn validate_prompt(&self, prompt: &str) -> Result<String, SubmitError> {
        let prompt = prompt.trim();
        let actual = prompt.chars().count();
        if actual == 0 {
            return Err(SubmitError::EmptyPrompt);
        }
        if actual < self.settings.min_prompt_chars {
            return Err(SubmitError::PromptTooShort { min: self.settings.min_prompt_chars, actual });
        }
        if actual > self.settings.max_prompt_chars {
            return Err(SubmitError::PromptTooLong { max: self.settings.max_prompt_chars, actual });
        }
        Ok(prompt.to_string())
    }

    fn persist(&self, ledger: &Ledger) -> Result<()> {
        let tasks: Vec<&GenerationTask> = ledger.tasks.values().collect();
        store::write_json(self.store.as_ref(), HISTORY_KEY, &tasks)
    }

    fn persist_logged(&self, ledger: &Ledger) {
        if let Err(err) = self.persist(ledger) {
            error!("failed to persist generation history: {err:#}");
        }
    }
}

fn apply_remote(task: &mut GenerationTask, remote: RemoteTask, now: chrono::DateTime<Utc>) -> bool {
    match remote.status {
        RemoteStatus::Completed => task.complete(remote.songs, now),
        RemoteStatus::Failed => {
            let reason = remote.error.unwrap_or_else(|| FALLBACK_FAILURE.to_string());
            task.fail(reason, now)
        }
        RemoteStatus::Pending => false,
    }
}

// Only an unparseable value as a whole is discarded; a record that does not
// fit the current shape is skipped and the rest are kept.
fn load_history(store: &dyn KeyValueStore) -> Result<IndexMap<String, GenerationTask>> {
    let Some(raw) = store.get(HISTORY_KEY)? else {
        return Ok(IndexMap::new());
    };
    let records: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(err) => {
            warn!("discarding unreadable generation history: {err}");
            store.remove(HISTORY_KEY)?;
            return Ok(IndexMap::new());
        }
    };

    let mut tasks = IndexMap::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let mut task = match serde_json::from_value::<GenerationTask>(record) {
            Ok(task) => task,
            Err(err) => {
                warn!(index, "skipping unreadable history record: {err}");
                continue;
            }
        };
        if task.id.trim().is_empty() || tasks.contains_key(&task.id) {
            warn!(task_id = %task.id, "skipping history record with missing or repeated id");
            continue;
        }
        task.normalize();
        tasks.insert(task.id.clone(), task);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contacts::Contacts,
        error::ApiError,
        store::{MemoryStore, EMAIL_KEY},
        style::{Genre, Voice},
        types::{GenerationRequest, Song},
    };
    use async_trait::async_trait;
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex as StdMutex,
        },
    };
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct FakeApi {
        submit_results: StdMutex<VecDeque<Result<String, ApiError>>>,
        statuses: StdMutex<HashMap<String, Result<RemoteTask, ApiError>>>,
        requests: StdMutex<Vec<GenerationRequest>>,
        status_calls: AtomicUsize,
        hold: Option<Arc<Semaphore>>,
        submit_hold: Option<Arc<Semaphore>>,
    }

    impl FakeApi {
        fn with_submits(results: Vec<Result<String, ApiError>>) -> Self {
            Self { submit_results: StdMutex::new(results.into()), ..Default::default() }
        }

        fn set_status(&self, task_id: &str, status: Result<RemoteTask, ApiError>) {
            self.statuses.lock().unwrap().insert(task_id.to_string(), status);
        }

        fn requests(&self) -> Vec<GenerationRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MusicApi for FakeApi {
        async fn submit_generation(&self, request: &GenerationRequest) -> Result<String, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(hold) = &self.submit_hold {
                hold.acquire().await.unwrap().forget();
            }
            self.submit_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::ServerUnknown))
        }

        async fn task_status(&self, task_id: &str) -> Result<RemoteTask, ApiError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold {
                hold.acquire().await.unwrap().forget();
            }
            self.statuses
                .lock()
                .unwrap()
                .get(task_id)
                .cloned()
                .unwrap_or_else(|| Ok(pending_remote()))
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        failures: StdMutex<VecDeque<String>>,
        calls: StdMutex<Vec<CompletionNotice>>,
    }

    impl FakeNotifier {
        fn failing(reason: &str) -> Self {
            Self {
                failures: StdMutex::new(VecDeque::from([reason.to_string()])),
                ..Default::default()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn dispatch(
            &self,
            contacts: &Contacts,
            notice: &CompletionNotice,
        ) -> Result<DispatchOutcome> {
            if contacts.is_empty() {
                return Ok(DispatchOutcome::NothingToSend);
            }
            self.calls.lock().unwrap().push(notice.clone());
            match self.failures.lock().unwrap().pop_front() {
                Some(reason) => Err(anyhow::anyhow!(reason)),
                None => Ok(DispatchOutcome::Sent),
            }
        }
    }

    /// Counts whole-value writes so tests can assert on redundant persists.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        writes: AtomicUsize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    struct Harness {
        api: Arc<FakeApi>,
        store: Arc<CountingStore>,
        notifier: Arc<FakeNotifier>,
        manager: Arc<TaskManager>,
    }

    fn harness_with(api: FakeApi, notifier: FakeNotifier, settings: ManagerSettings) -> Harness {
        let api = Arc::new(api);
        let store = Arc::new(CountingStore::default());
        let notifier = Arc::new(notifier);
        let manager = TaskManager::load(
            api.clone(),
            store.clone(),
            notifier.clone(),
            EventHub::default(),
            settings,
        )
        .unwrap();
        Harness { api, store, notifier, manager: Arc::new(manager) }
    }

    fn harness(api: FakeApi) -> Harness {
        harness_with(api, FakeNotifier::default(), ManagerSettings::default())
    }

    fn pending_remote() -> RemoteTask {
        RemoteTask { status: RemoteStatus::Pending, songs: Vec::new(), error: None }
    }

    fn completed_remote() -> RemoteTask {
        RemoteTask {
            status: RemoteStatus::Completed,
            songs: vec![Song {
                id: "song-1".into(),
                title: "Our Song".into(),
                song_path: "/songs/1.mp3".into(),
                tags: vec!["pop".into()],
                finished: true,
                image_path: None,
                lyrics: None,
                duration: None,
            }],
            error: None,
        }
    }

    fn failed_remote(message: &str) -> RemoteTask {
        RemoteTask { status: RemoteStatus::Failed, songs: Vec::new(), error: Some(message.into()) }
    }

    fn male_pop() -> StyleOptions {
        StyleOptions { voice: Voice::Male, genre: Some(Genre::Pop), ..Default::default() }
    }

    fn stored_history(store: &CountingStore) -> Vec<GenerationTask> {
        store::read_json(store, HISTORY_KEY).unwrap().unwrap_or_default()
    }

    #[tokio::test]
    async fn submit_creates_exactly_one_pending_record() {
        let h = harness(FakeApi::with_submits(vec![Ok("task-123".into())]));
        let task = h.manager.submit("Happy birthday my love", male_pop()).await.unwrap();
        assert_eq!(task.id, "task-123");
        assert_eq!(task.status, TaskStatus::Pending);

        let snapshot = h.manager.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "task-123");
        assert!(snapshot[0].completed_at.is_none());
        let stored = stored_history(&h.store);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "task-123");
        assert_eq!(stored[0].status, TaskStatus::Pending);

        let requests = h.api.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].input.prompt, "Happy birthday my love");
        assert_eq!(requests[0].input.tags, "male_vocals,male_voice,male_singer");
    }

    #[tokio::test]
    async fn rejected_submit_creates_no_record() {
        let h = harness(FakeApi::with_submits(vec![Err(ApiError::RateLimited)]));
        let err = h.manager.submit("Our song", male_pop()).await.unwrap_err();
        assert_eq!(err, SubmitError::Api(ApiError::RateLimited));
        assert!(h.manager.snapshot().await.is_empty());
        assert_eq!(h.store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn limit_reached_never_calls_remote() {
        let settings = ManagerSettings { max_tasks: 1, ..Default::default() };
        let api = FakeApi::with_submits(vec![Ok("a".into()), Ok("b".into())]);
        let h = harness_with(api, FakeNotifier::default(), settings);
        h.manager.submit("first song", male_pop()).await.unwrap();
        let err = h.manager.submit("second song", male_pop()).await.unwrap_err();
        assert_eq!(err, SubmitError::LimitReached { limit: 1 });
        assert_eq!(h.api.requests().len(), 1);
        assert_eq!(h.manager.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn validates_prompt_and_maintenance_before_remote() {
        let h = harness(FakeApi::default());
        let err = h.manager.submit("   ", male_pop()).await.unwrap_err();
        assert_eq!(err, SubmitError::EmptyPrompt);
        let long = "x".repeat(901);
        assert!(matches!(
            h.manager.submit(&long, male_pop()).await.unwrap_err(),
            SubmitError::PromptTooLong { max: 900, actual: 901 }
        ));

        let settings =
            ManagerSettings { maintenance: Some("Back soon".into()), ..Default::default() };
        let h2 = harness_with(FakeApi::default(), FakeNotifier::default(), settings);
        assert_eq!(
            h2.manager.submit("Our song", male_pop()).await.unwrap_err(),
            SubmitError::Maintenance("Back soon".into())
        );
        assert!(h.api.requests().is_empty());
        assert!(h2.api.requests().is_empty());
    }

    #[tokio::test]
    async fn duplicate_remote_id_is_rejected() {
        let api = FakeApi::with_submits(vec![Ok("same".into()), Ok("same".into())]);
        let h = harness(api);
        h.manager.submit("first song", male_pop()).await.unwrap();
        let err = h.manager.submit("second song", male_pop()).await.unwrap_err();
        assert_eq!(err, SubmitError::DuplicateTask("same".into()));
        assert_eq!(h.manager.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_applies_completed_output() {
        let h = harness(FakeApi::with_submits(vec![Ok("task-123".into())]));
        h.manager.submit("Happy birthday my love", male_pop()).await.unwrap();
        h.api.set_status("task-123", Ok(completed_remote()));

        let outcome = h.manager.reconcile().await;
        assert_eq!(outcome, ReconcileOutcome::Checked { checked: 1, changed: 1 });

        let task = h.manager.get("task-123").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.songs.as_ref().map(Vec::len), Some(1));
        assert_eq!(task.title(), "Our Song");
        assert!(task.error.is_none());
        assert_eq!(stored_history(&h.store)[0].status, TaskStatus::Completed);
        assert!(!h.manager.has_pending().await);
        assert_eq!(h.manager.reconcile().await, ReconcileOutcome::Idle);
    }

    #[tokio::test]
    async fn reconcile_applies_remote_failure() {
        let h = harness(FakeApi::with_submits(vec![Ok("task-9".into())]));
        let mut events = h.manager.events().subscribe();
        h.manager.submit("Our song", male_pop()).await.unwrap();
        h.api.set_status("task-9", Ok(failed_remote("insufficient credits")));
        h.manager.reconcile().await;

        let task = h.manager.get("task-9").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("insufficient credits"));
        assert!(task.songs.is_none());
        assert!(task.completed_at.is_some());

        assert_eq!(events.recv().await.unwrap(), TaskEvent::Submitted { task_id: "task-9".into() });
        assert_eq!(
            events.recv().await.unwrap(),
            TaskEvent::Failed { task_id: "task-9".into(), error: "insufficient credits".into() }
        );
    }

    #[tokio::test]
    async fn unchanged_pass_leaves_storage_untouched() {
        let h = harness(FakeApi::with_submits(vec![Ok("task-1".into())]));
        h.manager.submit("Our song", male_pop()).await.unwrap();
        let writes = h.store.writes.load(Ordering::SeqCst);

        let outcome = h.manager.reconcile().await;
        assert_eq!(outcome, ReconcileOutcome::Checked { checked: 1, changed: 0 });
        assert_eq!(h.store.writes.load(Ordering::SeqCst), writes);
        assert!(h.manager.has_pending().await);
    }

    #[tokio::test]
    async fn one_failed_status_check_does_not_block_others() {
        let api = FakeApi::with_submits(vec![Ok("flaky".into()), Ok("ready".into())]);
        let h = harness(api);
        h.manager.submit("first song", male_pop()).await.unwrap();
        h.manager.submit("second song", male_pop()).await.unwrap();
        h.api.set_status("flaky", Err(ApiError::Transport("connection reset".into())));
        h.api.set_status("ready", Ok(completed_remote()));

        h.manager.reconcile().await;
        assert_eq!(h.manager.get("flaky").await.unwrap().status, TaskStatus::Pending);
        assert_eq!(h.manager.get("ready").await.unwrap().status, TaskStatus::Completed);

        h.api.set_status("flaky", Ok(completed_remote()));
        h.manager.reconcile().await;
        assert_eq!(h.manager.get("flaky").await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_status_never_reverts_on_later_passes() {
        let h = harness(FakeApi::with_submits(vec![Ok("t".into())]));
        h.manager.submit("Our song", male_pop()).await.unwrap();
        h.api.set_status("t", Ok(completed_remote()));
        h.manager.reconcile().await;
        h.api.set_status("t", Ok(failed_remote("late")));
        assert_eq!(h.manager.reconcile().await, ReconcileOutcome::Idle);
        assert_eq!(h.manager.get("t").await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn notifies_exactly_once_when_contact_on_file() {
        let h = harness(FakeApi::with_submits(vec![Ok("task-123".into())]));
        store::write_json(h.store.as_ref(), EMAIL_KEY, "me@example.com").unwrap();
        h.manager.submit("Happy birthday my love", male_pop()).await.unwrap();
        h.api.set_status("task-123", Ok(completed_remote()));

        h.manager.reconcile().await;
        h.manager.reconcile().await;

        assert_eq!(h.notifier.call_count(), 1);
        let notice = h.notifier.calls.lock().unwrap()[0].clone();
        assert_eq!(notice.status, TaskStatus::Completed);
        assert_eq!(notice.url.as_deref(), Some("http://localhost:5173/lyrics-to-song/songs/1.mp3"));
        let task = h.manager.get("task-123").await.unwrap();
        assert!(task.notification_sent);
        assert!(stored_history(&h.store)[0].notification_sent);
    }

    #[tokio::test]
    async fn no_contact_means_no_dispatch() {
        let h = harness(FakeApi::with_submits(vec![Ok("t".into())]));
        h.manager.submit("Our song", male_pop()).await.unwrap();
        h.api.set_status("t", Ok(completed_remote()));
        h.manager.reconcile().await;
        assert_eq!(h.notifier.call_count(), 0);
        assert!(!h.manager.get("t").await.unwrap().notification_sent);
    }

    #[tokio::test]
    async fn failed_notification_is_not_retried_and_keeps_flag_clear() {
        let api = FakeApi::with_submits(vec![Ok("t".into())]);
        let h =
            harness_with(api, FakeNotifier::failing("mail relay down"), ManagerSettings::default());
        let mut events = h.manager.events().subscribe();
        store::write_json(h.store.as_ref(), EMAIL_KEY, "me@example.com").unwrap();
        h.manager.submit("Our song", male_pop()).await.unwrap();
        h.api.set_status("t", Ok(completed_remote()));

        h.manager.reconcile().await;
        h.manager.reconcile().await;

        let task = h.manager.get("t").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!task.notification_sent);
        assert_eq!(h.notifier.call_count(), 1);

        let mut saw_warning = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TaskEvent::NotificationFailed { .. }) {
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn retry_preserves_original_style_and_adopts_new_id() {
        let api = FakeApi::with_submits(vec![Ok("first".into()), Ok("second".into())]);
        let h = harness(api);
        let style = StyleOptions { voice: Voice::Female, ..Default::default() };
        h.manager.submit("Our song", style).await.unwrap();
        h.api.set_status("first", Ok(failed_remote("insufficient credits")));
        h.manager.reconcile().await;

        let new_id = h.manager.retry("first").await.unwrap();
        assert_eq!(new_id, "second");
        assert!(h.manager.get("first").await.is_none());
        let task = h.manager.get("second").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.is_none());
        assert!(task.completed_at.is_none());
        assert_eq!(task.prompt, "Our song");

        let requests = h.api.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].input.prompt, "Our song");
        assert_eq!(requests[1].input.tags, "female_vocals,female_voice,female_singer");
        assert_eq!(requests[1].input.negative_tags, "male_vocals,male_voice,male_singer");
    }

    #[tokio::test]
    async fn failed_resubmission_returns_record_to_failed() {
        let api = FakeApi::with_submits(vec![Ok("t".into()), Err(ApiError::InsufficientCredits)]);
        let h = harness(api);
        h.manager.submit("Our song", male_pop()).await.unwrap();
        h.api.set_status("t", Ok(failed_remote("boom")));
        h.manager.reconcile().await;

        let err = h.manager.retry("t").await.unwrap_err();
        assert_eq!(err, SubmitError::Api(ApiError::InsufficientCredits));
        let task = h.manager.get("t").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some("Credit limit exceeded. Please check your account balance.")
        );
        assert!(task.completed_at.is_some());
        assert_eq!(stored_history(&h.store)[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn retry_requires_failed_task() {
        let h = harness(FakeApi::with_submits(vec![Ok("t".into())]));
        h.manager.submit("Our song", male_pop()).await.unwrap();
        assert_eq!(h.manager.retry("t").await.unwrap_err(), SubmitError::NotRetryable("t".into()));
        let err = h.manager.retry("nope").await.unwrap_err();
        assert_eq!(err, SubmitError::UnknownTask("nope".into()));
    }

    #[tokio::test]
    async fn retry_of_legacy_record_infers_voice_from_tags() {
        let store = Arc::new(CountingStore::default());
        let legacy = serde_json::json!([{
            "id": "old",
            "prompt": "Our song",
            "status": "failed",
            "timestamp": 1_700_000_000_000i64,
            "error": "boom",
            "tags": "female_vocals,female_voice,female_singer"
        }]);
        store.set(HISTORY_KEY, &legacy.to_string()).unwrap();
        let api = Arc::new(FakeApi::with_submits(vec![Ok("new".into())]));
        let manager = TaskManager::load(
            api.clone(),
            store,
            Arc::new(FakeNotifier::default()),
            EventHub::default(),
            ManagerSettings::default(),
        )
        .unwrap();

        manager.retry("old").await.unwrap();
        assert_eq!(api.requests()[0].input.tags, "female_vocals,female_voice,female_singer");
    }

    #[tokio::test]
    async fn remove_and_clear_persist_immediately() {
        let api = FakeApi::with_submits(vec![Ok("a".into()), Ok("b".into())]);
        let h = harness(api);
        h.manager.submit("first song", male_pop()).await.unwrap();
        h.manager.submit("second song", male_pop()).await.unwrap();

        assert!(h.manager.remove("a").await.unwrap());
        assert!(!h.manager.remove("a").await.unwrap());
        let ids: Vec<String> = stored_history(&h.store).into_iter().map(|task| task.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);

        h.manager.clear_all().await.unwrap();
        assert!(h.manager.snapshot().await.is_empty());
        assert!(stored_history(&h.store).is_empty());
    }

    #[tokio::test]
    async fn reload_resumes_pending_and_discards_corruption() {
        let store = Arc::new(CountingStore::default());
        let task =
            GenerationTask::pending("resume-me".into(), "Our song".into(), male_pop(), Utc::now());
        store::write_json(store.as_ref(), HISTORY_KEY, &vec![task]).unwrap();
        let manager = TaskManager::load(
            Arc::new(FakeApi::default()),
            store.clone(),
            Arc::new(FakeNotifier::default()),
            EventHub::default(),
            ManagerSettings::default(),
        )
        .unwrap();
        assert_eq!(manager.pending_ids().await, vec!["resume-me".to_string()]);

        store.set(HISTORY_KEY, "{not json").unwrap();
        let manager = TaskManager::load(
            Arc::new(FakeApi::default()),
            store.clone(),
            Arc::new(FakeNotifier::default()),
            EventHub::default(),
            ManagerSettings::default(),
        )
        .unwrap();
        assert!(manager.snapshot().await.is_empty());
        assert!(store.get(HISTORY_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn overlapping_pass_is_skipped() {
        let hold = Arc::new(Semaphore::new(0));
        let api = FakeApi {
            submit_results: StdMutex::new(VecDeque::from([Ok("slow".to_string())])),
            hold: Some(hold.clone()),
            ..Default::default()
        };
        let h = harness(api);
        h.manager.submit("Our song", male_pop()).await.unwrap();
        h.api.set_status("slow", Ok(completed_remote()));

        let manager = h.manager.clone();
        let first = tokio::spawn(async move { manager.reconcile().await });
        while h.api.status_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.manager.reconcile().await, ReconcileOutcome::Skipped);
        hold.add_permits(1);
        assert_eq!(first.await.unwrap(), ReconcileOutcome::Checked { checked: 1, changed: 1 });
        assert_eq!(h.api.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreadable_record_is_skipped_and_the_rest_kept() {
        let store = Arc::new(CountingStore::default());
        let mut done =
            GenerationTask::pending("done".into(), "Our song".into(), male_pop(), Utc::now());
        assert!(done.complete(completed_remote().songs, Utc::now()));
        let good = serde_json::to_value(&done).unwrap();
        let bad =
            serde_json::json!({ "id": "broken", "prompt": "No timestamp", "status": "pending" });
        let raw = serde_json::to_string(&vec![good, bad]).unwrap();
        store.set(HISTORY_KEY, &raw).unwrap();

        let manager = TaskManager::load(
            Arc::new(FakeApi::default()),
            store.clone(),
            Arc::new(FakeNotifier::default()),
            EventHub::default(),
            ManagerSettings::default(),
        )
        .unwrap();

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "done");
        assert_eq!(snapshot[0].status, TaskStatus::Completed);
        assert_eq!(store.get(HISTORY_KEY).unwrap().as_deref(), Some(raw.as_str()));
    }

    #[tokio::test]
    async fn concurrent_submits_cannot_overshoot_the_limit() {
        let hold = Arc::new(Semaphore::new(0));
        let api = FakeApi {
            submit_hold: Some(hold.clone()),
            ..FakeApi::with_submits(vec![Ok("first".into()), Ok("second".into())])
        };
        let settings = ManagerSettings { max_tasks: 1, ..ManagerSettings::default() };
        let h = harness_with(api, FakeNotifier::default(), settings);

        let a = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.submit("Our song", male_pop()).await }
        });
        let b = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.submit("Our other song", male_pop()).await }
        });
        while h.api.requests().is_empty() {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // Only one submit may be talking to the remote while the other waits.
        assert_eq!(h.api.requests().len(), 1);
        hold.add_permits(2);

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|result| matches!(result, Err(SubmitError::LimitReached { limit: 1 }))));
        assert_eq!(h.api.requests().len(), 1);
        assert_eq!(h.manager.snapshot().await.len(), 1);
        assert_eq!(stored_history(&h.store).len(), 1);
    }

    #[tokio::test]
    async fn pass_during_resubmission_reports_checked_not_idle() {
        let hold = Arc::new(Semaphore::new(0));
        let api = FakeApi {
            submit_hold: Some(hold.clone()),
            ..FakeApi::with_submits(vec![Ok("task-1".into()), Ok("task-2".into())])
        };
        let h = harness(api);
        hold.add_permits(1);
        h.manager.submit("Our song", male_pop()).await.unwrap();
        h.api.set_status("task-1", Ok(failed_remote("boom")));
        let outcome = h.manager.reconcile().await;
        assert_eq!(outcome, ReconcileOutcome::Checked { checked: 1, changed: 1 });

        let retry = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.retry("task-1").await }
        });
        while h.api.requests().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(h.manager.has_pending().await);
        let outcome = h.manager.reconcile().await;
        assert_eq!(outcome, ReconcileOutcome::Checked { checked: 0, changed: 0 });

        hold.add_permits(1);
        assert_eq!(retry.await.unwrap().unwrap(), "task-2");
        assert_eq!(h.manager.pending_ids().await, vec!["task-2".to_string()]);
    }
}
