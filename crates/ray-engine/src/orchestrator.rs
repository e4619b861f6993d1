use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use ray_core::{
    AgentTurn, BatchExecutionResult, CommandExecutionResult, CommandResultPayload, OutboundTurn,
    RemoteChannel, SessionHandle, StopAck, StopRequest, UiEvent,
};

use crate::error::EngineError;
use crate::executor::{panic_message, CommandExecutor};
use crate::guards::{payload_fingerprint, ExecutionGuard, FingerprintSet};

/// Where the orchestrator currently is in the exchange. Observability only;
/// the execution guard is the hard gate against concurrent batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingRemote,
    ExecutingTools,
    Finalized,
}

/// Outcome of processing one inbound payload.
#[derive(Debug, PartialEq)]
pub enum Disposition {
    /// The exchange ended with this final content.
    Final(String),
    /// Ephemeral progress or a non-final message; nothing to send.
    Working,
    /// The payload was discarded without advancing the exchange.
    Dropped(DropReason),
    /// A follow-up turn must be sent to the remote.
    Continue(OutboundTurn),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Byte-identical payload already processed.
    Duplicate,
    /// A batch is already executing; new command calls are dropped, not
    /// queued.
    Busy,
    /// No recognizable content, status, or command calls.
    NoContent,
    /// Identical results already sent within the same second.
    DuplicateSend,
}

pub struct OrchestratorConfig {
    /// Halt a batch at the first failing call.
    pub stop_on_error: bool,
    /// Upper bound on remote round-trips for one user message.
    pub max_turn_hops: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            max_turn_hops: 50,
        }
    }
}

/// Central state machine of the exchange. Inspects each inbound turn and
/// decides whether to surface content, execute commands, or finalize; the
/// continuation loop lives in [`drive`](Self::drive).
pub struct TurnOrchestrator {
    channel: Arc<dyn RemoteChannel>,
    executor: CommandExecutor,
    session: SessionHandle,
    ui_tx: broadcast::Sender<UiEvent>,
    inbound_seen: FingerprintSet,
    outbound_seen: FingerprintSet,
    guard: ExecutionGuard,
    phase: Mutex<Phase>,
    cancel: Mutex<CancellationToken>,
    config: OrchestratorConfig,
    model: Option<String>,
}

impl TurnOrchestrator {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        executor: CommandExecutor,
        session: SessionHandle,
        ui_tx: broadcast::Sender<UiEvent>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            channel,
            executor,
            session,
            ui_tx,
            inbound_seen: FingerprintSet::new(),
            outbound_seen: FingerprintSet::new(),
            guard: ExecutionGuard::new(),
            phase: Mutex::new(Phase::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            config,
            model: None,
        }
    }

    /// Label forwarded verbatim in the `model` field of every outbound turn.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    fn set_phase(&self, next: Phase) {
        *self.phase.lock() = next;
    }

    fn send_event(&self, event: UiEvent) {
        if self.ui_tx.send(event).is_err() {
            debug!("no UI receivers, event dropped");
        }
    }

    /// Start a fresh exchange with a user message.
    #[instrument(skip(self, text), fields(chat_id = %self.session.chat_id()))]
    pub async fn submit_user_message(&self, text: &str) -> Result<Disposition, EngineError> {
        {
            // A token burned by a previous stop must not kill this exchange.
            let mut cancel = self.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }

        let turn = OutboundTurn::user_message(text, &self.session.snapshot(), self.model.clone());
        self.drive(turn).await
    }

    /// Feed a webhook payload through the same processing path as a
    /// synchronous reply. If the payload demands command execution, the
    /// follow-up send happens here too.
    pub async fn ingest_payload(&self, payload: &Value) -> Result<Disposition, EngineError> {
        match self.process_payload(payload).await {
            Disposition::Continue(next) => self.drive(next).await,
            settled => Ok(settled),
        }
    }

    /// Ask the remote agent to stop the active task. Cooperative: the agent
    /// may finish its current step first, and in-flight local commands are
    /// never preempted.
    #[instrument(skip(self))]
    pub async fn request_stop(&self) -> Result<StopAck, EngineError> {
        self.cancel.lock().cancel();

        let snapshot = self.session.snapshot();
        let request = match snapshot.task_id {
            Some(task_id) => StopRequest::task(task_id),
            None => StopRequest::chat(snapshot.chat_id),
        };

        match self.channel.request_stop(request).await {
            Ok(ack) => {
                info!(cancelled = ack.cancelled, "stop acknowledged");
                self.set_phase(Phase::Idle);
                Ok(ack)
            }
            Err(e) => {
                warn!(kind = e.error_kind(), error = %e, "stop request failed");
                self.set_phase(Phase::Idle);
                Err(EngineError::Channel(e))
            }
        }
    }

    /// Send a turn and keep the exchange moving until it settles. An
    /// explicit loop instead of recursion: every command batch reply can
    /// demand another send, and that depth is unbounded.
    async fn drive(&self, first: OutboundTurn) -> Result<Disposition, EngineError> {
        let cancel = self.cancel.lock().clone();
        let mut turn = first;
        let mut hops = 0u32;

        loop {
            if cancel.is_cancelled() {
                self.set_phase(Phase::Idle);
                return Err(EngineError::Stopped);
            }

            hops += 1;
            if hops > self.config.max_turn_hops {
                warn!(hops, "turn loop exceeded hop limit");
                self.send_event(UiEvent::response(
                    "Ray stopped: too many tool round-trips without a final answer.",
                    true,
                    false,
                ));
                self.set_phase(Phase::Idle);
                return Err(EngineError::MaxHopsExceeded(self.config.max_turn_hops));
            }

            self.set_phase(Phase::AwaitingRemote);
            let payload = match self.channel.send_turn(&turn).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(kind = e.error_kind(), error = %e, "turn send failed");
                    self.send_event(UiEvent::response(e.user_message(), true, false));
                    self.set_phase(Phase::Idle);
                    return Err(EngineError::Channel(e));
                }
            };

            match self.process_payload(&payload).await {
                Disposition::Continue(next) => turn = next,
                settled => return Ok(settled),
            }
        }
    }

    /// Classify one inbound payload and advance the machine.
    #[instrument(skip(self, payload))]
    async fn process_payload(&self, payload: &Value) -> Disposition {
        let fingerprint = payload_fingerprint(payload);
        if !self.inbound_seen.insert(&fingerprint) {
            debug!(fingerprint = %&fingerprint[..12], "duplicate payload dropped");
            return Disposition::Dropped(DropReason::Duplicate);
        }

        let turn = AgentTurn::from_value(payload);
        if let Some(task_id) = &turn.task_id {
            self.session.record_task(task_id.clone());
        }

        // Command calls win over a stray in-progress status on the same
        // payload; the batch is the real work.
        if turn.has_command_calls() {
            return self.run_command_batch(&turn).await;
        }

        if turn.is_in_progress() {
            let notice = turn
                .content
                .clone()
                .unwrap_or_else(|| "Ray is working...".into());
            self.send_event(UiEvent::response(notice, false, true));
            self.set_phase(Phase::Idle);
            return Disposition::Working;
        }

        match turn.content {
            Some(content) if !content.trim().is_empty() => {
                let is_final = turn.is_final.unwrap_or(true);
                self.send_event(UiEvent::response(content.clone(), is_final, false));
                if is_final {
                    self.set_phase(Phase::Finalized);
                    Disposition::Final(content)
                } else {
                    self.set_phase(Phase::AwaitingRemote);
                    Disposition::Working
                }
            }
            _ => {
                debug!("payload carried no content, status, or command calls");
                Disposition::Dropped(DropReason::NoContent)
            }
        }
    }

    /// Run the turn's batch and package the results as the follow-up turn.
    async fn run_command_batch(&self, turn: &AgentTurn) -> Disposition {
        let Some(permit) = self.guard.try_acquire() else {
            warn!(
                calls = turn.command_calls.len(),
                "batch already executing, command calls dropped"
            );
            return Disposition::Dropped(DropReason::Busy);
        };

        self.set_phase(Phase::ExecutingTools);

        // Intent first: the agent narrates what it is about to do.
        if let Some(content) = turn.content.as_deref().filter(|c| !c.trim().is_empty()) {
            self.send_event(UiEvent::response(content, false, false));
        }

        let tools: Vec<String> = turn
            .command_calls
            .iter()
            .map(|call| call.command.clone())
            .collect();
        self.send_event(UiEvent::batch_starting(tools.clone()));

        let outcome = std::panic::AssertUnwindSafe(self.executor.execute_batch_with(
            &turn.command_calls,
            self.config.stop_on_error,
            |index, _call| self.send_event(UiEvent::batch_progress(tools.clone(), index)),
        ))
        .catch_unwind()
        .await;

        let batch = match outcome {
            Ok(batch) => batch,
            Err(panic) => {
                let msg = panic_message(&panic);
                error!(panic = %msg, "batch execution crashed");
                // The remote still gets a result; the conversation must
                // never silently stall on a local failure.
                BatchExecutionResult::new(vec![CommandExecutionResult::failure(
                    "batch_execution",
                    Vec::new(),
                    "Internal error: batch execution crashed",
                )])
            }
        };

        self.send_event(UiEvent::batch_complete(tools, &batch.results));

        let results: Vec<CommandResultPayload> = batch
            .results
            .iter()
            .map(CommandResultPayload::from_result)
            .collect();
        let original = turn.content.clone().unwrap_or_default();

        // Clear the guard before sending: the agent's follow-up turn may
        // itself carry new command calls and must not be dropped as busy.
        self.set_phase(Phase::AwaitingRemote);
        permit.release();

        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let key = payload_fingerprint(&json!({
            "content": &original,
            "results": &results,
            "timestamp": stamp,
        }));
        if !self.outbound_seen.insert(&key) {
            warn!("identical command results already sent, follow-up dropped");
            return Disposition::Dropped(DropReason::DuplicateSend);
        }

        Disposition::Continue(OutboundTurn::results_message(
            original,
            results,
            &self.session.snapshot(),
            self.model.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ray_channel::{MockChannel, MockReply};
    use ray_core::session::{ChatId, ProjectId, TaskId};
    use ray_core::{CommandError, CommandHandler, ResultStatus};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::backups::FileBackupStore;
    use crate::registry::CommandRegistry;

    // --- Mock commands ---

    struct PingCommand;

    #[async_trait]
    impl CommandHandler for PingCommand {
        fn name(&self) -> &str {
            "ping"
        }
        fn description(&self) -> &str {
            "Replies pong"
        }
        async fn run(&self, _args: &[String]) -> Result<String, CommandError> {
            Ok("pong".into())
        }
    }

    struct CountingCommand {
        runs: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl CommandHandler for CountingCommand {
        fn name(&self) -> &str {
            "count"
        }
        fn description(&self) -> &str {
            "Counts invocations, optionally slowly"
        }
        async fn run(&self, _args: &[String]) -> Result<String, CommandError> {
            tokio::time::sleep(self.delay).await;
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("run {n}"))
        }
    }

    struct TrapCommand;

    #[async_trait]
    impl CommandHandler for TrapCommand {
        fn name(&self) -> &str {
            "trap"
        }
        fn description(&self) -> &str {
            "Panics outside the per-call isolation"
        }
        fn mutation_target(&self, _args: &[String]) -> Option<PathBuf> {
            panic!("trap sprung!");
        }
        async fn run(&self, _args: &[String]) -> Result<String, CommandError> {
            Ok("unreachable".into())
        }
    }

    fn build(
        channel: Arc<MockChannel>,
        extra: Vec<Arc<dyn CommandHandler>>,
    ) -> (Arc<TurnOrchestrator>, broadcast::Receiver<UiEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(PingCommand));
        for handler in extra {
            registry.register(handler);
        }
        let executor =
            CommandExecutor::new(Arc::new(registry), Arc::new(FileBackupStore::new()));
        let session =
            SessionHandle::new(ProjectId::from_raw("proj-1"), ChatId::from_raw("chat-1"));
        let orch = Arc::new(TurnOrchestrator::new(
            channel,
            executor,
            session,
            tx,
            OrchestratorConfig::default(),
        ));
        (orch, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn final_reply_surfaces_and_finalizes() {
        let channel = Arc::new(MockChannel::new(vec![MockReply::final_text("pong")]));
        let (orch, mut rx) = build(channel.clone(), vec![]);

        let disposition = orch.submit_user_message("ping").await.unwrap();
        assert_eq!(disposition, Disposition::Final("pong".into()));
        assert_eq!(orch.phase(), Phase::Finalized);

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, "ping");
        assert!(sent[0].command_results.is_none());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UiEvent::RayResponse(data) => {
                assert_eq!(data.content, "pong");
                assert!(data.is_final);
                assert!(!data.is_working);
            }
            other => panic!("expected rayResponse, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_batch_round_trips_results() {
        let channel = Arc::new(MockChannel::new(vec![
            MockReply::Json(json!({
                "message": "doing X",
                "is_final": false,
                "command_calls": [{"command": "ping", "args": []}],
            })),
            MockReply::final_text("done"),
        ]));
        let (orch, mut rx) = build(channel.clone(), vec![]);

        let disposition = orch.submit_user_message("go").await.unwrap();
        assert_eq!(disposition, Disposition::Final("done".into()));

        // Second send carries the original content plus packaged results.
        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].message, "doing X");
        let results = sent[1].command_results.as_ref().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].command, "ping");
        assert_eq!(results[0].status, ResultStatus::Success);
        assert_eq!(results[0].output, "pong");
        assert!(results[0].args.is_empty());

        // Intent surfaces non-final, then the batch progress, then the
        // final answer.
        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        match &events[0] {
            UiEvent::RayResponse(data) => {
                assert_eq!(data.content, "doing X");
                assert!(!data.is_final);
            }
            other => panic!("expected rayResponse, got: {other:?}"),
        }
        match &events[1] {
            UiEvent::ToolStatus(data) => {
                assert_eq!(data.status, ray_core::events::BatchStatus::Starting);
                assert_eq!(data.tools, vec!["ping"]);
                assert_eq!(data.total_count, 1);
            }
            other => panic!("expected toolStatus, got: {other:?}"),
        }
        match &events[2] {
            UiEvent::ToolStatus(data) => {
                assert_eq!(data.status, ray_core::events::BatchStatus::Working);
                assert_eq!(data.current_index, Some(0));
            }
            other => panic!("expected toolStatus, got: {other:?}"),
        }
        match &events[3] {
            UiEvent::ToolStatus(data) => {
                assert_eq!(data.status, ray_core::events::BatchStatus::Completed);
                assert_eq!(data.success_count, Some(1));
                assert_eq!(data.failed_count, Some(0));
            }
            other => panic!("expected toolStatus, got: {other:?}"),
        }
        match &events[4] {
            UiEvent::RayResponse(data) => {
                assert_eq!(data.content, "done");
                assert!(data.is_final);
            }
            other => panic!("expected rayResponse, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_command_reported_not_fatal() {
        let channel = Arc::new(MockChannel::new(vec![
            MockReply::Json(json!({
                "message": "trying",
                "command_calls": [{"command": "nope", "args": ["x"]}],
            })),
            MockReply::final_text("recovered"),
        ]));
        let (orch, _rx) = build(channel.clone(), vec![]);

        let disposition = orch.submit_user_message("go").await.unwrap();
        assert_eq!(disposition, Disposition::Final("recovered".into()));

        let sent = channel.sent();
        let results = sent[1].command_results.as_ref().unwrap();
        assert_eq!(results[0].status, ResultStatus::Error);
        assert_eq!(results[0].output, "Unknown command 'nope'");
        assert_eq!(results[0].args, vec!["x"]);
    }

    #[tokio::test]
    async fn duplicate_payload_processed_once() {
        let channel = Arc::new(MockChannel::new(vec![]));
        let (orch, mut rx) = build(channel, vec![]);

        let payload = json!({"message": "hello there", "is_final": true});

        let first = orch.ingest_payload(&payload).await.unwrap();
        assert_eq!(first, Disposition::Final("hello there".into()));

        let second = orch.ingest_payload(&payload).await.unwrap();
        assert_eq!(second, Disposition::Dropped(DropReason::Duplicate));

        // Exactly one UI update despite two deliveries.
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn identical_results_resend_dropped() {
        let channel = Arc::new(MockChannel::new(vec![MockReply::ack()]));
        let (orch, _rx) = build(channel.clone(), vec![]);

        let payload = json!({
            "message": "doing X",
            "command_calls": [{"command": "ping", "args": []}],
        });
        // Same batch, different bytes: the extra key slips past the
        // inbound dedup the way a redelivery with fresh metadata does.
        let redelivery = json!({
            "message": "doing X",
            "command_calls": [{"command": "ping", "args": []}],
            "delivery_attempt": 2,
        });

        let first = orch.ingest_payload(&payload).await.unwrap();
        assert_eq!(first, Disposition::Dropped(DropReason::NoContent));
        assert_eq!(channel.call_count(), 1);

        // The rerun yields the same content and results in the same
        // second, so the follow-up send is suppressed, not repeated.
        let second = orch.ingest_payload(&redelivery).await.unwrap();
        assert_eq!(second, Disposition::Dropped(DropReason::DuplicateSend));
        assert_eq!(channel.call_count(), 1);
    }

    #[tokio::test]
    async fn working_status_is_ephemeral() {
        let channel = Arc::new(MockChannel::new(vec![]));
        let (orch, mut rx) = build(channel, vec![]);

        let notice = orch
            .ingest_payload(&json!({"status": "working", "message": "thinking"}))
            .await
            .unwrap();
        assert_eq!(notice, Disposition::Working);
        assert_eq!(orch.phase(), Phase::Idle);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UiEvent::RayResponse(data) => {
                assert_eq!(data.content, "thinking");
                assert!(data.is_working);
                assert!(!data.is_final);
            }
            other => panic!("expected rayResponse, got: {other:?}"),
        }

        // The later final turn serializes differently, so it passes dedup.
        let done = orch
            .ingest_payload(&json!({"message": "thinking", "is_final": true}))
            .await
            .unwrap();
        assert_eq!(done, Disposition::Final("thinking".into()));
    }

    #[tokio::test]
    async fn working_status_without_content_gets_default_notice() {
        let channel = Arc::new(MockChannel::new(vec![]));
        let (orch, mut rx) = build(channel, vec![]);

        orch.ingest_payload(&json!({"status": "start working"}))
            .await
            .unwrap();

        let events = drain(&mut rx);
        match &events[0] {
            UiEvent::RayResponse(data) => assert_eq!(data.content, "Ray is working..."),
            other => panic!("expected rayResponse, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_final_content_keeps_awaiting() {
        let channel = Arc::new(MockChannel::new(vec![]));
        let (orch, mut rx) = build(channel, vec![]);

        let disposition = orch
            .ingest_payload(&json!({"message": "partial answer", "is_final": false}))
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Working);
        assert_eq!(orch.phase(), Phase::AwaitingRemote);

        let events = drain(&mut rx);
        match &events[0] {
            UiEvent::RayResponse(data) => {
                assert!(!data.is_final);
                assert!(!data.is_working);
            }
            other => panic!("expected rayResponse, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_ack_waits_for_webhook() {
        let channel = Arc::new(MockChannel::new(vec![MockReply::ack()]));
        let (orch, mut rx) = build(channel, vec![]);

        let disposition = orch.submit_user_message("hello").await.unwrap();
        assert_eq!(disposition, Disposition::Dropped(DropReason::NoContent));
        assert_eq!(orch.phase(), Phase::AwaitingRemote);
        assert!(drain(&mut rx).is_empty());

        // The actual reply arrives over the webhook later.
        let done = orch
            .ingest_payload(&json!({"message": "late answer", "is_final": true}))
            .await
            .unwrap();
        assert_eq!(done, Disposition::Final("late answer".into()));
        assert_eq!(orch.phase(), Phase::Finalized);
    }

    #[tokio::test]
    async fn working_ack_then_webhook_final() {
        let channel = Arc::new(MockChannel::new(vec![MockReply::working("On it")]));
        let (orch, mut rx) = build(channel, vec![]);

        let disposition = orch.submit_user_message("long question").await.unwrap();
        assert_eq!(disposition, Disposition::Working);
        assert_eq!(orch.phase(), Phase::Idle);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UiEvent::RayResponse(data) => {
                assert_eq!(data.content, "On it");
                assert!(data.is_working);
                assert!(!data.is_final);
            }
            other => panic!("expected rayResponse, got: {other:?}"),
        }

        // The answer itself lands on the webhook path.
        let done = orch
            .ingest_payload(&json!({"message": "the answer", "is_final": true}))
            .await
            .unwrap();
        assert_eq!(done, Disposition::Final("the answer".into()));
        assert_eq!(orch.phase(), Phase::Finalized);
    }

    #[tokio::test]
    async fn busy_batch_dropped_not_queued() {
        let runs = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(MockChannel::new(vec![MockReply::final_text("after")]));
        let (orch, _rx) = build(
            channel.clone(),
            vec![Arc::new(CountingCommand {
                runs: runs.clone(),
                delay: Duration::from_millis(200),
            })],
        );

        let slow_payload = json!({
            "message": "long task",
            "command_calls": [{"command": "count", "args": ["first"]}],
        });
        let rival_payload = json!({
            "message": "rival task",
            "command_calls": [{"command": "count", "args": ["second"]}],
        });

        let background = tokio::spawn({
            let orch = orch.clone();
            async move { orch.ingest_payload(&slow_payload).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Mid-batch arrival is dropped, not queued.
        let rival = orch.ingest_payload(&rival_payload).await.unwrap();
        assert_eq!(rival, Disposition::Dropped(DropReason::Busy));

        let settled = background.await.unwrap().unwrap();
        assert_eq!(settled, Disposition::Final("after".into()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_error_surfaces_categorized() {
        let channel = Arc::new(MockChannel::new(vec![MockReply::Error(
            ray_core::ChannelError::ConnectionRefused("connect ECONNREFUSED".into()),
        )]));
        let (orch, mut rx) = build(channel, vec![]);

        let err = orch.submit_user_message("hello").await.unwrap_err();
        assert!(matches!(err, EngineError::Channel(_)));
        assert_eq!(orch.phase(), Phase::Idle);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UiEvent::RayResponse(data) => {
                assert!(
                    data.content.contains("Cannot reach the Ray agent"),
                    "expected categorized message, got: {}",
                    data.content
                );
                assert!(data.is_final);
            }
            other => panic!("expected rayResponse, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_crash_sends_synthetic_result() {
        let channel = Arc::new(MockChannel::new(vec![
            MockReply::Json(json!({
                "message": "danger",
                "command_calls": [{"command": "trap", "args": ["x"]}],
            })),
            MockReply::final_text("survived"),
        ]));
        let (orch, mut rx) = build(channel.clone(), vec![Arc::new(TrapCommand)]);

        let disposition = orch.submit_user_message("go").await.unwrap();
        assert_eq!(disposition, Disposition::Final("survived".into()));

        let sent = channel.sent();
        let results = sent[1].command_results.as_ref().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].command, "batch_execution");
        assert_eq!(results[0].status, ResultStatus::Error);
        assert_eq!(results[0].output, "Internal error: batch execution crashed");
        assert!(results[0].args.is_empty());

        let failed_status = drain(&mut rx).into_iter().find_map(|event| match event {
            UiEvent::ToolStatus(data)
                if data.status == ray_core::events::BatchStatus::Failed =>
            {
                Some(data)
            }
            _ => None,
        });
        let failed_status = failed_status.expect("expected a failed toolStatus event");
        assert_eq!(failed_status.failed_count, Some(1));
    }

    #[tokio::test]
    async fn hop_limit_bounds_the_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let channel = Arc::new(MockChannel::new(vec![
            MockReply::Json(json!({
                "message": "again",
                "command_calls": [{"command": "count", "args": ["1"]}],
            })),
            MockReply::Json(json!({
                "message": "again",
                "command_calls": [{"command": "count", "args": ["2"]}],
            })),
        ]));

        let (tx, mut rx) = broadcast::channel(64);
        let mut registry = CommandRegistry::new();
        registry.register(Arc::new(CountingCommand {
            runs: runs.clone(),
            delay: Duration::ZERO,
        }));
        let executor =
            CommandExecutor::new(Arc::new(registry), Arc::new(FileBackupStore::new()));
        let session =
            SessionHandle::new(ProjectId::from_raw("proj-1"), ChatId::from_raw("chat-1"));
        let orch = TurnOrchestrator::new(
            channel,
            executor,
            session,
            tx,
            OrchestratorConfig {
                stop_on_error: false,
                max_turn_hops: 2,
            },
        );

        let err = orch.submit_user_message("go").await.unwrap_err();
        assert!(matches!(err, EngineError::MaxHopsExceeded(2)));
        assert_eq!(orch.phase(), Phase::Idle);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let warned = drain(&mut rx).into_iter().any(|event| match event {
            UiEvent::RayResponse(data) => data.content.contains("too many tool round-trips"),
            _ => false,
        });
        assert!(warned, "expected a hop-limit notice");
    }

    #[tokio::test]
    async fn task_id_recorded_from_payload() {
        let channel = Arc::new(MockChannel::new(vec![]));
        let (orch, _rx) = build(channel, vec![]);

        orch.ingest_payload(&json!({"message": "ok", "task_id": "task-9"}))
            .await
            .unwrap();
        assert_eq!(orch.session().task_id(), Some(TaskId::from_raw("task-9")));
    }

    #[tokio::test]
    async fn stop_prefers_task_then_chat() {
        let channel = Arc::new(MockChannel::new(vec![]));
        let (orch, _rx) = build(channel.clone(), vec![]);

        // No task recorded yet: fall back to the chat id.
        let ack = orch.request_stop().await.unwrap();
        assert!(ack.cancelled);
        assert_eq!(orch.phase(), Phase::Idle);

        orch.session().record_task(TaskId::from_raw("task-1"));
        orch.request_stop().await.unwrap();

        let stops = channel.stops();
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[0].task_id, None);
        assert_eq!(stops[0].chat_id, Some(ChatId::from_raw("chat-1")));
        assert_eq!(stops[1].task_id, Some(TaskId::from_raw("task-1")));
        assert_eq!(stops[1].chat_id, None);
    }

    #[tokio::test]
    async fn submit_after_stop_starts_fresh() {
        let channel = Arc::new(MockChannel::new(vec![MockReply::final_text("fresh")]));
        let (orch, _rx) = build(channel, vec![]);

        orch.request_stop().await.unwrap();

        let disposition = orch.submit_user_message("hello again").await.unwrap();
        assert_eq!(disposition, Disposition::Final("fresh".into()));
    }
}
