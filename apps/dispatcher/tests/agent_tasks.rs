use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use iotv_core::{
    AgentAdapter, AgentChunk, AgentError, AgentGateway, AgentRequest, BearerAuth, Channel,
    ChunkKind, ChunkStream, FailurePolicy, InMemorySettingsStore, InvocationContext,
    MessageKind, SettingsResolver,
};
use iotv_dispatcher::{
    BusMessage, DispatchError, Dispatcher, DropReason, InMemoryBusClient, Outcome,
};
use serde_json::{Value, json};

/// Replays a fixed script and remembers what it was called with.
#[derive(Clone, Default)]
struct ScriptedGateway {
    script: Arc<Mutex<Vec<Result<AgentChunk, String>>>>,
    refuse: Option<String>,
    stall: bool,
    calls: Arc<Mutex<Vec<(InvocationContext, AgentRequest)>>>,
}

impl ScriptedGateway {
    fn replying(chunks: Vec<Result<AgentChunk, String>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(chunks)),
            ..Default::default()
        }
    }

    fn refusing(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Default::default()
        }
    }

    fn stalled() -> Self {
        Self::stalling_after(Vec::new())
    }

    /// Plays `chunks`, then keeps the stream open without ever finishing it.
    fn stalling_after(chunks: Vec<Result<AgentChunk, String>>) -> Self {
        Self {
            stall: true,
            ..Self::replying(chunks)
        }
    }
}

#[async_trait]
impl AgentGateway for ScriptedGateway {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        request: AgentRequest,
    ) -> Result<ChunkStream, AgentError> {
        self.calls.lock().unwrap().push((ctx, request));
        if let Some(reason) = &self.refuse {
            return Err(AgentError::Submit(anyhow::anyhow!(reason.clone())));
        }
        let items: Vec<_> = self
            .script
            .lock()
            .unwrap()
            .drain(..)
            .map(|item| item.map_err(|err| AgentError::Stream(anyhow::anyhow!(err))))
            .collect();
        let head = stream::iter(items);
        if self.stall {
            return Ok(Box::pin(
                head.chain(stream::pending::<Result<AgentChunk, AgentError>>()),
            ));
        }
        Ok(Box::pin(head))
    }
}

fn dispatcher(bus: &InMemoryBusClient, agent: AgentAdapter) -> Dispatcher {
    Dispatcher::new(
        Arc::new(bus.clone()),
        SettingsResolver::new(Arc::new(InMemorySettingsStore::new())),
        agent,
    )
}

fn task(payload: Value) -> BusMessage {
    let env = json!({
        "message_id": "m1",
        "type": "llm.task",
        "device_id": "d1",
        "space_id": "s1",
        "app_id": "42",
        "user_id": "u1",
        "payload": payload
    });
    BusMessage::new(Channel::LlmTasks, serde_json::to_vec(&env).unwrap())
}

#[tokio::test]
async fn last_answer_becomes_final_llm_result() {
    let bus = InMemoryBusClient::default();
    let gateway = ScriptedGateway::replying(vec![
        Ok(AgentChunk::of(ChunkKind::Thinking)),
        Ok(AgentChunk::answer("A")),
        Ok(AgentChunk::answer("B")),
    ]);
    let d = dispatcher(&bus, AgentAdapter::new(Arc::new(gateway.clone())));

    let outcome = d
        .handle_message(&task(json!({
            "text": "tell me a joke",
            "bot_id": 7,
            "trace_ctx": {"traceparent": "00-abc-def-01"},
            "properties": {"lang": "en"}
        })))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Forwarded {
            channel: Channel::LlmTasks,
            kind: MessageKind::LlmResult,
        }
    );

    let published = bus.take_published().await;
    let (subject, env) = &published[0];
    assert_eq!(subject, "llm.tasks");
    assert_eq!(env["type"], "llm.result");
    assert_eq!(env["message_id"], "m1");
    assert_eq!(env["user_id"], "u1");
    assert_eq!(
        env["payload"],
        json!({
            "text": "B",
            "final": true,
            "trace_ctx": {"traceparent": "00-abc-def-01"},
            "properties": {"lang": "en"}
        })
    );

    let calls = gateway.calls.lock().unwrap();
    let (_, request) = &calls[0];
    assert_eq!(request.user, "d1");
    assert_eq!(request.agent_id, Some(7));
    assert_eq!(request.text, "tell me a joke");
}

#[tokio::test]
async fn no_answer_echoes_input_text() {
    let bus = InMemoryBusClient::default();
    let gateway = ScriptedGateway::replying(vec![
        Ok(AgentChunk::of(ChunkKind::ToolCall)),
        Ok(AgentChunk::of(ChunkKind::ToolOutput)),
    ]);
    let d = dispatcher(&bus, AgentAdapter::new(Arc::new(gateway)));

    d.handle_message(&task(json!({"text": "turn on the lights"})))
        .await
        .unwrap();

    let published = bus.take_published().await;
    let payload = &published[0].1["payload"];
    assert_eq!(payload["text"], "turn on the lights");
    assert_eq!(payload["final"], true);
    assert!(payload.get("properties").is_none());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn broken_stream_still_forwards_partial_answer() {
    let bus = InMemoryBusClient::default();
    let gateway = ScriptedGateway::replying(vec![
        Ok(AgentChunk::answer("partial")),
        Err("connection reset".into()),
    ]);
    let d = dispatcher(&bus, AgentAdapter::new(Arc::new(gateway)));

    d.handle_message(&task(json!({"text": "hi"}))).await.unwrap();

    let published = bus.take_published().await;
    let payload = &published[0].1["payload"];
    assert_eq!(payload["text"], "partial");
    assert_eq!(payload["properties"]["degraded"], "true");
    assert!(
        payload["properties"]["agent_error"]
            .as_str()
            .unwrap()
            .contains("connection reset")
    );
    assert!(logs_contain("agent stream ended early"));
}

#[tokio::test]
async fn submission_failure_degrades_to_input_text() {
    let bus = InMemoryBusClient::default();
    let d = dispatcher(
        &bus,
        AgentAdapter::new(Arc::new(ScriptedGateway::refusing("agent runtime down"))),
    );

    let outcome = d
        .handle_message(&task(json!({"text": "hello?"})))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Forwarded { .. }));

    let published = bus.take_published().await;
    let payload = &published[0].1["payload"];
    assert_eq!(payload["text"], "hello?");
    assert_eq!(payload["properties"]["degraded"], "true");
}

#[tokio::test]
async fn fail_closed_surfaces_the_error_and_publishes_nothing() {
    let bus = InMemoryBusClient::default();
    let d = dispatcher(
        &bus,
        AgentAdapter::new(Arc::new(ScriptedGateway::refusing("agent runtime down")))
            .with_policy(FailurePolicy::FailClosed),
    );

    let err = d
        .handle_message(&task(json!({"text": "hello?"})))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AgentInvocation(_)));
    assert_eq!(bus.published_count().await, 0);

    let d = dispatcher(
        &bus,
        AgentAdapter::new(Arc::new(ScriptedGateway::replying(vec![
            Ok(AgentChunk::answer("half")),
            Err("reset".into()),
        ])))
        .with_policy(FailurePolicy::FailClosed),
    );
    assert!(d.handle_message(&task(json!({"text": "x"}))).await.is_err());
    assert_eq!(bus.published_count().await, 0);
}

#[tokio::test]
async fn timeout_cuts_a_stalled_agent_short() {
    let bus = InMemoryBusClient::default();
    let d = dispatcher(
        &bus,
        AgentAdapter::new(Arc::new(ScriptedGateway::stalled()))
            .with_timeout(Some(Duration::from_millis(20))),
    );

    d.handle_message(&task(json!({"text": "still there?"})))
        .await
        .unwrap();

    let published = bus.take_published().await;
    let payload = &published[0].1["payload"];
    assert_eq!(payload["text"], "still there?");
    assert!(
        payload["properties"]["agent_error"]
            .as_str()
            .unwrap()
            .contains("did not finish")
    );
}

#[tokio::test]
async fn timeout_forwards_the_answer_received_before_the_stall() {
    let bus = InMemoryBusClient::default();
    let d = dispatcher(
        &bus,
        AgentAdapter::new(Arc::new(ScriptedGateway::stalling_after(vec![Ok(
            AgentChunk::answer("A"),
        )])))
        .with_timeout(Some(Duration::from_millis(20))),
    );

    d.handle_message(&task(json!({"text": "user input"})))
        .await
        .unwrap();

    let published = bus.take_published().await;
    let payload = &published[0].1["payload"];
    assert_eq!(payload["text"], "A");
    assert_eq!(payload["final"], true);
    assert_eq!(payload["properties"]["degraded"], "true");
}

#[tokio::test]
async fn invalid_bot_id_is_dropped_without_invoking_the_agent() {
    let bus = InMemoryBusClient::default();
    let gateway = ScriptedGateway::replying(vec![Ok(AgentChunk::answer("unused"))]);
    let d = dispatcher(&bus, AgentAdapter::new(Arc::new(gateway.clone())));

    let outcome = d
        .handle_message(&task(json!({"text": "hi", "bot_id": "not-a-number"})))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Dropped(DropReason::Malformed));
    assert_eq!(bus.published_count().await, 0);
    assert!(gateway.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn string_bot_id_and_missing_bot_id_are_accepted() {
    let bus = InMemoryBusClient::default();
    let gateway = ScriptedGateway::default();
    let d = dispatcher(&bus, AgentAdapter::new(Arc::new(gateway.clone())));

    d.handle_message(&task(json!({"text": "a", "bot_id": "12"})))
        .await
        .unwrap();
    d.handle_message(&task(json!({"text": "b"}))).await.unwrap();

    let calls = gateway.calls.lock().unwrap();
    assert_eq!(calls[0].1.agent_id, Some(12));
    assert_eq!(calls[1].1.agent_id, None);
}

#[tokio::test]
async fn bearer_auth_decorates_every_invocation() {
    let bus = InMemoryBusClient::default();
    let gateway = ScriptedGateway::default();
    let d = dispatcher(
        &bus,
        AgentAdapter::new(Arc::new(gateway.clone())).with_auth(Arc::new(BearerAuth::new("tok"))),
    );

    d.handle_message(&task(json!({"text": "a"}))).await.unwrap();

    let calls = gateway.calls.lock().unwrap();
    assert_eq!(calls[0].0.headers["authorization"], "Bearer tok");
}

#[tokio::test]
async fn llm_result_from_a_task_triggers_synthesis_when_it_comes_back() {
    let bus = InMemoryBusClient::default();
    let gateway = ScriptedGateway::replying(vec![Ok(AgentChunk::answer("sunny"))]);
    let d = dispatcher(&bus, AgentAdapter::new(Arc::new(gateway)));

    d.handle_message(&task(json!({"text": "weather?"})))
        .await
        .unwrap();
    let (_, result) = bus.take_published().await.remove(0);

    let outcome = d
        .handle_message(&BusMessage::new(
            Channel::LlmTasks,
            serde_json::to_vec(&result).unwrap(),
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Forwarded { channel: Channel::TtsTasks, .. }));

    let published = bus.take_published().await;
    assert_eq!(published[0].1["payload"]["text"], "sunny");
    assert_eq!(published[0].1["payload"]["provider"], "doubao");
}
