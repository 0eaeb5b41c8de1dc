//! Tests for the session-scoped driver: validation, timeout, callbacks,
//! streaming, and metrics.

mod common;

use agent_kit::{
    Content, EventKind, InMemoryRunner, Llm, LlmAgent, LlmRequest, LlmResponse, RunnerConfig,
    SessionService,
};
use async_trait::async_trait;
use common::ScriptedLlm;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct SlowLlm;

#[async_trait]
impl Llm for SlowLlm {
    fn name(&self) -> &str {
        "slow"
    }
    async fn generate_content(&self, _: &LlmRequest) -> agent_kit::Result<LlmResponse> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(LlmResponse::text("too late"))
    }
}

#[tokio::test]
async fn rejects_empty_message_and_missing_session() -> anyhow::Result<()> {
    let agent = LlmAgent::builder("a")
        .model(ScriptedLlm::new(vec![]))
        .build()?;
    let runner = InMemoryRunner::new("demo", Arc::new(agent))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let empty = Content::assistant(vec![]);
    let result = runner.run("u1", "s1", empty).await;
    assert!(matches!(result, Err(agent_kit::Error::Validation(_))));

    let result = runner.run("u1", "nope", Content::user("hi")).await;
    assert!(matches!(result, Err(agent_kit::Error::Session(_))));

    Ok(())
}

#[tokio::test]
async fn timeout_cancels_the_run() -> anyhow::Result<()> {
    let agent = LlmAgent::builder("sleepy").model(Arc::new(SlowLlm)).build()?;
    let runner = InMemoryRunner::new("demo", Arc::new(agent))?.with_config(RunnerConfig {
        timeout: Duration::from_millis(100),
        ..Default::default()
    });
    runner.ensure_session("u1", Some("s1".into())).await?;

    let started = Instant::now();
    let result = runner.run("u1", "s1", Content::user("hello?")).await;
    assert!(matches!(result, Err(agent_kit::Error::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The timeout was recorded in the session log
    let session = runner
        .session_service()
        .get_session("demo", "u1", "s1")
        .await?;
    assert!(
        session
            .events
            .iter()
            .any(|event| event.kind == EventKind::Error)
    );

    Ok(())
}

#[tokio::test]
async fn callbacks_receive_events_and_panics_are_isolated() -> anyhow::Result<()> {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);

    let agent = LlmAgent::builder("a")
        .model(ScriptedLlm::new(vec![LlmResponse::text("done")]))
        .build()?;
    let runner = InMemoryRunner::new("demo", Arc::new(agent))?
        .on_event(move |_event| panic!("misbehaving subscriber"))
        .on_event(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("hi")).await?;

    // The panicking callback never affected the run or its sibling
    assert_eq!(seen.load(Ordering::SeqCst), result.events.len());
    assert_eq!(result.final_response.unwrap().text(), "done");

    Ok(())
}

#[tokio::test]
async fn streaming_yields_events_lazily() -> anyhow::Result<()> {
    let agent = LlmAgent::builder("a")
        .model(ScriptedLlm::new(vec![LlmResponse::text("streamed")]))
        .build()?;
    let runner = InMemoryRunner::new("demo", Arc::new(agent))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let mut stream = runner.run_streaming("u1", "s1", Content::user("hi")).await?;

    let first = stream.next().await.unwrap()?;
    assert_eq!(first.kind, EventKind::AgentStart);

    let mut kinds = vec![first.kind];
    while let Some(event) = stream.next().await {
        kinds.push(event?.kind);
    }
    assert_eq!(*kinds.last().unwrap(), EventKind::AgentEnd);
    assert!(kinds.contains(&EventKind::ModelResponse));

    Ok(())
}

#[tokio::test]
async fn metrics_aggregate_tokens_and_iterations() -> anyhow::Result<()> {
    let model = ScriptedLlm::new(vec![
        LlmResponse::tool_calls(vec![agent_kit::FunctionCall::new(
            "noop",
            serde_json::json!({}),
        )]),
        LlmResponse::text("finished"),
    ]);

    let noop = agent_kit::function_tool("noop", "Does nothing")
        .build(|_args, _ctx| async move { Ok(serde_json::json!(null)) });

    let agent = LlmAgent::builder("worker").model(model).tool(noop).build()?;
    let runner = InMemoryRunner::new("demo", Arc::new(agent))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("work")).await?;

    assert_eq!(result.metrics.iterations, 2);
    // ScriptedLlm reports 15 tokens per call
    assert_eq!(result.metrics.tokens_used, 30);
    assert_eq!(result.metrics.tool_calls, 1);
    assert_eq!(result.metrics.errors, 0);
    assert!(result.metrics.execution_time > Duration::ZERO);

    Ok(())
}

#[tokio::test]
async fn history_trimming_bounds_the_model_view() -> anyhow::Result<()> {
    let model = ScriptedLlm::looping(vec![LlmResponse::text("reply")]);

    let agent = LlmAgent::builder("chatty").model(model.clone()).build()?;
    let runner = InMemoryRunner::new("demo", Arc::new(agent))?.with_config(RunnerConfig {
        max_history_size: Some(2),
        ..Default::default()
    });
    runner.ensure_session("u1", Some("s1".into())).await?;

    for turn in 0..4 {
        runner
            .run("u1", "s1", Content::user(format!("message {turn}")))
            .await?;
    }

    let last_request = model.requests().last().unwrap().clone();
    assert!(last_request.contents.len() <= 2);

    Ok(())
}

#[tokio::test]
async fn ensure_session_creates_once() -> anyhow::Result<()> {
    let agent = LlmAgent::builder("a")
        .model(ScriptedLlm::new(vec![]))
        .build()?;
    let runner = InMemoryRunner::new("demo", Arc::new(agent))?;

    let created = runner.ensure_session("u1", Some("s1".into())).await?;
    let fetched = runner.ensure_session("u1", Some("s1".into())).await?;
    assert_eq!(created.id, fetched.id);

    let generated = runner.ensure_session("u1", None).await?;
    assert!(!generated.id.is_empty());

    Ok(())
}
