//! Tests for the sequential, parallel, and loop combinators.

mod common;

use agent_kit::{
    BaseAgent, Content, Event, EventKind, InMemoryRunner, LlmAgent, LlmResponse, LoopAgent,
    ParallelAgent, SequentialAgent,
};
use common::{EchoLlm, ScriptedLlm};
use std::sync::Arc;

fn agent_end_authors(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.kind == EventKind::AgentEnd)
        .map(|event| event.author.clone())
        .collect()
}

fn scripted_agent(name: &str, reply: &str) -> Arc<dyn BaseAgent> {
    let model = ScriptedLlm::new(vec![LlmResponse::text(reply)]);
    Arc::new(LlmAgent::builder(name).model(model).build().unwrap())
}

#[tokio::test]
async fn sequential_passes_results_forward() -> anyhow::Result<()> {
    // A produces "foo"; B echoes whatever it receives
    let a = scripted_agent("a", "foo");
    let b: Arc<dyn BaseAgent> =
        Arc::new(LlmAgent::builder("b").model(Arc::new(EchoLlm)).build()?);

    let pipeline = SequentialAgent::new("pipeline", vec![a, b]);
    let runner = InMemoryRunner::new("demo", Arc::new(pipeline))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("start")).await?;

    // B produced "foo" because it received A's response as input
    let b_end = result
        .events
        .iter()
        .find(|event| event.kind == EventKind::AgentEnd && event.author == "b")
        .unwrap();
    assert_eq!(b_end.content.as_ref().unwrap().text(), "foo");

    // Combined response concatenates both children's parts
    let combined = result.final_response.unwrap();
    assert_eq!(combined.text(), "foofoo");

    Ok(())
}

#[tokio::test]
async fn sequential_without_pass_results_reuses_original() -> anyhow::Result<()> {
    let a = scripted_agent("a", "ignored");
    let b: Arc<dyn BaseAgent> =
        Arc::new(LlmAgent::builder("b").model(Arc::new(EchoLlm)).build()?);

    let pipeline = SequentialAgent::new("pipeline", vec![a, b])
        .pass_results(false)
        .last_response_only(true);
    let runner = InMemoryRunner::new("demo", Arc::new(pipeline))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("original message")).await?;

    // B echoed the original message, not A's response
    assert_eq!(result.final_response.unwrap().text(), "original message");

    Ok(())
}

#[tokio::test]
async fn parallel_gathered_emits_every_child_end_in_child_order() -> anyhow::Result<()> {
    let children = vec![
        scripted_agent("alpha", "from alpha"),
        scripted_agent("beta", "from beta"),
        scripted_agent("gamma", "from gamma"),
    ];

    let fanout = ParallelAgent::new("fanout", children);
    let runner = InMemoryRunner::new("demo", Arc::new(fanout))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("go")).await?;

    // Every child produced an AgentEnd, in child order, then the composite
    let authors = agent_end_authors(&result.events);
    assert_eq!(authors, vec!["alpha", "beta", "gamma", "fanout"]);

    // Combined result concatenates child parts in child order
    let combined = result.final_response.unwrap().text();
    assert_eq!(combined, "from alphafrom betafrom gamma");

    Ok(())
}

#[tokio::test]
async fn parallel_streaming_still_ends_every_child() -> anyhow::Result<()> {
    let children = vec![
        scripted_agent("alpha", "from alpha"),
        scripted_agent("beta", "from beta"),
        scripted_agent("gamma", "from gamma"),
    ];

    let fanout = ParallelAgent::new("fanout", children).wait_for_all(false);
    let runner = InMemoryRunner::new("demo", Arc::new(fanout))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("go")).await?;

    // Arrival order is arbitrary; the set of child ends is not
    let mut authors = agent_end_authors(&result.events);
    authors.sort();
    assert_eq!(authors, vec!["alpha", "beta", "fanout", "gamma"]);

    // Combined result is still in child order
    let combined = result.final_response.unwrap().text();
    assert_eq!(combined, "from alphafrom betafrom gamma");

    Ok(())
}

#[tokio::test]
async fn parallel_child_failure_does_not_cancel_siblings() -> anyhow::Result<()> {
    struct BrokenLlm;

    #[async_trait::async_trait]
    impl agent_kit::Llm for BrokenLlm {
        fn name(&self) -> &str {
            "broken"
        }
        async fn generate_content(
            &self,
            _: &agent_kit::LlmRequest,
        ) -> agent_kit::Result<agent_kit::LlmResponse> {
            Err(agent_kit::Error::model_status(400, "bad request"))
        }
    }

    let broken: Arc<dyn BaseAgent> = Arc::new(
        LlmAgent::builder("broken").model(Arc::new(BrokenLlm)).build()?,
    );
    let healthy = scripted_agent("healthy", "still here");

    let fanout = ParallelAgent::new("fanout", vec![broken, healthy]);
    let runner = InMemoryRunner::new("demo", Arc::new(fanout))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("go")).await?;

    // The failure surfaced as an error event
    assert!(result.events.iter().any(|event| {
        event.kind == EventKind::Error && event.author == "broken"
    }));
    assert!(result.metrics.errors >= 1);

    // The sibling finished and the combined result only carries it
    assert!(agent_end_authors(&result.events).contains(&"healthy".to_string()));
    assert_eq!(result.final_response.unwrap().text(), "still here");

    Ok(())
}

#[tokio::test]
async fn loop_agent_stops_on_condition() -> anyhow::Result<()> {
    let child: Arc<dyn BaseAgent> =
        Arc::new(LlmAgent::builder("worker").model(Arc::new(EchoLlm)).build()?);

    let repeat = LoopAgent::new("repeat", child, 10)
        .condition(|iteration, _last, _ctx| iteration <= 3)
        .update_message(|iteration, _last, original| {
            Content::user(format!("{} round {iteration}", original.text()))
        });

    let runner = InMemoryRunner::new("demo", Arc::new(repeat))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("work")).await?;

    // Three child runs, then the condition stopped the loop
    let worker_ends = result
        .events
        .iter()
        .filter(|event| event.kind == EventKind::AgentEnd && event.author == "worker")
        .count();
    assert_eq!(worker_ends, 3);

    // Final response is the last child response
    assert_eq!(result.final_response.unwrap().text(), "work round 3");

    Ok(())
}

#[tokio::test]
async fn loop_agent_without_condition_runs_to_cap() -> anyhow::Result<()> {
    let child = scripted_agent("once", "done");
    let repeat = LoopAgent::new("repeat", child, 2);

    let runner = InMemoryRunner::new("demo", Arc::new(repeat))?;
    runner.ensure_session("u1", Some("s1".into())).await?;

    let result = runner.run("u1", "s1", Content::user("go")).await?;

    let child_ends = result
        .events
        .iter()
        .filter(|event| event.kind == EventKind::AgentEnd && event.author == "once")
        .count();
    assert_eq!(child_ends, 2);

    Ok(())
}
