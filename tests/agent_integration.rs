use futures::StreamExt;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use uar_core::config::RuntimeConfig;
use uar_core::domain::{EntityKind, EventLevel, EventPhase, RunStatus, StepKind};
use uar_core::runtime::{
    DELEGATE_TOOL_NAME, EventSource, FinishReason, FunctionTool, MergedEvent, ScriptedModel,
    ScriptedTurn, StreamPart, Tool,
};
use uar_core::{Agent, AgentError, RunOptions, Runtime};

fn runtime(grace_window_ms: u64) -> Runtime {
    let mut config = RuntimeConfig::default();
    config.stream.grace_window_ms = grace_window_ms;
    Runtime::new(config).unwrap()
}

fn lookup_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        "lookup",
        "Look something up",
        json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        |args, _ctx| async move { Ok(json!({ "result": args["q"] })) },
    ))
}

/// Tool that only returns once every party of `barrier` is inside it.
fn rendezvous_tool(barrier: Arc<Barrier>) -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        "rendezvous",
        "Wait for the other workers",
        json!({"type": "object"}),
        move |_args, _ctx| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                Ok(json!("met"))
            }
        },
    ))
}

fn worker(runtime: &Runtime, name: &str, tool: Arc<dyn Tool>, tool_name: &str) -> Arc<Agent> {
    let model = Arc::new(ScriptedModel::new([
        ScriptedTurn::tool_call(&format!("{name}-call"), tool_name, json!({"q": name})),
        ScriptedTurn::text(format!("{name} finished")),
    ]));
    Agent::builder(name, model)
        .instructions(format!("You are the {name}"))
        .tool(tool)
        .build(runtime)
}

fn lead(runtime: &Runtime, targets: &[&str], sub_agents: Vec<Arc<Agent>>) -> Arc<Agent> {
    let model = Arc::new(ScriptedModel::new([
        ScriptedTurn::tool_call(
            "delegate-1",
            DELEGATE_TOOL_NAME,
            json!({"task": "investigate", "target_agents": targets}),
        ),
        ScriptedTurn::text("all done"),
    ]));
    let mut builder = Agent::builder("lead", model).instructions("Coordinate the team");
    for agent in sub_agents {
        builder = builder.sub_agent(agent);
    }
    builder.build(runtime)
}

fn sub_agent_parts<'a>(events: &'a [MergedEvent], name: &str) -> Vec<&'a StreamPart> {
    events
        .iter()
        .filter(|e| e.sub_agent_name() == Some(name))
        .map(|e| &e.part)
        .collect()
}

#[tokio::test]
async fn test_single_run_publishes_one_start_and_one_terminal() {
    let runtime = runtime(0);
    let mut published = runtime.subscribe();
    let model = Arc::new(ScriptedModel::new([
        ScriptedTurn::tool_call("call-1", "lookup", json!({"q": "rust"})),
        ScriptedTurn::text("found it"),
    ]));
    let agent = Agent::builder("solo", model).tool(lookup_tool()).build(&runtime);

    let result = agent.generate_text("search", RunOptions::new()).await.unwrap();

    let events = runtime.history().events(&result.run_id).await.unwrap();
    let starts: Vec<_> = events
        .iter()
        .filter(|e| e.entity == EntityKind::Agent && e.phase == EventPhase::Start)
        .collect();
    let terminals: Vec<_> = events
        .iter()
        .filter(|e| e.entity == EntityKind::Agent && e.is_terminal())
        .collect();
    assert_eq!(starts.len(), 1);
    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].parent_event_id.as_deref(), Some(starts[0].id.as_str()));

    // Every tool terminal references an earlier tool start.
    let mut seen_starts = HashSet::new();
    for event in events.iter().filter(|e| e.entity == EntityKind::Tool) {
        if event.phase == EventPhase::Start {
            seen_starts.insert(event.id.clone());
        } else {
            let parent = event.parent_event_id.clone().unwrap();
            assert!(seen_starts.remove(&parent), "terminal without open start");
        }
    }
    assert!(seen_starts.is_empty());

    let first = published.recv().await.unwrap();
    assert_eq!(first.event.name, "agent:start");
    assert_eq!(first.agent_name, "solo");
}

#[tokio::test]
async fn test_concurrent_sub_agents_are_merged_and_tagged() {
    let runtime = runtime(50);
    let researcher = worker(&runtime, "researcher", lookup_tool(), "lookup");
    let writer = worker(&runtime, "writer", lookup_tool(), "lookup");
    let lead = lead(&runtime, &["researcher", "writer"], vec![researcher, writer]);

    let stream = lead.stream_text("write a report", RunOptions::new()).await.unwrap();
    let run_id = stream.run_id().to_string();
    let events: Vec<MergedEvent> = stream.collect().await;

    // The delegating call comes first; no sub-agent activity precedes it.
    let delegate_index = events
        .iter()
        .position(|e| {
            e.is_primary()
                && matches!(&e.part, StreamPart::ToolCall { tool_name, .. } if tool_name == DELEGATE_TOOL_NAME)
        })
        .unwrap();
    let first_sub_agent = events.iter().position(|e| !e.is_primary()).unwrap();
    assert!(delegate_index < first_sub_agent);

    for name in ["researcher", "writer"] {
        let parts = sub_agent_parts(&events, name);
        assert!(
            parts.iter().any(|p| matches!(p, StreamPart::ToolCall { .. })),
            "{name} tool call missing"
        );
        assert!(
            parts.iter().any(|p| matches!(p, StreamPart::ToolResult { .. })),
            "{name} tool result missing"
        );
        // Only tool activity is forwarded.
        assert!(parts.iter().all(|p| p.is_forwardable()));
    }

    match &events.last().unwrap().part {
        StreamPart::Finish { reason, text, .. } => {
            assert_eq!(*reason, FinishReason::Stop);
            assert_eq!(text, "all done");
        }
        other => panic!("expected finish, got {other:?}"),
    }

    // The parent's record holds every step of both children.
    let record = runtime.history().get_entry(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    for name in ["researcher", "writer"] {
        let kinds: Vec<StepKind> = record
            .steps
            .iter()
            .filter(|s| s.sub_agent_name.as_deref() == Some(name))
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![StepKind::ToolCall, StepKind::ToolResult, StepKind::Text],
            "steps for {name}"
        );
    }

    // Child records exist, point back at the parent and finished on their own.
    let children: Vec<_> = runtime
        .history()
        .list_entries(None)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.metadata["parent_run_id"] == run_id.as_str())
        .collect();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|r| r.status == RunStatus::Completed));

    // Child events are mirrored into the parent's history.
    let parent_events = runtime.history().events(&run_id).await.unwrap();
    let mirrored: HashSet<_> = parent_events
        .iter()
        .filter_map(|e| e.metadata.get("sub_agent_name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(mirrored, HashSet::from(["researcher", "writer"]));
}

#[tokio::test]
async fn test_sub_agents_run_concurrently() {
    let runtime = runtime(0);
    let barrier = Arc::new(Barrier::new(2));
    let first = worker(&runtime, "first", rendezvous_tool(Arc::clone(&barrier)), "rendezvous");
    let second = worker(&runtime, "second", rendezvous_tool(barrier), "rendezvous");
    let lead = lead(&runtime, &["first", "second"], vec![first, second]);

    // Sequential delegation would leave the first worker waiting forever.
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        lead.generate_text("meet", RunOptions::new()),
    )
    .await
    .expect("sub-agents did not run concurrently")
    .unwrap();
    assert_eq!(result.text, "all done");
}

#[tokio::test]
async fn test_user_context_is_shared_with_sub_agents() {
    let runtime = runtime(0);
    let stamping = Arc::new(FunctionTool::new(
        "stamp",
        "Record a value in the shared context",
        json!({"type": "object"}),
        |_args, ctx| async move {
            let tenant = ctx.operation.context_value("tenant");
            ctx.operation.set_context_value("stamped_by", json!(ctx.operation.agent_name()));
            Ok(json!({ "tenant": tenant }))
        },
    ));
    let child = worker(&runtime, "stamper", stamping, "stamp");
    let lead = lead(&runtime, &["stamper"], vec![child]);

    let stream = lead
        .stream_text(
            "go",
            RunOptions::new().with_context_value("tenant", json!("acme")),
        )
        .await
        .unwrap();
    let ctx = Arc::clone(stream.context());
    let events: Vec<MergedEvent> = stream.collect().await;

    let result = events
        .iter()
        .find_map(|e| match &e.part {
            StreamPart::ToolResult { tool_name, result, .. } if tool_name == "stamp" => {
                Some(result.clone())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(result["tenant"], "acme");
    assert_eq!(ctx.context_value("stamped_by"), Some(json!("stamper")));
}

#[tokio::test]
async fn test_cancelled_stream_ends_aborted() {
    let runtime = runtime(0);
    let model = Arc::new(
        ScriptedModel::new([ScriptedTurn::Chunks(vec![
            Ok(uar_core::runtime::ModelChunk::TextDelta("partial ".into())),
            Ok(uar_core::runtime::ModelChunk::TextDelta("never sent".into())),
        ])])
        .with_chunk_delay(Duration::from_millis(200)),
    );
    let agent = Agent::builder("slow", model).build(&runtime);

    let mut stream = agent.stream_text("talk", RunOptions::new()).await.unwrap();
    let run_id = stream.run_id().to_string();

    let first = stream.next().await.unwrap();
    assert_eq!(first.part, StreamPart::TextDelta { text: "partial ".into() });
    stream.cancel();

    let rest: Vec<MergedEvent> = stream.collect().await;
    match &rest.last().unwrap().part {
        StreamPart::Finish { reason, text, .. } => {
            assert_eq!(*reason, FinishReason::Aborted);
            assert_eq!(text, "partial ");
        }
        other => panic!("expected finish, got {other:?}"),
    }

    let record = runtime.history().get_entry(&run_id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Aborted);
    let events = runtime.history().events(&run_id).await.unwrap();
    let terminal = events.last().unwrap();
    assert_eq!(terminal.name, "agent:error");
    assert_eq!(terminal.level, EventLevel::Warning);
    assert_eq!(terminal.metadata["aborted"], true);
}

#[tokio::test]
async fn test_cancelling_parent_cancels_sub_agents() {
    let runtime = runtime(0);
    let stuck = Arc::new(FunctionTool::new(
        "stuck",
        "Never returns on its own",
        json!({"type": "object"}),
        |_args, _ctx| async move {
            futures::future::pending::<()>().await;
            Ok(json!(null))
        },
    ));
    let child = worker(&runtime, "sleeper", stuck, "stuck");
    let lead = lead(&runtime, &["sleeper"], vec![child]);
    let cancel = tokio_util::sync::CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        lead.generate_text("wait", RunOptions::new().with_cancel(cancel)),
    )
    .await
    .expect("cancellation did not reach the sub-agent")
    .unwrap_err();
    assert!(matches!(err, AgentError::Aborted(_)));

    // The child may finalize on a spawned task once its stream is dropped.
    let mut statuses = Vec::new();
    for _ in 0..100 {
        statuses = runtime
            .history()
            .list_entries(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        if statuses.iter().all(|s| s.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(statuses, vec![RunStatus::Aborted, RunStatus::Aborted]);
}

#[tokio::test]
async fn test_dropped_stream_aborts_run() {
    let runtime = runtime(0);
    let model = Arc::new(
        ScriptedModel::new([ScriptedTurn::text("eventually")])
            .with_chunk_delay(Duration::from_secs(30)),
    );
    let agent = Agent::builder("abandoned", model).build(&runtime);

    let stream = agent.stream_text("hello", RunOptions::new()).await.unwrap();
    let run_id = stream.run_id().to_string();
    drop(stream);

    let mut status = RunStatus::Working;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = runtime.history().get_entry(&run_id).await.unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, RunStatus::Aborted);
}

#[tokio::test]
async fn test_finished_sub_agents_need_no_status_item() {
    let runtime = runtime(20);
    let researcher = worker(&runtime, "researcher", lookup_tool(), "lookup");
    let lead = lead(&runtime, &["researcher"], vec![researcher]);

    let stream = lead.stream_text("go", RunOptions::new()).await.unwrap();
    let events: Vec<MergedEvent> = stream.collect().await;

    // The delegation finished on its own, so no status item is needed.
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.part, StreamPart::SubAgentStatus { .. }))
    );
    let tagged = events
        .iter()
        .filter(|e| {
            matches!(
                &e.source,
                EventSource::SubAgent { sub_agent_name, .. } if sub_agent_name == "researcher"
            )
        })
        .count();
    assert_eq!(tagged, 2);
}

#[tokio::test]
async fn test_retention_keeps_delegating_runs_intact() {
    let mut config = RuntimeConfig::default();
    config.stream.grace_window_ms = 0;
    config.history.max_entries = 1;
    let runtime = Runtime::new(config).unwrap();
    let worker = worker(&runtime, "worker", lookup_tool(), "lookup");
    let lead = lead(&runtime, &["worker"], vec![worker]);

    let result = lead.generate_text("go", RunOptions::new()).await.unwrap();

    let lead_record = runtime.history().get_entry(&result.run_id).await.unwrap();
    assert_eq!(lead_record.map(|r| r.status), Some(RunStatus::Completed));
    let records = runtime.history().list_entries(None).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == RunStatus::Completed));

    let events = runtime.history().events(&result.run_id).await.unwrap();
    assert!(events.iter().any(|e| e.name == "agent:success"));

    // The next run evicts finished records down to the bound.
    let solo = Agent::builder("solo", Arc::new(ScriptedModel::new([ScriptedTurn::text("hi")])))
        .build(&runtime);
    let next = solo.generate_text("again", RunOptions::new()).await.unwrap();
    let ids: Vec<String> = runtime
        .history()
        .list_entries(None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![next.run_id]);
}
