// ABOUTME: Integration tests for the engine's testable properties (S1-S6)
// ABOUTME: Each test is grounded on the scenario of the same name in the design notes

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use workflow_engine::WorkflowEngineApi;
use workflow_model::{
    ComputedFieldDefinition, InputDefinition, OnError, StateSchema, SubAgentTask, WorkflowDefinition, WorkflowStep,
};
use workflow_state::StateUpdate;

fn input(required: bool) -> InputDefinition {
    InputDefinition {
        input_type: "number".into(),
        description: String::new(),
        required,
        default: Value::Null,
    }
}

/// S1 — simple increment: `computed.double` tracks `inputs.counter * 2`,
/// and each applied update bumps the optimistic version by one.
#[tokio::test]
async fn s1_simple_increment_recomputes_double_and_bumps_version() {
    let schema = StateSchema {
        inputs: HashMap::from([("counter".to_string(), "number".to_string())]),
        state: HashMap::new(),
        computed: HashMap::from([(
            "double".to_string(),
            ComputedFieldDefinition {
                from_paths: vec!["inputs.counter".to_string()],
                transform: "input * 2".to_string(),
                on_error: OnError::Propagate,
                fallback: Value::Null,
            },
        )]),
    };
    let definition = Arc::new(WorkflowDefinition {
        name: "s1:increment".into(),
        description: String::new(),
        version: "1.0".into(),
        default_state: Map::new(),
        state_schema: schema,
        inputs: HashMap::from([("counter".to_string(), input(true))]),
        steps: vec![],
        sub_agent_tasks: HashMap::new(),
    });

    let api = WorkflowEngineApi::new();
    let mut inputs = Map::new();
    inputs.insert("counter".to_string(), Value::from(5));
    let started = api.workflow_start(definition, inputs).unwrap();
    let workflow_id = started["workflow_id"].as_str().unwrap().to_string();
    assert_eq!(started["state"]["inputs"]["counter"], Value::from(5));
    assert_eq!(started["state"]["computed"]["double"], Value::from(10));

    let updated = api
        .workflow_update_state(&workflow_id, vec![StateUpdate::set("inputs.counter", Value::from(7))])
        .unwrap();
    assert_eq!(updated["counter"], Value::from(7));
    assert_eq!(updated["double"], Value::from(14));

    let status = api.workflow_get_status(&workflow_id).unwrap();
    assert_eq!(status["state"]["__version__"]["version"], Value::from(3));
}

/// S2 — conditional branch: only the `then_steps` message is queued when
/// the condition holds.
#[tokio::test]
async fn s2_conditional_branch_takes_then_steps() {
    let definition = Arc::new(WorkflowDefinition {
        name: "s2:conditional".into(),
        description: String::new(),
        version: "1.0".into(),
        default_state: Map::new(),
        state_schema: StateSchema::default(),
        inputs: HashMap::from([("x".to_string(), input(true))]),
        steps: vec![WorkflowStep::new("s1", "conditional")
            .with_field("condition", "{{ inputs.x > 0 }}")
            .with_field("then_steps", json!([{"id": "t1", "type": "user_message", "message": "pos"}]))
            .with_field("else_steps", json!([{"id": "e1", "type": "user_message", "message": "non-pos"}]))],
        sub_agent_tasks: HashMap::new(),
    });

    let api = WorkflowEngineApi::new();
    let mut inputs = Map::new();
    inputs.insert("x".to_string(), Value::from(3));
    let started = api.workflow_start(definition, inputs).unwrap();
    let workflow_id = started["workflow_id"].as_str().unwrap().to_string();

    let batch = api.workflow_get_next_step(&workflow_id, None).await.unwrap().unwrap();
    let steps = batch["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["definition"]["message"], Value::String("pos".to_string()));
}

/// S3 — foreach: three `shell_command` items produce three ordered
/// server-completed entries.
#[tokio::test]
async fn s3_foreach_runs_body_once_per_item_in_order() {
    let definition = Arc::new(WorkflowDefinition {
        name: "s3:foreach".into(),
        description: String::new(),
        version: "1.0".into(),
        default_state: Map::new(),
        state_schema: StateSchema::default(),
        inputs: HashMap::new(),
        steps: vec![WorkflowStep::new("loop1", "foreach")
            .with_field("items", "[1,2,3]")
            .with_field("body", json!([{"id": "echo", "type": "shell_command", "command": "echo X"}]))],
        sub_agent_tasks: HashMap::new(),
    });

    let api = WorkflowEngineApi::new();
    let started = api.workflow_start(definition, Map::new()).unwrap();
    let workflow_id = started["workflow_id"].as_str().unwrap().to_string();

    let mut completed = Vec::new();
    loop {
        match api.workflow_get_next_step(&workflow_id, None).await.unwrap() {
            None => break,
            Some(batch) => {
                completed.extend(batch["server_completed_steps"].as_array().unwrap().iter().cloned());
                for step in batch["steps"].as_array().unwrap() {
                    api.workflow_step_complete(&workflow_id, step["id"].as_str().unwrap(), "success", None)
                        .unwrap();
                }
                if batch["steps"].as_array().unwrap().is_empty() {
                    break;
                }
            }
        }
    }

    assert_eq!(completed.len(), 3);
    for entry in &completed {
        assert_eq!(entry["type"], Value::String("shell_command".to_string()));
    }
}

/// S4 — parallel_foreach fan-out: two items reaching the head of the client
/// batch produce two isolated sub-agent task descriptors, attached to the
/// step the caller sees, whose `inputs.file_path` differ and whose own
/// per-task queues are driven to completion through `WorkflowEngineApi`.
#[tokio::test]
async fn s4_parallel_foreach_fans_out_isolated_inputs() {
    let task = SubAgentTask {
        name: "fix".into(),
        description: String::new(),
        inputs: HashMap::from([(
            "file_path".to_string(),
            InputDefinition { input_type: "string".into(), description: String::new(), required: true, default: Value::Null },
        )]),
        steps: vec![WorkflowStep::new("apply", "user_message").with_field("message", "{{ inputs.file_path }}")],
        prompt_template: String::new(),
        default_state: Map::new(),
        state_schema: StateSchema::default(),
    };

    let definition = Arc::new(WorkflowDefinition {
        name: "s4:parallel_foreach".into(),
        description: String::new(),
        version: "1.0".into(),
        default_state: Map::new(),
        state_schema: StateSchema::default(),
        inputs: HashMap::new(),
        steps: vec![WorkflowStep::new("fan_out", "parallel_foreach")
            .with_field("items", json!(["a.ts", "b.ts"]))
            .with_field("sub_agent_task", "fix")],
        sub_agent_tasks: HashMap::from([("fix".to_string(), task)]),
    });

    let api = WorkflowEngineApi::new();
    let started = api.workflow_start(definition, Map::new()).unwrap();
    let workflow_id = started["workflow_id"].as_str().unwrap().to_string();

    let batch = api.workflow_get_next_step(&workflow_id, None).await.unwrap().unwrap();
    let steps = batch["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    let tasks = steps[0]["definition"]["sub_agent_tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["task_id"], Value::String("fix.item0".to_string()));
    assert_eq!(tasks[1]["task_id"], Value::String("fix.item1".to_string()));
    assert_eq!(tasks[0]["inputs"]["file_path"], Value::String("a.ts".to_string()));
    assert_eq!(tasks[1]["inputs"]["file_path"], Value::String("b.ts".to_string()));

    for task in tasks {
        let task_id = task["task_id"].as_str().unwrap();
        let sub_step = api.workflow_get_next_step(&workflow_id, Some(task_id)).await.unwrap().unwrap();
        assert_eq!(sub_step["step"]["definition"]["message"], task["inputs"]["file_path"].clone());
        let done = api.workflow_get_next_step(&workflow_id, Some(task_id)).await.unwrap();
        assert!(done.is_none());
    }

    assert!(api.subagents().all_completed(&[
        tasks[0]["task_id"].as_str().unwrap().to_string(),
        tasks[1]["task_id"].as_str().unwrap().to_string(),
    ]));
}

/// S5 — circular computed fields are rejected at schema-validation time.
#[test]
fn s5_circular_computed_fields_rejected_at_load() {
    let schema = StateSchema {
        inputs: HashMap::new(),
        state: HashMap::new(),
        computed: HashMap::from([
            (
                "a".to_string(),
                ComputedFieldDefinition {
                    from_paths: vec!["computed.b".to_string()],
                    transform: "input".to_string(),
                    on_error: OnError::Propagate,
                    fallback: Value::Null,
                },
            ),
            (
                "b".to_string(),
                ComputedFieldDefinition {
                    from_paths: vec!["computed.a".to_string()],
                    transform: "input".to_string(),
                    on_error: OnError::Propagate,
                    fallback: Value::Null,
                },
            ),
        ]),
    };

    let err = workflow_state::StateManager::new(schema).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("a") && message.contains("b"));
}

/// S6 — a `while_loop` bounded at `max_iterations: 4` runs its body exactly
/// four times then completes the workflow.
#[tokio::test]
async fn s6_while_loop_is_bounded_by_max_iterations() {
    let definition = Arc::new(WorkflowDefinition {
        name: "s6:while".into(),
        description: String::new(),
        version: "1.0".into(),
        default_state: Map::new(),
        state_schema: StateSchema::default(),
        inputs: HashMap::new(),
        steps: vec![WorkflowStep::new("loop1", "while_loop")
            .with_field("condition", "true")
            .with_field("max_iterations", 4)
            .with_field(
                "body",
                json!([{"id": "tick", "type": "state_update", "path": "state.ticks", "value": 1, "operation": "increment"}]),
            )],
        sub_agent_tasks: HashMap::new(),
    });

    let api = WorkflowEngineApi::new();
    let started = api.workflow_start(definition, Map::new()).unwrap();
    let workflow_id = started["workflow_id"].as_str().unwrap().to_string();

    loop {
        match api.workflow_get_next_step(&workflow_id, None).await.unwrap() {
            None => break,
            Some(batch) => {
                for step in batch["steps"].as_array().unwrap() {
                    api.workflow_step_complete(&workflow_id, step["id"].as_str().unwrap(), "success", None)
                        .unwrap();
                }
                if batch["steps"].as_array().unwrap().is_empty() {
                    break;
                }
            }
        }
    }

    let state = api.workflow_state_read(&workflow_id).unwrap();
    assert_eq!(state["state"]["ticks"], Value::from(4));
}
