use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};

use oracle_base::db::OracleDb;
use oracle_core::{Address, Bytes, H256};
use txm::ResumeCallback;

use crate::{
    tasks::test_utils::{test_env, RecordingSubmitter},
    *,
};

struct Harness {
    runner: PipelineRunner,
    db: OracleDb,
    submitter: Arc<RecordingSubmitter>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_env(|_| {}).await
    }

    async fn with_env(configure: impl FnOnce(&mut TaskEnv)) -> Self {
        let (mut env, _chain, submitter) = test_env().await;
        configure(&mut env);
        let db = OracleDb::in_memory().await.unwrap();
        let runner = PipelineRunner::new(
            Arc::new(db.clone()),
            env,
            PipelineMetrics::dummy_instance(),
        );
        Self {
            runner,
            db,
            submitter,
        }
    }

    async fn spec(&self, source: &str) -> i64 {
        self.runner.create_spec(source, None).await.unwrap().id
    }

    async fn execute(&self, source: &str, inputs: Value) -> RunWithTasks {
        let spec = self.spec(source).await;
        self.runner.execute_run(spec, Some(1), inputs).await.unwrap()
    }
}

fn task<'a>(run: &'a RunWithTasks, dot_id: &str) -> &'a TaskRun {
    run.task_runs.iter().find(|t| t.dot_id == dot_id).unwrap()
}

async fn wait_for_final(runner: &PipelineRunner, run_id: i64) -> RunWithTasks {
    for _ in 0..200 {
        let run = runner.get_run(run_id).await.unwrap();
        if run.run.state.is_final() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not finish");
}

const ETH_TX: &str = r#"
    tx  [type=ethtx to="0x0202020202020202020202020202020202020202" data="0x01"];
    out [type=result];
    tx -> out;
"#;

#[tokio::test]
async fn linear_pipeline_completes_and_runs_each_task_once() {
    let h = Harness::new().await;
    let run = h
        .execute(
            r#"
            scale  [type=multiply input="$(price)" times=100];
            divide [type=divide divisor=4 precision=2];
            scale -> divide;
            "#,
            json!({"price": "1.5"}),
        )
        .await;

    assert_eq!(run.run.state, RunState::Completed);
    assert_eq!(run.run.outputs, Some(json!(["37.5"])));
    assert_eq!(run.run.errors, Some(json!([null])));
    assert!(run.run.finished_at.is_some());
    assert_eq!(task(&run, "scale").output, Some(json!("150")));
    assert!(run
        .task_runs
        .iter()
        .all(|t| t.state == TaskRunState::Completed && t.finished_at.is_some()));

    // advancing a finished run is a no-op
    assert_eq!(
        h.runner.advance(run.run.id).await.unwrap(),
        RunState::Completed
    );
}

#[tokio::test]
async fn fan_in_sees_every_branch() {
    let h = Harness::new().await;
    let run = h
        .execute(
            r#"
            a [type=multiply input=1 times=1];
            b [type=multiply input=2 times=1];
            c [type=multiply input=9 times=1];
            m [type=median];
            a -> m; b -> m; c -> m;
            "#,
            Value::Null,
        )
        .await;
    assert_eq!(run.run.state, RunState::Completed);
    assert_eq!(run.run.outputs, Some(json!(["2"])));
}

#[tokio::test]
async fn ancestor_outputs_are_visible_as_vars() {
    let h = Harness::new().await;
    let run = h
        .execute(
            r#"
            fetch [type=multiply input=3 times=1];
            pass  [type=multiply input=1 times=1];
            total [type=multiply input="$(fetch)" times="$(pass)"];
            fetch -> pass -> total;
            "#,
            Value::Null,
        )
        .await;
    assert_eq!(run.run.outputs, Some(json!(["3"])));
}

#[tokio::test]
async fn errors_propagate_to_successors() {
    let h = Harness::new().await;
    let run = h
        .execute(
            r#"
            parse [type=jsonparse data="not json"];
            scale [type=multiply times=2];
            parse -> scale;
            "#,
            Value::Null,
        )
        .await;
    assert_eq!(run.run.state, RunState::Errored);
    let root = task(&run, "parse").error.clone().unwrap();
    assert!(root.starts_with("parse:"), "{root}");
    assert_eq!(task(&run, "scale").state, TaskRunState::Errored);
    assert_eq!(task(&run, "scale").error.as_ref(), Some(&root));
    assert_eq!(run.run.errors, Some(json!([root])));
    assert_eq!(run.run.outputs, Some(json!([null])));
}

#[tokio::test]
async fn tolerant_tasks_consume_errors() {
    let h = Harness::new().await;
    let run = h
        .execute(
            r#"
            bad  [type=jsonparse data="{"];
            good [type=multiply input=5 times=1];
            any  [type=any];
            bad -> any; good -> any;
            "#,
            Value::Null,
        )
        .await;
    assert_eq!(run.run.state, RunState::Completed);
    assert_eq!(run.run.outputs, Some(json!(["5"])));
}

#[tokio::test]
async fn sinks_are_ordered_by_index() {
    let h = Harness::new().await;
    let run = h
        .execute(
            r#"
            first  [type=multiply input=1 times=1 index=1];
            second [type=multiply input=2 times=1 index=0];
            "#,
            Value::Null,
        )
        .await;
    assert_eq!(run.run.outputs, Some(json!(["2", "1"])));
}

#[tokio::test]
async fn eth_tx_suspends_until_resumed() {
    let h = Harness::new().await;
    let run = h.execute(ETH_TX, Value::Null).await;
    assert_eq!(run.run.state, RunState::Suspended);
    let tx_task = task(&run, "tx");
    assert_eq!(tx_task.state, TaskRunState::Suspended);
    assert_eq!(task(&run, "out").state, TaskRunState::Pending);

    // the transaction is keyed by the task run it resumes
    let requests = h.submitter.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].task_run_id, tx_task.id);
    assert_eq!(requests[0].to, Address::repeat_byte(2));
    assert_eq!(requests[0].data, Bytes::from(vec![1u8]));

    let state = h
        .runner
        .resume_task(tx_task.id, Ok(json!("0xabc")))
        .await
        .unwrap();
    assert_eq!(state, RunState::Completed);
    let run = h.runner.get_run(run.run.id).await.unwrap();
    assert_eq!(run.run.outputs, Some(json!(["0xabc"])));
    assert_eq!(h.submitter.requests().len(), 1);

    let again = h.runner.resume_task(tx_task.id, Ok(json!("0xdef"))).await;
    assert!(matches!(again, Err(PipelineError::Validation(_))));
    let unknown = h.runner.resume_task(uuid::Uuid::new_v4(), Ok(json!(1))).await;
    assert!(matches!(unknown, Err(PipelineError::NotFound(_))));
}

#[tokio::test]
async fn failed_transaction_errors_the_run() {
    let h = Harness::new().await;
    let run = h.execute(ETH_TX, Value::Null).await;
    let tx_task = task(&run, "tx").id;

    let state = h
        .runner
        .resume_task(tx_task, Err("transaction reverted".into()))
        .await
        .unwrap();
    assert_eq!(state, RunState::Errored);
    let run = h.runner.get_run(run.run.id).await.unwrap();
    assert_eq!(run.run.errors, Some(json!(["transaction reverted"])));
}

#[tokio::test]
async fn resume_callback_tolerates_duplicates() {
    let h = Harness::new().await;
    let run = h.execute(ETH_TX, Value::Null).await;
    let tx_task = task(&run, "tx").id;
    let hash = H256::repeat_byte(0xaa);

    let callback: Arc<dyn ResumeCallback> = Arc::new(h.runner.clone());
    callback.resume(tx_task, Ok(hash)).await.unwrap();
    callback.resume(tx_task, Ok(hash)).await.unwrap();

    let run = wait_for_final(&h.runner, run.run.id).await;
    assert_eq!(run.run.state, RunState::Completed);
    assert_eq!(run.run.outputs, Some(json!([format!("{hash:?}")])));
}

#[tokio::test]
async fn recover_resumes_missed_outcomes_and_interrupted_runs() {
    let h = Harness::new().await;
    let suspended = h.execute(ETH_TX, Value::Null).await;
    let tx_task = task(&suspended, "tx").id;
    h.submitter
        .set_outcome(tx_task, Ok(H256::repeat_byte(0x11)));

    // created but never advanced, as if the node stopped right after
    let spec = h.spec("a [type=multiply input=2 times=2];").await;
    let interrupted = h.runner.create_run(spec, None, Value::Null).await.unwrap();

    h.runner.recover().await.unwrap();

    let suspended = h.runner.get_run(suspended.run.id).await.unwrap();
    assert_eq!(suspended.run.state, RunState::Completed);
    let interrupted = h.runner.get_run(interrupted.id).await.unwrap();
    assert_eq!(interrupted.run.state, RunState::Completed);
    assert_eq!(interrupted.run.outputs, Some(json!(["4"])));
}

#[tokio::test]
async fn abandoned_run_errors_and_releases_its_transaction() {
    let h = Harness::new().await;
    let run = h.execute(ETH_TX, Value::Null).await;
    let tx_task = task(&run, "tx").id;

    assert!(h.runner.abandon_run(run.run.id, "reorged", "abandoned after reorg").await.unwrap());
    assert_eq!(h.submitter.abandoned(), vec![tx_task]);

    let run = h.runner.get_run(run.run.id).await.unwrap();
    assert_eq!(run.run.state, RunState::Errored);
    assert_eq!(run.run.errors, Some(json!(["reorged"])));
    assert!(run
        .task_runs
        .iter()
        .all(|t| t.error.as_deref() == Some("reorged")));

    assert!(!h.runner.abandon_run(run.run.id, "reorged", "abandoned after reorg").await.unwrap());
    let late = h.runner.resume_task(tx_task, Ok(json!("0x1"))).await;
    assert!(matches!(late, Err(PipelineError::Validation(_))));
}

#[derive(Debug)]
struct SlowProver;

#[async_trait]
impl VrfProver for SlowProver {
    async fn prove(&self, _request: &VrfRequest) -> eyre::Result<Bytes> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Bytes::default())
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn slow_tasks_time_out() {
    let h = Harness::with_env(|env| env.vrf = Some(Arc::new(SlowProver))).await;
    let source = r#"
        proof [type=vrf publicKey="0x01" requestBlockNumber=1
               requestBlockHash="0x0303030303030303030303030303030303030303030303030303030303030303"];
    "#;
    let spec = h
        .runner
        .create_spec(source, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    let run = h.runner.execute_run(spec.id, None, Value::Null).await.unwrap();
    assert_eq!(run.run.state, RunState::Errored);
    let error = task(&run, "proof").error.clone().unwrap();
    assert!(error.contains("maximum duration"), "{error}");
    assert!(logs_contain("Task timed out"));
}

#[tokio::test]
async fn resume_callback_returns_before_downstream_tasks_finish() {
    let h = Harness::with_env(|env| env.vrf = Some(Arc::new(SlowProver))).await;
    let source = r#"
        tx    [type=ethtx to="0x0202020202020202020202020202020202020202" data="0x01"];
        proof [type=vrf publicKey="0x01" requestBlockNumber=1
               requestBlockHash="0x0303030303030303030303030303030303030303030303030303030303030303"];
        tx -> proof;
    "#;
    let spec = h
        .runner
        .create_spec(source, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    let run = h.runner.execute_run(spec.id, None, Value::Null).await.unwrap();
    assert_eq!(run.run.state, RunState::Suspended);
    let tx_task = task(&run, "tx").id;

    let callback: Arc<dyn ResumeCallback> = Arc::new(h.runner.clone());
    let started = std::time::Instant::now();
    tokio::time::timeout(
        Duration::from_millis(200),
        callback.resume(tx_task, Ok(H256::repeat_byte(0x01))),
    )
    .await
    .expect("resume waited for the slow task")
    .unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    // the slow successor still runs, and times out, in the background
    let run = wait_for_final(&h.runner, run.run.id).await;
    assert_eq!(run.run.state, RunState::Errored);
    assert_eq!(task(&run, "tx").state, TaskRunState::Completed);
    let error = task(&run, "proof").error.clone().unwrap();
    assert!(error.contains("maximum duration"), "{error}");
}

#[tokio::test]
async fn invalid_pipelines_are_rejected() {
    let h = Harness::new().await;
    let err = h
        .runner
        .create_spec("a [type=nope];", None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    let err = h
        .runner
        .create_spec("a [type=any]; b [type=any]; a -> b; b -> a;", None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(matches!(
        h.runner.create_run(42, None, Value::Null).await,
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn started_runs_finish_in_the_background() {
    let h = Harness::new().await;
    let spec = h.spec("a [type=multiply input=2 times=3];").await;
    let run = h.runner.start_run(spec, Some(7), Value::Null).await.unwrap();
    assert_eq!(run.state, RunState::Running);

    let mut state = RunState::Running;
    for _ in 0..100 {
        state = h.runner.get_run(run.id).await.unwrap().run.state;
        if state.is_final() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, RunState::Completed);

    let (runs, total) = h.runner.list_runs(Some(7), 0, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(runs[0].id, run.id);
    assert_eq!(h.runner.count_running_runs(7).await.unwrap(), 0);
    assert!(h.db.run(run.id).await.unwrap().is_some());
}
