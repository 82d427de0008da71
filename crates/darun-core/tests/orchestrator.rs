mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use darun_core::{
    ActivityId, AuthError, CancellationToken, DaError, JobOrchestrator, JobProgressEvent,
    JobProgressEventKind, JobSpec, JobState, Method, PollOptions, RequestBody, RetryPolicy,
};
use serde_json::json;
use support::{
    ScriptedTransport, bytes, connect_error, endpoints, json, quick_retry, status_reply,
    token_cache, token_reply,
};
use tokio::time::Instant;

const JOB_ID: &str = "job-1";
const OUTPUT_URL: &str = "https://storage.test/out.rfa?signature=abc";
const OUTPUT_PREFIX: &str = "https://storage.test/";

fn orchestrator(transport: &Arc<ScriptedTransport>) -> JobOrchestrator {
    JobOrchestrator::new(
        transport.clone(),
        token_cache(transport),
        endpoints(),
        Duration::from_secs(30),
        Duration::from_secs(300),
        quick_retry(),
    )
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

fn family_spec() -> JobSpec {
    JobSpec::new(ActivityId::qualified("nick", "Act", "prod"))
        .with_inline_json("params", &json!({"width": 2.5}))
        .with_output("out")
}

fn scenario_spec() -> JobSpec {
    JobSpec::new(ActivityId::qualified("nick", "Act", "prod"))
        .with_input("in", "https://x/a")
        .with_output("out")
}

fn interval() -> Duration {
    Duration::from_secs(5)
}

fn poll_options() -> PollOptions {
    PollOptions::default()
        .with_max_wait(Duration::from_secs(600))
        .with_poll_interval(interval())
}

fn happy_transport() -> Arc<ScriptedTransport> {
    let transport = ScriptedTransport::new();
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![json(200, json!({"id": JOB_ID, "status": "pending"}))],
    );
    transport.on(
        Method::Get,
        endpoints().workitem_url(JOB_ID),
        vec![
            status_reply(JOB_ID, "pending", json!({})),
            status_reply(JOB_ID, "inprogress", json!({})),
            status_reply(JOB_ID, "success", json!({"out": {"url": OUTPUT_URL}})),
        ],
    );
    transport.on(Method::Get, OUTPUT_PREFIX, vec![bytes(200, b"family-bytes")]);
    transport
}

#[tokio::test(start_paused = true)]
async fn runs_a_workitem_end_to_end() {
    let transport = ScriptedTransport::new();
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![json(200, json!({"id": JOB_ID, "status": "pending"}))],
    );
    transport.on(
        Method::Get,
        endpoints().workitem_url(JOB_ID),
        vec![
            status_reply(JOB_ID, "pending", json!({})),
            status_reply(JOB_ID, "inprogress", json!({})),
            status_reply(
                JOB_ID,
                "success",
                json!({"in": {"url": "https://x/a"}, "out": {"url": "https://x/out"}}),
            ),
        ],
    );
    transport.on(Method::Get, "https://x/", vec![bytes(200, b"family-bytes")]);

    let events: Arc<Mutex<Vec<JobProgressEvent>>> = Arc::default();
    let sink = events.clone();
    let orchestrator = orchestrator(&transport).with_progress(Arc::new(
        move |event: JobProgressEvent| sink.lock().unwrap().push(event),
    ));
    let start = Instant::now();

    let (status, artifacts) = orchestrator
        .run_to_completion(&scenario_spec(), poll_options(), &CancellationToken::new())
        .await
        .expect("run succeeds");

    // first poll is immediate, so three polls span two intervals
    let elapsed = start.elapsed();
    assert!(elapsed >= interval() * 2, "elapsed {elapsed:?}");
    assert!(elapsed < interval() * 3, "elapsed {elapsed:?}");

    assert_eq!(status.id, JOB_ID);
    assert_eq!(status.state, JobState::Success);
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts.get("out"), Some(&b"family-bytes"[..]));

    assert_eq!(transport.count(Method::Post, &endpoints().token_url()), 1);
    assert_eq!(transport.count(Method::Post, &endpoints().workitems_url()), 1);
    assert_eq!(transport.count(Method::Get, &endpoints().workitem_url(JOB_ID)), 3);
    assert_eq!(transport.count(Method::Get, "https://x/"), 1);
    assert_eq!(transport.count(Method::Get, "https://x/a"), 0);

    let submission = transport
        .requests()
        .into_iter()
        .find(|request| request.method == Method::Post && request.url == endpoints().workitems_url())
        .expect("submission recorded");
    assert_eq!(submission.header_value("authorization"), Some("Bearer t1"));
    match submission.body {
        RequestBody::Json(body) => assert_eq!(
            body,
            json!({
                "activityId": "nick.Act+prod",
                "arguments": {
                    "in": {"url": "https://x/a", "verb": "get"},
                    "out": {"verb": "put"}
                }
            })
        ),
        other => panic!("expected json body, got {other:?}"),
    }

    let kinds: Vec<JobProgressEventKind> = events.lock().unwrap().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            JobProgressEventKind::Submitted,
            JobProgressEventKind::StateChanged,
            JobProgressEventKind::StateChanged,
            JobProgressEventKind::StateChanged,
            JobProgressEventKind::Downloaded,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn inline_parameters_travel_as_a_data_uri() {
    let transport = happy_transport();

    orchestrator(&transport)
        .submitter()
        .submit(&family_spec())
        .await
        .expect("submitted");

    let submission = transport
        .requests()
        .into_iter()
        .find(|request| request.method == Method::Post && request.url == endpoints().workitems_url())
        .expect("submission recorded");
    let RequestBody::Json(body) = submission.body else {
        panic!("expected json body");
    };
    assert_eq!(
        body["arguments"]["params"],
        json!({"url": "data:application/json,{\"width\":2.5}", "verb": "get"})
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_prevent_submission() {
    let transport = ScriptedTransport::new();
    transport.on(
        Method::Post,
        endpoints().token_url(),
        vec![json(401, json!({"developerMessage": "invalid client"}))],
    );

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DaError::Auth(AuthError::Rejected { status: 401, .. })
    ));
    assert_eq!(transport.count(Method::Post, &endpoints().workitems_url()), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_declared_output_downloads_nothing() {
    let transport = ScriptedTransport::new();
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![json(200, json!({"id": JOB_ID}))],
    );
    transport.on(
        Method::Get,
        endpoints().workitem_url(JOB_ID),
        vec![status_reply(
            JOB_ID,
            "success",
            json!({"log": {"url": "https://storage.test/log.txt"}}),
        )],
    );
    transport.on(Method::Get, OUTPUT_PREFIX, vec![bytes(200, b"unused")]);

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DaError::IncompleteArtifacts { job_id, missing } => {
            assert_eq!(job_id, JOB_ID);
            assert_eq!(missing, vec!["out".to_string()]);
        }
        other => panic!("expected incomplete artifacts, got {other:?}"),
    }
    assert_eq!(transport.count(Method::Get, OUTPUT_PREFIX), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_submission_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![json(400, json!({"diagnostic": "unknown activity"}))],
    );

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DaError::Submission { status, body } => {
            assert_eq!(status, Some(400));
            assert!(body.contains("unknown activity"));
        }
        other => panic!("expected submission error, got {other:?}"),
    }
    assert_eq!(transport.count(Method::Post, &endpoints().workitems_url()), 1);
    assert_eq!(transport.count(Method::Get, &endpoints().workitems_url()), 0);
}

#[tokio::test(start_paused = true)]
async fn submission_retries_connect_failures() {
    let transport = ScriptedTransport::new();
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![connect_error(), json(200, json!({"id": JOB_ID}))],
    );

    let handle = orchestrator(&transport)
        .submitter()
        .submit(&family_spec())
        .await
        .expect("submitted after retry");
    assert_eq!(handle.id, JOB_ID);
    assert_eq!(transport.count(Method::Post, &endpoints().workitems_url()), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_download_surfaces_as_transfer_error() {
    let transport = happy_transport();
    transport.on(Method::Get, "https://storage.test/out.rfa", vec![bytes(403, b"expired")]);

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DaError::Transfer {
            location, status, ..
        } => {
            assert_eq!(location, "https://storage.test/out.rfa");
            assert_eq!(status, Some(403));
        }
        other => panic!("expected transfer error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_before_start_sends_nothing() {
    let transport = happy_transport();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, DaError::Cancelled { job_id: None }));
    assert!(transport.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_while_waiting_for_a_token_creates_nothing() {
    let transport = happy_transport();
    transport.on(
        Method::Post,
        endpoints().token_url(),
        vec![token_reply("t1", 3600).delayed(Duration::from_secs(60))],
    );
    let cancel = cancel_after(Duration::from_secs(1));
    let start = Instant::now();

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, DaError::Cancelled { job_id: None }));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(transport.count(Method::Post, &endpoints().workitems_url()), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_cuts_the_submission_backoff_short() {
    let transport = ScriptedTransport::new();
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![connect_error(), json(200, json!({"id": JOB_ID}))],
    );
    let orchestrator = JobOrchestrator::new(
        transport.clone(),
        token_cache(&transport),
        endpoints(),
        Duration::from_secs(30),
        Duration::from_secs(300),
        RetryPolicy::default().with_base_delay(Duration::from_secs(30)),
    );
    let cancel = cancel_after(Duration::from_secs(1));
    let start = Instant::now();

    let err = orchestrator
        .run_to_completion(&family_spec(), poll_options(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, DaError::Cancelled { job_id: None }));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(transport.count(Method::Post, &endpoints().workitems_url()), 1);
}

#[tokio::test(start_paused = true)]
async fn submission_on_the_wire_finishes_before_cancelling() {
    let transport = happy_transport();
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![json(200, json!({"id": JOB_ID})).delayed(Duration::from_secs(5))],
    );
    let cancel = cancel_after(Duration::from_secs(1));

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, DaError::Cancelled { job_id: Some(ref id) } if id == JOB_ID));
    assert_eq!(transport.count(Method::Post, &endpoints().workitems_url()), 1);
    assert_eq!(transport.count(Method::Get, &endpoints().workitem_url(JOB_ID)), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_abandons_an_in_flight_download() {
    let transport = ScriptedTransport::new();
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        endpoints().workitems_url(),
        vec![json(200, json!({"id": JOB_ID}))],
    );
    transport.on(
        Method::Get,
        endpoints().workitem_url(JOB_ID),
        vec![status_reply(JOB_ID, "success", json!({"out": {"url": OUTPUT_URL}}))],
    );
    transport.on(
        Method::Get,
        OUTPUT_PREFIX,
        vec![bytes(200, b"family-bytes").delayed(Duration::from_secs(60))],
    );
    let cancel = cancel_after(Duration::from_secs(1));
    let start = Instant::now();

    let err = orchestrator(&transport)
        .run_to_completion(&family_spec(), poll_options(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, DaError::Cancelled { job_id: Some(ref id) } if id == JOB_ID));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(transport.count(Method::Get, OUTPUT_PREFIX), 1);
}

#[tokio::test(start_paused = true)]
async fn upload_puts_bytes_to_the_signed_location() {
    let transport = ScriptedTransport::new();
    let signed_url = endpoints().signed_object_url("bucket", "input.json", "write");
    transport.on(Method::Post, endpoints().token_url(), vec![token_reply("t1", 3600)]);
    transport.on(
        Method::Post,
        &signed_url,
        vec![json(200, json!({"signedUrl": "https://storage.test/input.json?sig=1"}))],
    );
    transport.on(Method::Put, OUTPUT_PREFIX, vec![bytes(200, b"")]);

    let transferer = orchestrator(&transport).transferer().clone();
    let location = transferer
        .signed_url("bucket", "input.json", darun_core::SignedAccess::Write)
        .await
        .expect("signed url");
    transferer
        .upload(&location, b"{\"a\":1}".to_vec())
        .await
        .expect("upload");

    let put = transport
        .requests()
        .into_iter()
        .find(|request| request.method == Method::Put)
        .expect("put recorded");
    assert_eq!(put.url, "https://storage.test/input.json?sig=1");
    assert_eq!(put.timeout, Duration::from_secs(300));
    assert_eq!(put.body, RequestBody::Bytes(b"{\"a\":1}".to_vec()));
}
