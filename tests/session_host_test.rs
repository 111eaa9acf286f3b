//! 多会话宿主：StartSession / PostEvent / PollOutput / AbortSession

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dtt::backend::MockBackend;
use dtt::concept::{ConceptValue, ProposedBinding};
use dtt::config::AppConfig;
use dtt::dtt::AgentStatus;
use dtt::interaction::InteractionEvent;
use dtt::output::OutputAction;
use dtt::{DialogError, SessionHost, SessionStatus, TaskTemplate};

fn navi() -> TaskTemplate {
    TaskTemplate::load(Path::new(env!("CARGO_MANIFEST_DIR")).join("templates/navi.json")).unwrap()
}

fn backend() -> MockBackend {
    MockBackend::from_fixtures(Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/navi_backend.json"))
        .unwrap()
}

async fn host_with(backend: MockBackend) -> SessionHost {
    let host = SessionHost::new(AppConfig::default(), Arc::new(backend)).unwrap();
    host.register_template(navi()).await.unwrap();
    host
}

fn utterance(concept: &str, value: ConceptValue, confidence: f32) -> InteractionEvent {
    InteractionEvent::utterance(vec![ProposedBinding::new(concept, value, confidence)])
}

/// 后端结果异步到达，轮询直到拿到输出
async fn poll_until(host: &SessionHost, id: &str) -> OutputAction {
    for _ in 0..100 {
        if let Some(out) = host.poll_output(id).await.unwrap() {
            return out;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no output for session {}", id);
}

#[tokio::test]
async fn test_start_session_prompts_first_request() {
    let host = host_with(backend()).await;
    assert_eq!(host.template_ids().await, ["navi"]);

    let id = host.start_session("navi").await.unwrap();
    assert!(id.starts_with("session_"));
    let out = poll_until(&host, &id).await;
    assert_eq!(out.prompt, "ask_poi");
    assert_eq!(out.agent, "/Navi/SearchPoi/AskPoi");
    assert!(host.poll_output(&id).await.unwrap().is_none());
    assert_eq!(host.session_status(&id).await.unwrap(), SessionStatus::Running);
}

#[tokio::test]
async fn test_unknown_template_is_rejected() {
    let host = host_with(backend()).await;
    let err = host.start_session("weather").await.unwrap_err();
    assert!(matches!(err, DialogError::TemplateNotFound(name) if name == "weather"));
    assert_eq!(host.session_count().await, 0);
}

#[tokio::test]
async fn test_backend_round_trip_through_host() {
    let mock = backend();
    let host = host_with(mock.clone()).await;
    let id = host.start_session("navi").await.unwrap();
    assert_eq!(poll_until(&host, &id).await.prompt, "ask_poi");

    host.post_event(&id, utterance("poi", "bank".into(), 0.9))
        .await
        .unwrap();

    let shown = poll_until(&host, &id).await;
    assert_eq!(shown.prompt, "show_results");
    assert_eq!(poll_until(&host, &id).await.prompt, "ask_choice");

    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "search_poi");
    assert_eq!(calls[0].1.get("poi"), Some(&ConceptValue::from("bank")));

    host.post_event(&id, utterance("choice", ConceptValue::Int(2), 0.9))
        .await
        .unwrap();
    let begin = poll_until(&host, &id).await;
    assert_eq!(begin.prompt, "begin_navi");
    assert_eq!(
        begin
            .fillers
            .get("destination")
            .and_then(|d| match d {
                ConceptValue::Frame(f) => f.get("name").cloned(),
                _ => None,
            }),
        Some(ConceptValue::from("Citizens Bank"))
    );
    assert_eq!(poll_until(&host, &id).await.prompt, "ask_poi");
}

#[tokio::test]
async fn test_backend_failure_fails_required_path() {
    let mock = MockBackend::new().on("search_poi", |_| Err("index offline".to_string()));
    let host = host_with(mock).await;
    let id = host.start_session("navi").await.unwrap();
    poll_until(&host, &id).await;
    let mut status = host.watch_status(&id).await.unwrap();

    host.post_event(&id, utterance("poi", "bank".into(), 0.9))
        .await
        .unwrap();
    let finished = tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| !s.is_running()),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(
        finished,
        SessionStatus::Finished {
            outcome: AgentStatus::Failed
        }
    );
    assert!(matches!(
        host.post_event(&id, InteractionEvent::Resume).await,
        Err(DialogError::SessionClosed(_))
    ));
}

#[tokio::test]
async fn test_abort_session_removes_it() {
    let host = host_with(backend()).await;
    let id = host.start_session("navi").await.unwrap();
    host.abort_session(&id).await.unwrap();

    assert_eq!(host.session_count().await, 0);
    let err = host
        .post_event(&id, InteractionEvent::Resume)
        .await
        .unwrap_err();
    assert!(matches!(err, DialogError::SessionNotFound(_)));
    assert!(matches!(
        host.abort_session(&id).await,
        Err(DialogError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_sessions_do_not_share_state() {
    let host = host_with(backend()).await;
    let a = host.start_session("navi").await.unwrap();
    let b = host.start_session("navi").await.unwrap();
    assert_ne!(a, b);
    poll_until(&host, &a).await;
    poll_until(&host, &b).await;

    host.post_event(&a, utterance("poi", "bank".into(), 0.5))
        .await
        .unwrap();
    assert_eq!(poll_until(&host, &a).await.prompt, "explicit_confirm");
    assert!(host.poll_output(&b).await.unwrap().is_none());

    host.abort_session(&a).await.unwrap();
    assert!(host.session_status(&b).await.unwrap().is_running());
}

#[tokio::test]
async fn test_restore_session_rolls_back_turn() {
    let host = host_with(backend()).await;
    let id = host.start_session("navi").await.unwrap();
    poll_until(&host, &id).await;

    host.post_event(&id, utterance("poi", "bank".into(), 0.5))
        .await
        .unwrap();
    assert_eq!(poll_until(&host, &id).await.prompt, "explicit_confirm");

    host.restore_session(&id, 1).await.unwrap();
    host.post_event(&id, utterance("poi", "bakery".into(), 0.2))
        .await
        .unwrap();
    assert_eq!(poll_until(&host, &id).await.prompt, "clarify");

    assert!(matches!(
        host.restore_session(&id, 99).await,
        Err(DialogError::SnapshotNotFound(99))
    ));
}

#[tokio::test]
async fn test_restore_session_reruns_search_in_flight() {
    let mock = backend();
    let host = host_with(mock.clone()).await;
    let id = host.start_session("navi").await.unwrap();
    poll_until(&host, &id).await;

    host.post_event(&id, utterance("poi", "bank".into(), 0.9))
        .await
        .unwrap();
    assert_eq!(poll_until(&host, &id).await.prompt, "show_results");
    assert_eq!(poll_until(&host, &id).await.prompt, "ask_choice");

    // 第 2 轮结束时搜索仍在进行
    host.restore_session(&id, 2).await.unwrap();
    assert_eq!(poll_until(&host, &id).await.prompt, "show_results");
    assert_eq!(poll_until(&host, &id).await.prompt, "ask_choice");
    assert_eq!(mock.calls().len(), 2);
}

#[tokio::test]
async fn test_load_templates_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::copy(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("templates/navi.json"),
        dir.path().join("navi.json"),
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let host = SessionHost::new(AppConfig::default(), Arc::new(backend())).unwrap();
    assert_eq!(host.load_templates_dir(dir.path()).await.unwrap(), 1);
    assert_eq!(host.template_ids().await, ["navi"]);

    std::fs::write(dir.path().join("broken.json"), "{\"name\": ").unwrap();
    assert!(matches!(
        host.load_templates_dir(dir.path()).await,
        Err(DialogError::Configuration(_))
    ));
}
