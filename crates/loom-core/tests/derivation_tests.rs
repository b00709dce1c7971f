use loom_artifact::{Artifact, ArtifactStatus, ArtifactType};
use loom_core::{
    DerivationState, ExecutorConfig, Executor, FailurePhase, ProgressEvent, StateManager, Tracker,
};
use loom_document::{Hasher, Parser};
use loom_test_utils::{
    chain_project, generated_section, init_tracing, EchoDeriver, FailingDeriver, ProjectFixture,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn tracker(fixture: &ProjectFixture) -> Tracker {
    Tracker::new(fixture.path(), Hasher::default())
}

fn status(state: &DerivationState, id: &str) -> ArtifactStatus {
    state.get_artifact(id).unwrap().status
}

/// Rewrite the user story and pick the change up from disk
fn edit_story(fixture: &ProjectFixture, state: &mut DerivationState) {
    fixture.write(
        "l0/stories.md",
        &format!(
            "# Stories\n\n{}\n",
            generated_section("US-ORD-001", ArtifactType::UserStory, "As a buyer I can place and pay an order.")
        ),
    );
    let summary = tracker(fixture).sync_from_files(state, &Parser::default());
    assert_eq!(summary.modified, vec!["US-ORD-001"]);
}

#[test]
fn test_unchanged_chain_stays_current() {
    let (fixture, mut state) = chain_project();
    tracker(&fixture).sync_from_files(&mut state, &Parser::default());
    tracker(&fixture).update_statuses(&mut state).unwrap();
    for id in ["US-ORD-001", "AC-ORD-001", "TS-ORD-001"] {
        assert_eq!(status(&state, id), ArtifactStatus::Current, "{id}");
    }
}

#[test]
fn test_upstream_change_marks_stale_then_affected() {
    let (fixture, mut state) = chain_project();
    edit_story(&fixture, &mut state);
    tracker(&fixture).update_statuses(&mut state).unwrap();

    assert_eq!(status(&state, "AC-ORD-001"), ArtifactStatus::Stale);
    assert_eq!(status(&state, "TS-ORD-001"), ArtifactStatus::Affected);

    let stale: Vec<String> = tracker(&fixture)
        .detect_stale_artifacts(&state)
        .into_iter()
        .map(|a| a.id.clone())
        .collect();
    assert_eq!(stale, vec!["AC-ORD-001"]);

    let report = state.status_report();
    assert!(report.needs_action());
    assert_eq!(report.stale.len(), 1);
    assert_eq!(report.affected.len(), 1);
}

#[tokio::test]
async fn test_dry_run_leaves_files_and_state_untouched() {
    init_tracing();
    let (fixture, mut state) = chain_project();
    edit_story(&fixture, &mut state);

    let files = ["l0/stories.md", "l1/criteria.md", "l2/spec.md"].map(|f| fixture.read_bytes(f));
    let before = state.clone();
    let manager = Arc::new(StateManager::new(fixture.path()));

    let config = ExecutorConfig {
        dry_run: true,
        ..ExecutorConfig::default()
    };
    let deriver = Arc::new(EchoDeriver::new());
    let result = Executor::new(tracker(&fixture), config)
        .with_shared_deriver(deriver.clone())
        .with_state_manager(Arc::clone(&manager))
        .execute_all(&mut state)
        .await
        .unwrap();

    assert_eq!(result.derived_ids(), vec!["AC-ORD-001", "TS-ORD-001"]);
    assert_eq!(deriver.calls(), vec!["AC-ORD-001", "TS-ORD-001"]);
    assert_eq!(["l0/stories.md", "l1/criteria.md", "l2/spec.md"].map(|f| fixture.read_bytes(f)), files);
    assert_eq!(state, before);
    assert!(!manager.state_path().exists());
    assert!(!manager.lock_path().exists());
}

#[tokio::test]
async fn test_derivation_updates_chain_and_keeps_manual_text() {
    let (fixture, mut state) = chain_project();
    edit_story(&fixture, &mut state);

    let manager = Arc::new(StateManager::new(fixture.path()));
    let executor = Executor::new(tracker(&fixture), ExecutorConfig::default())
        .with_deriver(EchoDeriver::new())
        .with_state_manager(Arc::clone(&manager));
    let result = executor.execute_all(&mut state).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.derived_ids(), vec!["AC-ORD-001", "TS-ORD-001"]);
    assert_eq!(result.derived[0].manual_kept, vec!["notes"]);

    let criteria = fixture.read("l1/criteria.md");
    assert!(criteria.starts_with("# Criteria\n"));
    assert!(criteria.contains("AC-ORD-001 derived from [As a buyer I can place and pay an order.]"));
    assert!(criteria.contains("Reviewed by finance."));
    assert!(fixture.read("l2/spec.md").contains("TS-ORD-001 derived from [AC-ORD-001 derived from"));

    tracker(&fixture).update_statuses(&mut state).unwrap();
    assert!(state.stale_artifacts().is_empty());

    let saved = manager.load_required().unwrap();
    assert!(saved.last_full_derive.is_some());
    assert_eq!(saved.get_artifact("TS-ORD-001"), state.get_artifact("TS-ORD-001"));

    let again = executor.execute_all(&mut state).await.unwrap();
    assert!(again.plan.is_empty());
}

#[tokio::test]
async fn test_failure_is_isolated_to_its_downstream() {
    let (fixture, mut state) = chain_project();
    fixture.write(
        "l1/rules.md",
        &format!("{}\n", generated_section("BR-ORD-001", ArtifactType::BusinessRule, "Orders need an address.")),
    );
    let us_hash = state.get_artifact("US-ORD-001").unwrap().content_hash;
    state.set_artifact(
        fixture
            .artifact("BR-ORD-001", ArtifactType::BusinessRule, "l1/rules.md")
            .with_upstream("US-ORD-001", us_hash),
    );
    state.rebuild_graph();
    edit_story(&fixture, &mut state);

    let manager = Arc::new(StateManager::new(fixture.path()));
    let result = Executor::new(tracker(&fixture), ExecutorConfig::default())
        .with_deriver(FailingDeriver::new(["AC-ORD-001"]))
        .with_state_manager(Arc::clone(&manager))
        .execute_all(&mut state)
        .await
        .unwrap();

    assert_eq!(result.derived_ids(), vec!["BR-ORD-001"]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].phase, FailurePhase::Derive);
    assert!(result.errors[0].message.contains("generator refused AC-ORD-001"));
    assert_eq!(result.skipped[0].artifact_id, "TS-ORD-001");

    let saved = manager.load_required().unwrap();
    assert!(saved.last_full_derive.is_none());
    assert_eq!(saved.get_artifact("BR-ORD-001").unwrap().status, ArtifactStatus::Current);
    assert_eq!(saved.get_artifact("AC-ORD-001").unwrap().status, ArtifactStatus::Stale);
}

#[tokio::test]
async fn test_progress_events_bracket_the_batch() {
    let (fixture, mut state) = chain_project();
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    let executor = Executor::new(tracker(&fixture), ExecutorConfig::default())
        .with_deriver(EchoDeriver::new())
        .with_progress(move |e| sink.lock().push(e.clone()));

    let empty = executor.execute_all(&mut state).await.unwrap();
    assert!(empty.plan.is_empty());
    let kinds: Vec<&str> = events.lock().iter().map(ProgressEvent::kind).collect();
    assert_eq!(kinds, vec!["start", "complete"]);

    events.lock().clear();
    executor.execute(&mut state, &["AC-ORD-001"]).await.unwrap();
    let events = events.lock();
    let kinds: Vec<&str> = events.iter().map(ProgressEvent::kind).collect();
    assert_eq!(kinds, vec!["start", "step", "step", "complete"]);
    assert_eq!(
        events[1],
        ProgressEvent::Step {
            artifact_id: "AC-ORD-001".into(),
            current: 1,
            total: 2,
            message: "Deriving AC-ORD-001 (l1)".into(),
        }
    );
}

#[tokio::test]
async fn test_no_deriver_skips_instead_of_failing() {
    let (fixture, mut state) = chain_project();
    let result = Executor::new(tracker(&fixture), ExecutorConfig::default())
        .execute(&mut state, &["US-ORD-001"])
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.skipped.len(), 3);
    assert!(result.skipped.iter().all(|s| s.reason == "no deriver function configured"));
}

#[tokio::test]
async fn test_parallel_siblings_see_their_own_upstream() {
    let fixture = ProjectFixture::new();
    let mut state = DerivationState::new("fanout");
    let mut stories = String::new();
    for i in 1..=3 {
        stories.push_str(&generated_section(&format!("US-ORD-00{i}"), ArtifactType::UserStory, &format!("story {i}")));
        stories.push('\n');
    }
    fixture.write("l0/stories.md", &stories);
    for i in 1..=3 {
        let story = fixture.artifact(&format!("US-ORD-00{i}"), ArtifactType::UserStory, "l0/stories.md");
        fixture.write(
            &format!("l1/ac-{i}.md"),
            &format!("{}\n", generated_section(&format!("AC-ORD-00{i}"), ArtifactType::AcceptanceCriteria, "old")),
        );
        let criteria = fixture
            .artifact(&format!("AC-ORD-00{i}"), ArtifactType::AcceptanceCriteria, &format!("l1/ac-{i}.md"))
            .with_upstream(story.id.clone(), None);
        state.set_artifact(story);
        state.set_artifact(criteria);
    }
    state.rebuild_graph();

    let config = ExecutorConfig {
        max_parallel: 3,
        ..ExecutorConfig::default()
    };
    let result = Executor::new(tracker(&fixture), config)
        .with_deriver(EchoDeriver::new())
        .execute_all(&mut state)
        .await
        .unwrap();

    assert_eq!(result.derived_ids(), vec!["AC-ORD-001", "AC-ORD-002", "AC-ORD-003"]);
    for i in 1..=3 {
        assert!(fixture.read(&format!("l1/ac-{i}.md")).contains(&format!("derived from [story {i}]")));
    }
}

#[test]
fn test_preview_reports_manual_edit_warning() {
    let (fixture, state) = chain_project();
    let preview = Executor::new(tracker(&fixture), ExecutorConfig::default())
        .preview_execution(&state, &["US-ORD-001"])
        .unwrap();
    assert_eq!(preview.plan.total_count, 3);
    assert_eq!(preview.impact.affected_artifacts, vec!["AC-ORD-001", "TS-ORD-001"]);
    assert_eq!(preview.impact.manual_edit_warnings.len(), 1);
    assert!(preview.plan.steps[1].has_manual);
}

#[test]
fn test_graph_validation_is_non_fatal() {
    let (fixture, mut state) = chain_project();
    let orphan = Artifact::new("TC-AC-ORD-001-P01", ArtifactType::TestCase, Default::default())
        .with_upstream("AC-ORD-404", None);
    state.set_artifact(orphan);
    state.rebuild_graph();
    let issues = tracker(&fixture).validate_graph(&state);
    assert_eq!(issues.len(), 1);
    assert!(issues[0].to_string().contains("AC-ORD-404"));
}
