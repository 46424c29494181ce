//! Seeded fan-out scenario: a rule matching `task_completed` with
//! destinations `[activity, owner]` produces exactly one notification
//! row, one activity row, and one pending-mailbox row addressed to the
//! team owner.

use std::sync::Arc;

use devclaw::channel::RecordingChannelSink;
use devclaw::db::Store;
use devclaw::notification::NotificationDispatcher;
use devclaw::team::TeamMemory;
use devclaw::types::{NotificationDestination, NotificationResult};

fn count(store: &Store, sql: &str, params: &[&str]) -> i64 {
    store
        .with_conn(|conn| {
            conn.query_row(
                sql,
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )
        })
        .expect("count query should succeed")
}

#[tokio::test]
async fn task_completed_rule_fans_out_to_activity_and_owner_inbox() {
    let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
    let memory = Arc::new(TeamMemory::new(store.clone()));
    let team = memory
        .create_team("Acme", "owner-jid", None, None)
        .expect("create_team should succeed");

    let sink = Arc::new(RecordingChannelSink::new());
    let dispatcher = NotificationDispatcher::new(store.clone(), memory.clone(), sink, None);

    dispatcher
        .add_rule(
            Some(team.team_id.clone()),
            "task completions",
            vec!["task_completed".to_owned()],
            vec![],
            vec![],
            0,
            None,
            None,
            None,
            vec![NotificationDestination::Activity, NotificationDestination::Owner],
        )
        .expect("add_rule should succeed");

    dispatcher
        .notify(
            &team.team_id,
            "task_completed",
            "agent-1",
            "Agent One",
            Some("task-1".to_owned()),
            "complete_task",
            NotificationResult::Success,
            "Task done",
            "{}",
            3,
        )
        .await
        .expect("notify should succeed");

    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM team_notifications WHERE team_id = ?1", &[team.team_id.as_str()]),
        1
    );
    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM team_activities WHERE team_id = ?1", &[team.team_id.as_str()]),
        1
    );
    assert_eq!(
        count(
            &store,
            "SELECT COUNT(*) FROM pending_messages WHERE to_agent = ?1",
            &["owner-jid"]
        ),
        1
    );
}

#[tokio::test]
async fn unmatched_event_type_produces_no_fan_out() {
    let store = Arc::new(Store::open_in_memory().expect("open_in_memory should succeed"));
    let memory = Arc::new(TeamMemory::new(store.clone()));
    let team = memory
        .create_team("Acme", "owner-jid", None, None)
        .expect("create_team should succeed");

    let sink = Arc::new(RecordingChannelSink::new());
    let dispatcher = NotificationDispatcher::new(store.clone(), memory.clone(), sink, None);

    dispatcher
        .add_rule(
            Some(team.team_id.clone()),
            "task completions",
            vec!["task_completed".to_owned()],
            vec![],
            vec![],
            0,
            None,
            None,
            None,
            vec![NotificationDestination::Activity],
        )
        .expect("add_rule should succeed");

    dispatcher
        .notify(
            &team.team_id,
            "task_blocked",
            "agent-1",
            "Agent One",
            None,
            "block_task",
            NotificationResult::Warning,
            "Task blocked",
            "{}",
            3,
        )
        .await
        .expect("notify should succeed");

    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM team_notifications WHERE team_id = ?1", &[team.team_id.as_str()]),
        1
    );
    assert_eq!(
        count(&store, "SELECT COUNT(*) FROM team_activities WHERE team_id = ?1", &[team.team_id.as_str()]),
        0
    );
}
