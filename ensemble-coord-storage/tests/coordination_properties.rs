//! End-to-end properties of the coordination protocol, checked against
//! every storage backend.

mod common;

use common::TestContext;
use ensemble_coord_core::clarification::ClarificationOutcome;
use ensemble_coord_core::config::DEFAULT_CLARIFICATION_ANSWER;
use ensemble_coord_core::work_item::{NewWorkItem, WorkItemStatus, WorkOutcome};
use ensemble_coord_core::Error;
use ensemble_coord_storage::services::ReleaseOutcome;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn item(id: &str, priority: i64) -> NewWorkItem {
    NewWorkItem::new("build", "producer").id(id).priority(priority)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claimant() {
    for ctx in TestContext::all().await {
        let work = ctx.coordinator.work();
        work.enqueue(item("only", 5)).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..16 {
            let coordinator = ctx.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .work()
                    .claim(&format!("worker-{}", n), None)
                    .await
                    .unwrap()
            }));
        }

        let winners = join_all(handles)
            .await
            .into_iter()
            .filter(|claimed| claimed.as_ref().unwrap().is_some())
            .count();
        assert_eq!(winners, 1, "backend {}", ctx.name);

        let stats = work.stats().await.unwrap();
        assert_eq!(stats.pending, 0, "backend {}", ctx.name);
        assert_eq!(stats.active, 1, "backend {}", ctx.name);
    }
}

#[tokio::test]
async fn test_no_lost_work() {
    for ctx in TestContext::all().await {
        let coordinator = &ctx.coordinator;
        coordinator.registry().register("worker-1").await.unwrap();
        coordinator.registry().register("worker-2").await.unwrap();
        coordinator.work().enqueue(item("job", 1)).await.unwrap();

        let claimed = coordinator.work().claim("worker-1", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, "job");

        ctx.clock.advance_secs(70);
        coordinator.registry().heartbeat("worker-2", None).await.unwrap();

        let report = coordinator.heartbeat_monitor("worker-2").sweep().await;
        assert_eq!(report.dead_agents, vec!["worker-1".to_string()], "backend {}", ctx.name);
        assert_eq!(report.reclaimed_items, vec!["job".to_string()], "backend {}", ctx.name);

        let pending = coordinator.work().list_pending().await.unwrap();
        assert_eq!(pending.len(), 1, "backend {}", ctx.name);
        assert_eq!(pending[0].status, WorkItemStatus::Pending);
        assert!(pending[0].claimed_by.is_none());

        let reclaimed = coordinator.work().claim("worker-2", None).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, "job");
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("worker-2"));
    }
}

#[tokio::test]
async fn test_release_is_idempotent() {
    for ctx in TestContext::all().await {
        let locks = ctx.coordinator.locks();

        locks.acquire("docs/readme", "agent-a", None).await.unwrap();
        assert_eq!(
            locks.release("docs/readme", "agent-a").await.unwrap(),
            ReleaseOutcome::Released
        );
        assert_eq!(
            locks.release("docs/readme", "agent-a").await.unwrap(),
            ReleaseOutcome::NotHeld
        );

        locks.acquire("docs/readme", "agent-b", None).await.unwrap();
        assert_eq!(
            locks.release("docs/readme", "agent-a").await.unwrap(),
            ReleaseOutcome::HeldByOther {
                holder: "agent-b".to_string()
            }
        );

        let lock = locks.get("docs/readme").await.unwrap().unwrap();
        assert_eq!(lock.holder, "agent-b", "backend {}", ctx.name);
    }
}

#[tokio::test]
async fn test_completed_items_are_terminal() {
    for ctx in TestContext::all().await {
        let work = ctx.coordinator.work();
        work.enqueue(item("done", 5)).await.unwrap();
        work.claim("worker-1", None).await.unwrap().unwrap();
        let completed = work
            .complete("worker-1", "done", WorkOutcome::Success)
            .await
            .unwrap();
        assert_eq!(completed.status, WorkItemStatus::Completed);
        assert_eq!(completed.completed_by.as_deref(), Some("worker-1"));

        assert!(!work.reclaim("done").await.unwrap());
        assert!(work.reclaim_for_agent("worker-1").await.unwrap().is_empty());
        assert!(work.claim("worker-2", None).await.unwrap().is_none());
        assert!(matches!(
            work.complete("worker-1", "done", WorkOutcome::Failed).await,
            Err(Error::StateTransition { .. })
        ));
        assert!(matches!(
            work.enqueue(item("done", 5)).await,
            Err(Error::DuplicateId { .. })
        ));

        let stored = work.get("done").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::Completed, "backend {}", ctx.name);
        assert_eq!(stored.result, Some(WorkOutcome::Success));
        assert!(work.list_pending().await.unwrap().is_empty());
        assert!(work.list_active().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_clarification_timeout_and_late_answer() {
    for ctx in TestContext::all().await {
        let clarifications = ctx.coordinator.clarifications();

        let started = Instant::now();
        let outcome = clarifications
            .ask("agent-a", "Drop the legacy table?", "", Duration::from_millis(100))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(
            outcome,
            ClarificationOutcome::TimedOut {
                default_answer: DEFAULT_CLARIFICATION_ANSWER.to_string()
            },
            "backend {}",
            ctx.name
        );
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(5));

        let page = ctx.coordinator.broadcast().read(None).await.unwrap();
        let asked = page
            .events
            .iter()
            .find(|event| event.message.starts_with("asked "))
            .unwrap();
        let request_id = asked
            .message
            .trim_start_matches("asked ")
            .split(':')
            .next()
            .unwrap();
        assert!(!clarifications.answer(request_id, "yes").await.unwrap());
        assert!(clarifications.pending().await.unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_lock_mutual_exclusion_under_load() {
    for ctx in TestContext::all().await {
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for n in 0..50 {
            let coordinator = ctx.coordinator.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let holder = format!("agent-{}", n);
                for _ in 0..3 {
                    coordinator
                        .locks()
                        .acquire_with_retry("shared", &holder, None, Some(Duration::from_secs(60)))
                        .await
                        .unwrap();

                    let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now_inside, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);

                    assert_eq!(
                        coordinator.locks().release("shared", &holder).await.unwrap(),
                        ReleaseOutcome::Released
                    );
                }
            }));
        }
        for result in join_all(handles).await {
            result.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1, "backend {}", ctx.name);
        assert!(ctx.coordinator.locks().get("shared").await.unwrap().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_expired_lease_goes_to_exactly_one_contender() {
    for ctx in TestContext::all().await {
        for round in 0..10 {
            let resource = format!("expiring-{}", round);
            ctx.coordinator
                .locks()
                .acquire(&resource, "departed", Some(10))
                .await
                .unwrap();
            ctx.clock.advance_secs(11);

            let mut handles = Vec::new();
            for n in 0..16 {
                let coordinator = ctx.coordinator.clone();
                let resource = resource.clone();
                handles.push(tokio::spawn(async move {
                    coordinator
                        .locks()
                        .acquire(&resource, &format!("contender-{}", n), None)
                        .await
                }));
            }

            let mut winners = Vec::new();
            for result in join_all(handles).await {
                match result.unwrap() {
                    Ok(lock) => winners.push(lock.holder),
                    Err(e) => assert!(e.is_contention(), "backend {}: {}", ctx.name, e),
                }
            }
            assert_eq!(winners.len(), 1, "backend {} round {}", ctx.name, round);

            let held = ctx.coordinator.locks().get(&resource).await.unwrap().unwrap();
            assert_eq!(held.holder, winners[0], "backend {}", ctx.name);
        }
    }
}

#[tokio::test]
async fn test_priority_ordering() {
    for ctx in TestContext::all().await {
        let work = ctx.coordinator.work();
        for (id, priority) in [("p3", 3), ("p1", 1), ("p2", 2)] {
            work.enqueue(item(id, priority)).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(claimed) = work.claim("worker-1", None).await.unwrap() {
            order.push(claimed.priority);
        }
        assert_eq!(order, vec![1, 2, 3], "backend {}", ctx.name);
    }
}

#[tokio::test]
async fn test_dead_worker_handoff_scenario() {
    for ctx in TestContext::all().await {
        let coordinator = &ctx.coordinator;
        let work = coordinator.work();
        for worker in ["w1", "w2", "w3"] {
            coordinator.registry().register(worker).await.unwrap();
        }

        work.enqueue(item("A", 1)).await.unwrap();
        work.enqueue(item("B", 2)).await.unwrap();

        assert_eq!(work.claim("w1", None).await.unwrap().unwrap().id, "A");
        assert_eq!(work.claim("w2", None).await.unwrap().unwrap().id, "B");

        // w1 goes silent; the others keep heartbeating
        for _ in 0..2 {
            ctx.clock.advance_secs(35);
            coordinator.registry().heartbeat("w2", Some("B".to_string())).await.unwrap();
            coordinator.registry().heartbeat("w3", None).await.unwrap();
        }

        let report = coordinator.heartbeat_monitor("w3").sweep().await;
        assert_eq!(report.dead_agents, vec!["w1".to_string()], "backend {}", ctx.name);

        let a = work.get("A").await.unwrap().unwrap();
        assert_eq!(a.status, WorkItemStatus::Pending);
        assert!(a.claimed_by.is_none());

        work.complete("w2", "B", WorkOutcome::Success).await.unwrap();
        assert_eq!(work.claim("w3", None).await.unwrap().unwrap().id, "A");
        work.complete("w3", "A", WorkOutcome::Success).await.unwrap();

        assert!(work.list_pending().await.unwrap().is_empty());
        assert!(work.list_active().await.unwrap().is_empty());
        let completed: Vec<String> = work
            .list_completed()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect();
        assert_eq!(completed, vec!["A".to_string(), "B".to_string()], "backend {}", ctx.name);

        assert!(matches!(
            coordinator.registry().heartbeat("w1", None).await,
            Err(Error::StateTransition { .. })
        ));
    }
}
