mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use qzwall::models::{Id, PostStatus};
use qzwall::moderation::Moderation;
use qzwall::qzone::{SessionClient, UpstreamError};
use qzwall::render::ImageResolver;
use qzwall::repo::{inmem::InMemRepo, sqlite::SqliteRepo, PostRepo};
use qzwall::worker::{Publisher, TickOutcome};
use tokio_util::sync::CancellationToken;

fn mem_repo() -> Arc<dyn PostRepo> {
    Arc::new(InMemRepo::new())
}

/// Post ids listed in a summary body (`#<id>: ...` lines).
fn summary_ids(text: &str) -> Vec<Id> {
    text.lines()
        .filter_map(|l| l.strip_prefix('#')?.split_once(':')?.0.parse().ok())
        .collect()
}

#[tokio::test]
async fn approved_post_is_published() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), Arc::default(), worker_cfg());
    let post = submit(repo.as_ref(), "hello").await;
    let shutdown = CancellationToken::new();

    // pending posts are not touched
    assert_eq!(publisher.tick(&shutdown).await.unwrap(), TickOutcome::Idle);

    Moderation::new(repo.clone()).approve(post.id).await.unwrap();
    let outcome = publisher.tick(&shutdown).await.unwrap();
    assert_eq!(outcome, TickOutcome::Published { tid: "T1".into(), posts: vec![post.id] });

    let stored = repo.get(post.id).await.unwrap().unwrap();
    assert_eq!((stored.status, stored.tid.as_str()), (PostStatus::Published, "T1"));
    let calls = api.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].images, vec![b"X".to_vec()]);
    assert_eq!(calls[0].uin, 10001);
    assert_eq!(summary_ids(&calls[0].text), vec![post.id]);

    assert_eq!(publisher.tick(&shutdown).await.unwrap(), TickOutcome::Idle);
    assert_store_invariants(repo.as_ref()).await;
}

#[tokio::test]
async fn render_failure_excludes_only_that_post() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    let p1 = submit_approved(repo.as_ref(), "first").await;
    let p2 = submit_approved(repo.as_ref(), "second").await;
    let p3 = submit_approved(repo.as_ref(), "third").await;
    let renderer = FakeRenderer::failing(&[p2.id]);
    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), renderer.clone(), worker_cfg());
    let shutdown = CancellationToken::new();

    let outcome = publisher.tick(&shutdown).await.unwrap();
    assert_eq!(outcome, TickOutcome::Published { tid: "T1".into(), posts: vec![p1.id, p3.id] });

    let calls = api.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].images.len(), 2);
    assert!(calls[0].text.contains(&format!("#{}:", p1.id)));
    assert!(calls[0].text.contains(&format!("#{}:", p3.id)));
    assert!(!calls[0].text.contains(&format!("#{}:", p2.id)));

    let p2 = repo.get(p2.id).await.unwrap().unwrap();
    assert_eq!((p2.status, p2.retry_count), (PostStatus::Approved, 1));
    assert!(p2.reason.is_empty());
    assert!(!p2.last_error.is_empty());

    // once the image is fixed the post goes out on the next cycle
    renderer.heal(p2.id);
    assert_eq!(
        publisher.tick(&shutdown).await.unwrap(),
        TickOutcome::Published { tid: "T2".into(), posts: vec![p2.id] }
    );
    assert_store_invariants(repo.as_ref()).await;
}

#[tokio::test]
async fn expired_session_is_refreshed_and_publish_retried() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    api.script_publish([Err(UpstreamError::SessionExpired)]);
    let bot = FakeBot::with_cookie(1, FRESH_COOKIE);
    let agent = agent(Some(COOKIE), vec![bot.clone()]);
    let publisher = publisher(repo.clone(), api.clone(), agent.clone(), Arc::default(), worker_cfg());
    let post = submit_approved(repo.as_ref(), "hello").await;

    let outcome = publisher.tick(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, TickOutcome::Published { tid: "T1".into(), posts: vec![post.id] });

    let calls = api.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].skey, "@first");
    assert_eq!(calls[1].skey, "@fresh");
    assert_eq!(bot.calls(), 1);
    assert_eq!(agent.generation(), 1);

    let stored = repo.get(post.id).await.unwrap().unwrap();
    assert_eq!((stored.status, stored.retry_count), (PostStatus::Published, 0));
}

#[tokio::test]
async fn repeated_publish_failures_end_in_failed() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    let busy = || -> Result<String, UpstreamError> { Err(UpstreamError::Rejected { code: -10001, message: "busy".into() }) };
    api.script_publish([busy(), busy(), busy(), busy()]);
    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), Arc::default(), worker_cfg());
    let post = submit_approved(repo.as_ref(), "hello").await;
    let shutdown = CancellationToken::new();

    for attempt in 1..=3 {
        let outcome = publisher.tick(&shutdown).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Failed { .. }));
        let stored = repo.get(post.id).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.retry_count), (PostStatus::Approved, attempt));
        assert!(stored.tid.is_empty());
        assert!(stored.reason.is_empty());
        assert_store_invariants(repo.as_ref()).await;
    }

    assert!(matches!(publisher.tick(&shutdown).await.unwrap(), TickOutcome::Failed { .. }));
    let stored = repo.get(post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.reason, "publish exceeded retries: upstream rejected request (code -10001): busy");
    assert_eq!(api.calls().len(), 4);

    // failed posts are out of the queue
    assert_eq!(publisher.tick(&shutdown).await.unwrap(), TickOutcome::Idle);
    assert_store_invariants(repo.as_ref()).await;
}

#[tokio::test]
async fn repeated_render_failures_end_in_failed() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    let post = submit_approved(repo.as_ref(), "broken").await;
    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), FakeRenderer::failing(&[post.id]), worker_cfg());
    let shutdown = CancellationToken::new();

    for _ in 0..3 {
        assert_eq!(publisher.tick(&shutdown).await.unwrap(), TickOutcome::Nothing);
    }
    assert_eq!(publisher.tick(&shutdown).await.unwrap(), TickOutcome::Nothing);
    let stored = repo.get(post.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PostStatus::Failed);
    assert!(stored.reason.starts_with("render exceeded retries: "));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn backoff_doubles_up_to_the_cap() {
    let publisher = publisher(mem_repo(), FakeUpstream::new(), agent(Some(COOKIE), vec![]), Arc::default(), worker_cfg());
    let ms = |n| publisher.backoff(n).as_millis();
    assert_eq!([ms(1), ms(2), ms(3), ms(4), ms(30)], [10, 20, 40, 40, 40]);
}

#[tokio::test]
async fn publish_delay_holds_fresh_approvals() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    let client = SessionClient::new(api.clone(), agent(Some(COOKIE), vec![]), 1, Duration::from_secs(5));
    let publisher = Publisher::new(
        repo.clone(),
        client,
        Arc::new(FakeRenderer::default()),
        ImageResolver::new("/tmp/qzwall-test-uploads", ""),
        worker_cfg(),
        Duration::from_secs(3600),
    );
    submit_approved(repo.as_ref(), "too soon").await;
    assert_eq!(publisher.tick(&CancellationToken::new()).await.unwrap(), TickOutcome::Idle);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn cancelled_tick_claims_nothing() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), Arc::default(), worker_cfg());
    let post = submit_approved(repo.as_ref(), "hello").await;
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    assert_eq!(publisher.tick(&shutdown).await.unwrap(), TickOutcome::Aborted);
    assert_eq!(repo.get(post.id).await.unwrap().unwrap().status, PostStatus::Approved);
}

async fn wait_until_published(repo: &dyn PostRepo, count: i64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while repo.count_by_status(PostStatus::Published).await.unwrap() < count
            || !repo.get_approved(1).await.unwrap().is_empty()
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("posts were not published in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_publish_a_post_twice() {
    let repo: Arc<dyn PostRepo> = Arc::new(SqliteRepo::in_memory().await.unwrap());
    let api = FakeUpstream::new();
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(submit_approved(repo.as_ref(), &format!("post {i}")).await.id);
    }
    let cfg = qzwall::config::WorkerConfig { workers: 4, batch_max: 3, ..worker_cfg() };
    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), Arc::default(), cfg);
    let shutdown = CancellationToken::new();
    let handle = publisher.start(&shutdown).await.unwrap();

    wait_until_published(repo.as_ref(), 20).await;
    handle.stop().await;

    let mut seen: HashMap<Id, usize> = HashMap::new();
    for call in api.calls() {
        assert!(call.images.len() <= 3);
        for id in summary_ids(&call.text) {
            *seen.entry(id).or_default() += 1;
        }
    }
    assert_eq!(seen.len(), 20);
    assert!(seen.values().all(|n| *n == 1), "double publish: {seen:?}");
    for id in ids {
        let p = repo.get(id).await.unwrap().unwrap();
        assert!(p.tid.starts_with('T'), "post {id} left with {:?}", p.tid);
    }
    assert_store_invariants(repo.as_ref()).await;
}

/// Two ticks pick up the same post; the second one only gets past the gate
/// after the first has rolled back. Both failures must count.
async fn overlapping_failures_both_count(repo: Arc<dyn PostRepo>) {
    let api = FakeUpstream::new();
    let busy = || -> Result<String, UpstreamError> { Err(UpstreamError::Rejected { code: -10001, message: "busy".into() }) };
    api.script_publish([busy(), busy()]);
    let cfg = qzwall::config::WorkerConfig { retry_count: 1, rate_limit: Duration::from_millis(200), ..worker_cfg() };
    let renderer = FakeRenderer::slow(Duration::from_millis(100));
    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), renderer, cfg);
    let post = submit_approved(repo.as_ref(), "contended").await;
    let shutdown = CancellationToken::new();

    let (a, b) = tokio::join!(publisher.tick(&shutdown), publisher.tick(&shutdown));
    for outcome in [a.unwrap(), b.unwrap()] {
        assert!(matches!(outcome, TickOutcome::Failed { ref posts, .. } if posts == &vec![post.id]), "{outcome:?}");
    }
    assert_eq!(api.calls().len(), 2);

    let stored = repo.get(post.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.status, PostStatus::Failed);
    assert_eq!(stored.reason, "publish exceeded retries: upstream rejected request (code -10001): busy");
    assert_store_invariants(repo.as_ref()).await;
}

#[tokio::test]
async fn overlapping_ticks_keep_retry_accounting_inmem() {
    overlapping_failures_both_count(mem_repo()).await;
}

#[tokio::test]
async fn overlapping_ticks_keep_retry_accounting_sqlite() {
    overlapping_failures_both_count(Arc::new(SqliteRepo::in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn startup_releases_stale_claims_and_stop_halts_workers() {
    let repo = mem_repo();
    let api = FakeUpstream::new();
    let mut stale = submit_approved(repo.as_ref(), "interrupted").await;
    stale.status = PostStatus::Published;
    stale.tid = "claim:crashed".into();
    repo.save(&mut stale).await.unwrap();

    let publisher = publisher(repo.clone(), api.clone(), agent(Some(COOKIE), vec![]), Arc::default(), worker_cfg());
    let shutdown = CancellationToken::new();
    let handle = publisher.start(&shutdown).await.unwrap();
    wait_until_published(repo.as_ref(), 1).await;
    assert_eq!(repo.get(stale.id).await.unwrap().unwrap().tid, "T1");

    handle.stop().await;
    let late = submit_approved(repo.as_ref(), "after shutdown").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(repo.get(late.id).await.unwrap().unwrap().status, PostStatus::Approved);
    assert_eq!(api.calls().len(), 1);
    // the parent token is untouched by a publisher stop
    assert!(!shutdown.is_cancelled());
}
