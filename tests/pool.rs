use super::*;

#[tokio::test]
async fn mining_session() {
    let mut pool = TestPool::spawn().await;
    let mut miner = pool.connect().await;

    pretty_assert_eq!(
        miner
            .call(
                0,
                "mining.configure",
                json!([["version-rolling"], {"version-rolling.mask": "ffffffff"}]),
            )
            .await,
        json!({
            "id": 0,
            "result": {"version-rolling": true, "version-rolling.mask": "1fffe000"},
            "error": null,
        })
    );

    let extranonce1 = miner.login().await;
    pretty_assert_eq!(extranonce1.len(), 8);

    let difficulty = miner.notification().await;
    pretty_assert_eq!(difficulty["method"], "mining.set_difficulty");
    pretty_assert_eq!(difficulty["params"], json!([1e-12]));

    let notify = miner.notification().await;
    pretty_assert_eq!(notify["method"], "mining.notify");
    pretty_assert_eq!(notify["params"][0], "1");
    pretty_assert_eq!(notify["params"][8], true);

    pretty_assert_eq!(
        miner
            .call(3, "mining.submit", json!([worker(), "1", "00000000", "6553f132", "00000001"]))
            .await,
        json!({"id": 3, "result": true, "error": null})
    );

    let ShareEvent::Accepted(share) = pool.next_event().await else {
        panic!("expected an accepted share");
    };

    pretty_assert_eq!(share.pool_id, "btc1");
    pretty_assert_eq!(share.source, "test");
    pretty_assert_eq!(share.miner, ADDRESS);
    pretty_assert_eq!(share.worker, "rig");
    pretty_assert_eq!(share.user_agent, "cgminer/4.10");
    pretty_assert_eq!(share.ip_address, "127.0.0.1");
    pretty_assert_eq!(share.block_height, 100);

    pretty_assert_eq!(
        miner
            .call(4, "mining.submit", json!([worker(), "1", "00000000", "6553f132", "00000001"]))
            .await,
        json!({"id": 4, "result": null, "error": [22, "duplicate share", null]})
    );

    pretty_assert_eq!(
        miner
            .call(5, "mining.submit", json!([worker(), "ff", "00000000", "6553f132", "00000002"]))
            .await,
        json!({"id": 5, "result": null, "error": [21, "job not found", null]})
    );

    for _ in 0..2 {
        let ShareEvent::Rejected { miner: rejected, .. } = pool.next_event().await else {
            panic!("expected a rejected share");
        };
        pretty_assert_eq!(rejected.as_deref(), Some(ADDRESS));
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn new_blocks_reach_miners_and_retire_old_jobs() {
    let pool = TestPool::spawn().await;
    let mut miner = pool.connect().await;

    miner.login().await;
    miner.notification().await;
    miner.notification().await;

    pool.new_block(101, 2).await;

    let notify = miner.notification().await;
    pretty_assert_eq!(notify["method"], "mining.notify");
    pretty_assert_eq!(notify["params"][0], "2");
    pretty_assert_eq!(notify["params"][8], true);

    for (height, previous) in [(102, 3), (103, 4), (104, 5)] {
        pool.new_block(height, previous).await;
        pretty_assert_eq!(miner.notification().await["method"], "mining.notify");
    }

    pretty_assert_eq!(
        miner
            .call(3, "mining.submit", json!([worker(), "1", "00000000", "6553f132", "00000001"]))
            .await,
        json!({"id": 3, "result": null, "error": [21, "job not found", null]})
    );

    pretty_assert_eq!(
        miner
            .call(4, "mining.submit", json!([worker(), "5", "00000000", "6553f132", "00000001"]))
            .await,
        json!({"id": 4, "result": true, "error": null})
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn unauthorized_miners_get_no_work() {
    let pool = TestPool::spawn().await;
    let mut miner = pool.connect().await;

    miner
        .call(1, "mining.subscribe", json!(["cgminer/4.10"]))
        .await;

    pool.new_block(101, 2).await;

    pretty_assert_eq!(
        miner
            .call(2, "mining.submit", json!([worker(), "2", "00000000", "6553f132", "00000001"]))
            .await,
        json!({"id": 2, "result": null, "error": [24, "unauthorized worker", null]})
    );

    assert!(miner.notifications.is_empty());

    pool.shutdown().await;
}

#[tokio::test]
async fn unsupported_methods_are_refused() {
    let pool = TestPool::spawn().await;
    let mut miner = pool.connect().await;

    pretty_assert_eq!(
        miner.call(1, "mining.get_transactions", json!([])).await,
        json!({"id": 1, "result": null, "error": [20, "unsupported request mining.get_transactions", null]})
    );

    pretty_assert_eq!(
        miner.call(2, "mining.extranonce.subscribe", json!([])).await,
        json!({"id": 2, "result": true, "error": null})
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn junk_closes_the_connection() {
    let pool = TestPool::spawn().await;

    let mut miner = pool.connect().await;
    miner.send_line(b"GET / HTTP/1.1").await;
    assert!(miner.closed().await);

    let mut miner = pool.connect().await;
    let mut line = vec![b'a'; MAX_MESSAGE_SIZE + 1];
    line.push(b'\n');
    miner.writer.write_all(&line).await.ok();
    assert!(miner.closed().await);

    let mut miner = pool.connect().await;
    miner.login().await;

    pool.shutdown().await;
}

#[tokio::test]
async fn disconnected_miners_are_forgotten() {
    let pool = TestPool::spawn().await;

    let mut miner = pool.connect().await;
    miner.login().await;

    pretty_assert_eq!(pool.server.connections().len(), 1);

    drop(miner);

    for _ in 0..100 {
        if pool.server.connections().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(pool.server.connections().is_empty());

    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let pool = TestPool::spawn().await;

    let mut miner = pool.connect().await;
    miner.login().await;

    pool.shutdown().await;

    assert!(miner.closed().await);
}
